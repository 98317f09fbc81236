use crate::close::CloseCode;
use crate::close::CloseFrame;
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::ExtensionPipeline;
use crate::frame::{Frame, OpCode};
use crate::message::Message;
use crate::state::StateMachine;
use crate::stream::TransportReader;
use crate::write::Writer;
use crate::Role;
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::Sender;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

// Guards payload reads against peers that advertise a length and then stall,
// holding the connection hostage after the handshake.
const PAYLOAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    rsv1: bool,
}

/// Owns the read half of the transport and drives the whole inbound side:
/// frame decoding, fragment reassembly, control-frame routing through the
/// state machine, and handing finished messages to the consumer channel.
pub struct ReadStream {
    buf_reader: TransportReader,
    role: Role,
    fragmented_message: Option<FragmentedMessage>,
    read_tx: Sender<Result<Message, Error>>,
    writer: Arc<Mutex<Writer>>,
    state: Arc<Mutex<StateMachine>>,
    pipeline: Arc<Mutex<ExtensionPipeline>>,
    config: WebSocketConfig,
    closed: Arc<Notify>,
    rsv1_allowed: bool,
}

impl ReadStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buf_reader: TransportReader,
        role: Role,
        read_tx: Sender<Result<Message, Error>>,
        writer: Arc<Mutex<Writer>>,
        state: Arc<Mutex<StateMachine>>,
        pipeline: Arc<Mutex<ExtensionPipeline>>,
        config: WebSocketConfig,
        closed: Arc<Notify>,
        rsv1_allowed: bool,
    ) -> Self {
        Self {
            buf_reader,
            role,
            fragmented_message: None,
            read_tx,
            writer,
            state,
            pipeline,
            config,
            closed,
            rsv1_allowed,
        }
    }

    /// The reader task entry point. Runs until the close handshake completes
    /// or the transport dies; protocol violations are converted into a close
    /// frame here and surfaced to the consumer as an error before the stream
    /// ends.
    pub async fn poll_messages(mut self) {
        if let Err(error) = self.run_loop().await {
            match error.close_code() {
                Some(code) => {
                    debug!("closing connection after protocol failure: {}", error);
                    self.initiate_close(code).await;
                    let drain = timeout(self.config.close_timeout, self.drain_until_close());
                    if drain.await.is_err() {
                        debug!("peer never acknowledged the close, giving up the drain");
                    }
                }
                None => self.state.lock().await.transport_lost(),
            }
            let _ = self.read_tx.send(Err(error)).await;
        }

        // Extensions shut down exactly once, after the reader loop is done.
        self.pipeline.lock().await.shutdown();
        self.closed.notify_waiters();
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            // Once our close frame is out, the peer owes us one back within
            // the close timeout.
            let closing = self.state.lock().await.close_sent();
            let frame = if closing {
                timeout(self.config.close_timeout, self.read_frame()).await??
            } else {
                self.read_frame().await?
            };

            if self.handle_frame(frame).await? {
                return Ok(());
            }
        }
    }

    /// Processes one decoded frame. Returns true once the close handshake is
    /// complete and the loop should stop.
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, Error> {
        match frame.opcode {
            // A fragmented message starts with a non-final text/binary frame
            OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                if self.fragmented_message.is_some() {
                    return Err(Error::InvalidFrameFragmentation);
                }
                if frame.payload.len() > self.config.max_message_size {
                    return Err(Error::MaxMessageSize);
                }
                self.fragmented_message = Some(FragmentedMessage {
                    op_code: frame.opcode,
                    rsv1: frame.rsv1,
                    fragments: frame.payload,
                });
                Ok(false)
            }
            OpCode::Continue => {
                let fragmented = self
                    .fragmented_message
                    .as_mut()
                    .ok_or(Error::InvalidContinuationFrame)?;
                fragmented.fragments.extend_from_slice(&frame.payload);
                if fragmented.fragments.len() > self.config.max_message_size {
                    return Err(Error::MaxMessageSize);
                }

                if frame.final_fragment {
                    if let Some(fragmented) = self.fragmented_message.take() {
                        let mut collapsed =
                            Frame::new(true, fragmented.op_code, fragmented.fragments);
                        collapsed.rsv1 = fragmented.rsv1;
                        self.transmit_message(collapsed).await?;
                    }
                }
                Ok(false)
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragmented_message.is_some() {
                    return Err(Error::InvalidFrameFragmentation);
                }
                if frame.payload.len() > self.config.max_message_size {
                    return Err(Error::MaxMessageSize);
                }
                self.transmit_message(frame).await?;
                Ok(false)
            }
            OpCode::Close => {
                let reply = self.state.lock().await.received_close(&frame.payload);
                if let Some(close) = reply {
                    let write = self
                        .writer
                        .lock()
                        .await
                        .write_frame(Frame::control(OpCode::Close, close.encode()))
                        .await;
                    if let Err(error) = write {
                        debug!("failed to acknowledge close: {}", error);
                    }
                }
                Ok(true)
            }
            OpCode::Ping => {
                let pong = self.state.lock().await.received_ping(frame.payload);
                if let Some(payload) = pong {
                    self.writer
                        .lock()
                        .await
                        .write_frame(Frame::control(OpCode::Pong, payload))
                        .await?;
                }
                Ok(false)
            }
            OpCode::Pong => {
                self.state.lock().await.received_pong(&frame.payload);
                Ok(false)
            }
        }
    }

    /// Collapses a finished message through the receive pipeline and hands it
    /// to the consumer.
    async fn transmit_message(&mut self, frame: Frame) -> Result<(), Error> {
        let frame = self.pipeline.lock().await.process_received(frame)?;

        let message = if self.config.validate_utf8 {
            Message::from_frame(frame)?
        } else {
            Message::from_frame_lossy(frame)
        };

        self.read_tx
            .send(Ok(message))
            .await
            .map_err(|_| Error::CommunicationError)
    }

    /// Sends our close frame for a protocol failure, unless one already went
    /// out.
    async fn initiate_close(&mut self, code: CloseCode) {
        let close = self
            .state
            .lock()
            .await
            .close(CloseFrame::new(code, String::new()));
        if let Some(close) = close {
            let write = self
                .writer
                .lock()
                .await
                .write_frame(Frame::control(OpCode::Close, close.encode()))
                .await;
            if let Err(error) = write {
                warn!("failed to send close frame: {}", error);
            }
        }
    }

    /// After a failure close, keep consuming frames until the peer's close
    /// shows up so the handshake finishes cleanly.
    async fn drain_until_close(&mut self) {
        loop {
            match self.read_frame().await {
                Ok(frame) if frame.opcode == OpCode::Close => {
                    self.state.lock().await.received_close(&frame.payload);
                    return;
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; 2];

        self.buf_reader.read_exact(&mut header).await?;

        // Top bit of the first byte is fin, then the three reserved bits,
        // with the opcode in the low nibble
        let final_fragment = (header[0] & 0b10000000) != 0;
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // rsv2/rsv3 have no negotiated meaning here, ever; rsv1 is only valid
        // on the first data frame of a message when an extension claimed it
        if rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }
        if rsv1 && (!self.rsv1_allowed || opcode.is_control() || opcode == OpCode::Continue) {
            return Err(Error::RSVNotZero);
        }

        if !final_fragment && opcode.is_control() {
            return Err(Error::ControlFramesFragmented);
        }

        let masked = (header[1] & 0b10000000) != 0;

        // Clients must mask, servers must not; either violation kills the
        // connection with a protocol error
        match self.role {
            Role::Server if !masked => return Err(Error::UnmaskedFrame),
            Role::Client if masked => return Err(Error::MaskedFrame),
            _ => {}
        }

        let mut length = (header[1] & 0b01111111) as usize;

        // Control frames fit in the 7-bit length form, 125 bytes at most; a
        // multi-byte length marker on a control frame is already an error
        if length > 125 && opcode.is_control() {
            return Err(Error::ControlFramePayloadSize);
        }

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            length = u64::from_be_bytes(be_bytes) as usize;
        }

        if length > self.config.max_frame_size {
            return Err(Error::MaxFrameSize);
        }

        let mask = if masked {
            let mut mask = [0u8; 4];
            self.buf_reader.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];
        if length > 0 {
            timeout(PAYLOAD_READ_TIMEOUT, self.buf_reader.read_exact(&mut payload)).await??;
        }

        // Unmasking is the same XOR the sender applied: payload[i] ^ key[i % 4]
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Frame {
            final_fragment,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            payload,
        })
    }
}
