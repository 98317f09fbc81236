use crate::close::{CloseCode, CloseFrame};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::ExtensionPipeline;
use crate::frame::{Frame, OpCode};
use crate::message::Message;
use crate::state::StateMachine;
use crate::write::Writer;
use futures::future::BoxFuture;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// The inbound half: a lazy stream of reassembled messages. Control frames
/// never show up here; they are handled inside the reader task. The stream
/// ends after the close handshake completes or the transport dies.
///
/// `split` hands out exactly one of these per connection, which is what makes
/// the single-consumer contract hold.
pub struct WSReader {
    read_rx: ReceiverStream<Result<Message, Error>>,
}

impl WSReader {
    pub(crate) fn new(read_rx: ReceiverStream<Result<Message, Error>>) -> Self {
        Self { read_rx }
    }
}

impl Stream for WSReader {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read_rx).poll_next(cx)
    }
}

/// The outbound half. All sends funnel through the shared writer mutex, so
/// concurrent callers are serialized frame by frame, and every data frame
/// passes the send extension pipeline before the role-aware encoder masks it.
#[derive(Clone)]
pub struct WSWriter {
    pub(crate) writer: Arc<Mutex<Writer>>,
    pub(crate) state: Arc<Mutex<StateMachine>>,
    pub(crate) pipeline: Arc<Mutex<ExtensionPipeline>>,
    pub(crate) config: WebSocketConfig,
    pub(crate) closed: Arc<Notify>,
}

impl WSWriter {
    pub(crate) fn new(
        writer: Arc<Mutex<Writer>>,
        state: Arc<Mutex<StateMachine>>,
        pipeline: Arc<Mutex<ExtensionPipeline>>,
        config: WebSocketConfig,
        closed: Arc<Notify>,
    ) -> Self {
        Self {
            writer,
            state,
            pipeline,
            config,
            closed,
        }
    }

    async fn ensure_open(&self) -> Result<(), Error> {
        if self.state.lock().await.close_sent() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.write_message(message).await
    }

    // Send raw bytes as a text message
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Text(String::from_utf8(data)?))
            .await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.write_message(Message::Text(data)).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Binary(data)).await
    }

    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open().await?;
        self.write_control(Frame::control(OpCode::Ping, payload))
            .await
    }

    /// Unsolicited pong, usable as a one-way heartbeat.
    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open().await?;
        self.write_control(Frame::control(OpCode::Pong, payload))
            .await
    }

    /// Escape hatch for custom frames. The frame still runs through the
    /// extension pipeline and the role-aware encoder, and a close frame sent
    /// this way still counts against the one-close-per-connection rule.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.ensure_open().await?;
        if frame.opcode == OpCode::Close {
            self.state.lock().await.mark_close_sent();
        }
        let mut writer = self.writer.lock().await;
        let frame = self.pipeline.lock().await.process_to_send(frame)?;
        writer.write_frame(frame).await
    }

    /// Requests an orderly shutdown with `NormalClosure` and waits for the
    /// peer's close (bounded by `close_timeout`).
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.close(CloseCode::NormalClosure, String::new()).await
    }

    /// Sends a close frame once; repeated calls are no-ops and data writes
    /// after the first fail with `ConnectionClosed`. Waits up to
    /// `close_timeout` for the reader to observe the peer's close, then
    /// forces the transport shut.
    pub async fn close(&mut self, code: CloseCode, reason: String) -> Result<(), Error> {
        let close = self
            .state
            .lock()
            .await
            .close(CloseFrame::new(code, reason));

        let close = match close {
            Some(close) => close,
            None => return Ok(()),
        };

        self.write_control(Frame::control(OpCode::Close, close.encode()))
            .await?;

        if self.state.lock().await.is_closed() {
            return Ok(());
        }
        if timeout(self.config.close_timeout, self.closed.notified())
            .await
            .is_err()
        {
            let _ = self.writer.lock().await.shutdown().await;
        }
        Ok(())
    }

    /// Drops the outgoing half of the transport without a close handshake.
    pub async fn shutdown_transport(&mut self) -> Result<(), Error> {
        self.writer.lock().await.shutdown().await
    }

    /// The close frame the peer sent, available once the close handshake has
    /// finished.
    pub async fn remote_close_frame(&self) -> Option<CloseFrame> {
        self.state.lock().await.remote_close().cloned()
    }

    /// Splits a message into continuation frames of `fragment_size` bytes.
    pub async fn send_fragmented(
        &mut self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        if fragment_size == 0 || fragment_size > self.config.max_frame_size {
            return Err(Error::CustomFragmentSizeExceeded(
                fragment_size,
                self.config.max_frame_size,
            ));
        }
        self.write_message_with_fragment_size(message, fragment_size)
            .await
    }

    /// Streams one text message as a sequence of frames. The closure receives
    /// a [`MessageWriter`]; whatever is still buffered when the scope ends is
    /// flushed with fin=true, errors included, so the frame sequence stays
    /// well formed.
    pub async fn with_text_message_writer<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: for<'a> FnOnce(&'a mut MessageWriter) -> BoxFuture<'a, Result<(), Error>>,
    {
        self.with_message_writer(OpCode::Text, f).await
    }

    /// Binary flavor of [`with_text_message_writer`](Self::with_text_message_writer).
    pub async fn with_binary_message_writer<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: for<'a> FnOnce(&'a mut MessageWriter) -> BoxFuture<'a, Result<(), Error>>,
    {
        self.with_message_writer(OpCode::Binary, f).await
    }

    async fn with_message_writer<F>(&mut self, opcode: OpCode, f: F) -> Result<(), Error>
    where
        F: for<'a> FnOnce(&'a mut MessageWriter) -> BoxFuture<'a, Result<(), Error>>,
    {
        self.ensure_open().await?;
        let mut message_writer = MessageWriter {
            writer: self.writer.clone(),
            pipeline: self.pipeline.clone(),
            opcode,
            pending: None,
            started: false,
        };
        let result = f(&mut message_writer).await;

        // The pending frame goes out with fin=true even when the scope
        // failed, keeping the continuation sequence valid for the peer. A
        // single write leaves its buffer pending without any frame on the
        // wire yet, so check for buffered data as well as sent frames.
        let flushed = if message_writer.has_unflushed_data() || result.is_ok() {
            message_writer.finish().await
        } else {
            Ok(())
        };
        result.and(flushed)
    }

    pub(crate) async fn write_message(&mut self, message: Message) -> Result<(), Error> {
        let fragment_size = self.config.max_frame_size;
        self.write_message_with_fragment_size(message, fragment_size)
            .await
    }

    async fn write_message_with_fragment_size(
        &mut self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        self.ensure_open().await?;
        if message.len() > self.config.max_message_size {
            return Err(Error::MaxMessageSize);
        }

        let opcode = message.opcode();
        let collapsed = Frame::new(true, opcode, message.into_payload());

        // Hold the writer across transform + write so concurrent senders
        // can't interleave their frames with ours, which would desync the
        // compressor context on the peer.
        let mut writer = self.writer.lock().await;
        let frame = self.pipeline.lock().await.process_to_send(collapsed)?;

        if frame.payload.len() <= fragment_size {
            return writer.write_frame(frame).await;
        }

        let chunks: Vec<&[u8]> = frame.payload.chunks(fragment_size).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut fragment = Frame::new(
                i == last,
                if i == 0 { opcode } else { OpCode::Continue },
                chunk.to_vec(),
            );
            // rsv bits from the pipeline apply to the first frame only
            if i == 0 {
                fragment.rsv1 = frame.rsv1;
                fragment.rsv2 = frame.rsv2;
                fragment.rsv3 = frame.rsv3;
            }
            writer.write_frame(fragment).await?;
        }
        Ok(())
    }

    async fn write_control(&mut self, frame: Frame) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let frame = self.pipeline.lock().await.process_to_send(frame)?;
        writer.write_frame(frame).await
    }
}

/// Streams a single message as multiple frames. Each `write` holds its buffer
/// until the next one arrives, so the final buffer can be flagged fin=true
/// when the scope closes.
pub struct MessageWriter {
    writer: Arc<Mutex<Writer>>,
    pipeline: Arc<Mutex<ExtensionPipeline>>,
    opcode: OpCode,
    pending: Option<Vec<u8>>,
    started: bool,
}

impl MessageWriter {
    pub async fn write(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if let Some(pending) = self.pending.take() {
            self.flush_frame(pending, false).await?;
        }
        self.pending = Some(data);
        Ok(())
    }

    // True once the message must be completed: either a frame already went
    // out (fin=false) or a buffer is still waiting for its fin flag.
    fn has_unflushed_data(&self) -> bool {
        self.started || self.pending.is_some()
    }

    async fn flush_frame(&mut self, payload: Vec<u8>, fin: bool) -> Result<(), Error> {
        let opcode = if self.started {
            OpCode::Continue
        } else {
            self.opcode
        };
        self.started = true;

        let mut writer = self.writer.lock().await;
        let frame = self
            .pipeline
            .lock()
            .await
            .process_to_send(Frame::new(fin, opcode, payload))?;
        writer.write_frame(frame).await
    }

    async fn finish(&mut self) -> Result<(), Error> {
        let pending = self.pending.take().unwrap_or_default();
        self.flush_frame(pending, true).await
    }
}
