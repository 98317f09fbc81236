use crate::close::{CloseCode, CloseFrame};
use crate::config::{AutoPing, WebSocketConfig};
use crate::error::Error;
use crate::extensions::ExtensionPipeline;
use crate::frame::{Frame, OpCode};
use crate::message::Message;
use crate::read::ReadStream;
use crate::split::{WSReader, WSWriter};
use crate::state::{PingAction, StateMachine};
use crate::stream::{TransportReader, TransportWriter};
use crate::write::Writer;
use crate::Role;
use futures::Stream;
use log::{debug, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{interval, Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

const READ_CHANNEL_CAPACITY: usize = 64;

/// One established WebSocket connection. Owns nothing directly: the reader
/// task and optional auto-ping task are already running in the background,
/// and this handle is just the two user-facing halves glued together.
pub struct WSConnection {
    reader: WSReader,
    writer: WSWriter,
    protocol: Option<String>,
}

impl WSConnection {
    /// Wires up a connection over an upgraded transport: spawns the reader
    /// loop and (when configured) the auto-ping task. The buffered reader
    /// comes straight from the handshake so that frames pipelined behind the
    /// upgrade are not lost.
    pub(crate) fn spawn(
        buf_reader: TransportReader,
        write_half: TransportWriter,
        role: Role,
        config: WebSocketConfig,
        pipeline: ExtensionPipeline,
        protocol: Option<String>,
    ) -> Self {
        let rsv1_allowed = pipeline.allows_rsv1();
        let writer = Arc::new(Mutex::new(Writer::new(write_half, role)));
        let state = Arc::new(Mutex::new(StateMachine::new()));
        let pipeline = Arc::new(Mutex::new(pipeline));
        let closed = Arc::new(Notify::new());
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);

        let read_stream = ReadStream::new(
            buf_reader,
            role,
            read_tx,
            writer.clone(),
            state.clone(),
            pipeline.clone(),
            config.clone(),
            closed.clone(),
            rsv1_allowed,
        );
        tokio::spawn(read_stream.poll_messages());

        if let AutoPing::Enabled(period) = config.auto_ping {
            tokio::spawn(auto_ping_loop(
                period,
                state.clone(),
                writer.clone(),
            ));
        }

        let ws_writer = WSWriter::new(writer, state, pipeline, config, closed);
        WSConnection {
            reader: WSReader::new(ReceiverStream::new(read_rx)),
            writer: ws_writer,
            protocol,
        }
    }

    /// Splits into the single inbound stream and the outbound writer, so the
    /// two sides can live on different tasks.
    pub fn split(self) -> (WSReader, WSWriter) {
        (self.reader, self.writer)
    }

    /// The subprotocol agreed during the handshake, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send(data).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.writer.send_ping(payload).await
    }

    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.writer.send_frame(frame).await
    }

    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.writer.close_connection().await
    }

    /// The close frame the peer sent, available once the close handshake has
    /// finished.
    pub async fn remote_close_frame(&self) -> Option<CloseFrame> {
        self.writer.remote_close_frame().await
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_next(cx)
    }
}

/// Periodic liveness task. Each tick asks the state machine what to do: emit
/// a fresh ping, keep waiting, or give up on an unanswered one and close with
/// 1001 "Ping timeout".
async fn auto_ping_loop(
    period: Duration,
    state: Arc<Mutex<StateMachine>>,
    writer: Arc<Mutex<Writer>>,
) {
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;

        let action = state.lock().await.send_ping(Instant::now(), period);
        match action {
            PingAction::Ping(payload) => {
                let write = writer
                    .lock()
                    .await
                    .write_frame(Frame::control(OpCode::Ping, payload))
                    .await;
                if let Err(error) = write {
                    debug!("ping write failed, stopping the ping task: {}", error);
                    return;
                }
            }
            PingAction::Wait => {}
            PingAction::Timeout => {
                warn!("peer missed the ping deadline, closing");
                let close = state
                    .lock()
                    .await
                    .close(CloseFrame::new(CloseCode::GoingAway, "Ping timeout"));
                if let Some(close) = close {
                    let write = writer
                        .lock()
                        .await
                        .write_frame(Frame::control(OpCode::Close, close.encode()))
                        .await;
                    if let Err(error) = write {
                        debug!("failed to send ping-timeout close: {}", error);
                    }
                }
                return;
            }
            PingAction::Stop => return,
        }
    }
}
