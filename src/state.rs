use crate::close::{CloseCode, CloseFrame};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, Instant};

/// Where the connection sits in its lifetime. `Open` additionally carries the
/// liveness-ping bookkeeping, which only the connection's own tasks mutate.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Open {
        last_ping_time: Option<Instant>,
        ping_payload: Vec<u8>,
    },
    Closing,
    Closed {
        remote_close: Option<CloseFrame>,
    },
}

/// Outcome of an auto-ping tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingAction {
    /// Send a ping with this payload.
    Ping(Vec<u8>),
    /// A ping is already in flight and hasn't timed out yet.
    Wait,
    /// The peer never answered the previous ping within one period.
    Timeout,
    /// The connection is closing or closed; stop the ping task.
    Stop,
}

/// Tracks `open -> closing -> closed` and decides every control-frame
/// response. Pure state: methods return what should be sent, the caller does
/// the I/O, and the `close_sent` latch guarantees at most one close frame
/// ever leaves this side.
pub struct StateMachine {
    state: ConnectionState,
    close_sent: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Open {
                last_ping_time: None,
                ping_payload: Vec::new(),
            },
            close_sent: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed { .. })
    }

    /// The close frame the peer sent, once the handshake finished.
    pub fn remote_close(&self) -> Option<&CloseFrame> {
        match &self.state {
            ConnectionState::Closed { remote_close } => remote_close.as_ref(),
            _ => None,
        }
    }

    /// Local close request. Returns the close frame to send the first time;
    /// closing an already closing/closed connection is a no-op.
    pub fn close(&mut self, close: CloseFrame) -> Option<CloseFrame> {
        match self.state {
            ConnectionState::Open { .. } => {
                self.state = ConnectionState::Closing;
                self.mark_close_sent().then_some(close)
            }
            _ => None,
        }
    }

    /// Peer sent a close frame. Returns the reply to send, if any: a
    /// `ProtocolError` close for a malformed payload, a `NormalClosure`
    /// acknowledgement otherwise. When we already initiated the close, the
    /// received close just completes the handshake.
    pub fn received_close(&mut self, payload: &[u8]) -> Option<CloseFrame> {
        let (remote_close, reply) = match CloseFrame::parse(payload) {
            Ok(remote) => (
                remote,
                CloseFrame::new(CloseCode::NormalClosure, String::new()),
            ),
            Err(_) => (
                None,
                CloseFrame::new(CloseCode::ProtocolError, String::new()),
            ),
        };

        let was_open = self.is_open();
        self.state = ConnectionState::Closed { remote_close };

        if was_open && self.mark_close_sent() {
            Some(reply)
        } else {
            None
        }
    }

    /// Auto-ping tick. Issues a fresh 16-byte random payload when no ping is
    /// outstanding, waits while one is in flight, and reports a timeout once
    /// the outstanding ping is older than one period.
    pub fn send_ping(&mut self, now: Instant, period: Duration) -> PingAction {
        match &mut self.state {
            ConnectionState::Open {
                last_ping_time,
                ping_payload,
            } => match last_ping_time {
                None => {
                    let mut rng = StdRng::from_rng(&mut rand::thread_rng());
                    let payload = rng.random::<[u8; 16]>().to_vec();
                    *ping_payload = payload.clone();
                    *last_ping_time = Some(now);
                    PingAction::Ping(payload)
                }
                Some(sent_at) => {
                    if now.duration_since(*sent_at) < period {
                        PingAction::Wait
                    } else {
                        PingAction::Timeout
                    }
                }
            },
            _ => PingAction::Stop,
        }
    }

    /// A pong only settles the outstanding ping when its payload echoes ours;
    /// unsolicited or stale pongs are tolerated and ignored.
    pub fn received_pong(&mut self, payload: &[u8]) {
        if let ConnectionState::Open {
            last_ping_time,
            ping_payload,
        } = &mut self.state
        {
            if last_ping_time.is_some() && payload == ping_payload.as_slice() {
                *last_ping_time = None;
            }
        }
    }

    /// Pings are answered while open or closing, never after close.
    pub fn received_ping(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        match self.state {
            ConnectionState::Open { .. } | ConnectionState::Closing => Some(payload),
            ConnectionState::Closed { .. } => None,
        }
    }

    /// Records that the single allowed close frame is spoken for. Returns
    /// false when one was already sent.
    pub fn mark_close_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.close_sent, true)
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Transport died mid-connection; no close frame was received.
    pub fn transport_lost(&mut self) {
        if !self.is_closed() {
            self.state = ConnectionState::Closed { remote_close: None };
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_transitions_open_to_closing() {
        let mut machine = StateMachine::new();
        let close = CloseFrame::new(CloseCode::NormalClosure, "");
        assert!(machine.close(close.clone()).is_some());
        assert!(matches!(machine.state(), ConnectionState::Closing));
        // second close is swallowed
        assert!(machine.close(close).is_none());
    }

    #[test]
    fn received_close_while_open_acknowledges() {
        let mut machine = StateMachine::new();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");

        let reply = machine.received_close(&payload).unwrap();
        assert_eq!(reply.code, CloseCode::NormalClosure);
        assert!(machine.is_closed());
        assert_eq!(
            machine.remote_close().unwrap().reason,
            "done".to_string()
        );
    }

    #[test]
    fn received_close_while_closing_stays_silent() {
        let mut machine = StateMachine::new();
        machine.close(CloseFrame::new(CloseCode::NormalClosure, ""));
        assert!(machine.received_close(&1000u16.to_be_bytes()).is_none());
        assert!(machine.is_closed());
    }

    #[test]
    fn received_bad_close_code_replies_protocol_error() {
        let mut machine = StateMachine::new();
        let reply = machine.received_close(&999u16.to_be_bytes()).unwrap();
        assert_eq!(reply.code, CloseCode::ProtocolError);
    }

    #[test]
    fn one_byte_close_payload_replies_protocol_error() {
        let mut machine = StateMachine::new();
        let reply = machine.received_close(&[0x03]).unwrap();
        assert_eq!(reply.code, CloseCode::ProtocolError);
    }

    #[test]
    fn ping_lifecycle() {
        let mut machine = StateMachine::new();
        let period = Duration::from_millis(50);
        let start = Instant::now();

        let payload = match machine.send_ping(start, period) {
            PingAction::Ping(payload) => payload,
            other => panic!("expected ping, got {:?}", other),
        };
        assert_eq!(payload.len(), 16);

        // in flight, not yet expired
        assert_eq!(
            machine.send_ping(start + Duration::from_millis(10), period),
            PingAction::Wait
        );

        // wrong payload is ignored
        machine.received_pong(b"not-the-payload");
        assert_eq!(
            machine.send_ping(start + Duration::from_millis(20), period),
            PingAction::Wait
        );

        // matching pong settles the ping; the next tick issues a new one
        machine.received_pong(&payload);
        assert!(matches!(
            machine.send_ping(start + Duration::from_millis(30), period),
            PingAction::Ping(_)
        ));
    }

    #[test]
    fn unanswered_ping_times_out() {
        let mut machine = StateMachine::new();
        let period = Duration::from_millis(50);
        let start = Instant::now();

        assert!(matches!(
            machine.send_ping(start, period),
            PingAction::Ping(_)
        ));
        assert_eq!(
            machine.send_ping(start + Duration::from_millis(60), period),
            PingAction::Timeout
        );
    }

    #[test]
    fn ping_stops_after_close() {
        let mut machine = StateMachine::new();
        machine.close(CloseFrame::new(CloseCode::NormalClosure, ""));
        assert_eq!(
            machine.send_ping(Instant::now(), Duration::from_millis(50)),
            PingAction::Stop
        );
    }

    #[test]
    fn pings_are_answered_while_closing() {
        let mut machine = StateMachine::new();
        machine.close(CloseFrame::new(CloseCode::NormalClosure, ""));
        assert_eq!(machine.received_ping(b"hb".to_vec()), Some(b"hb".to_vec()));

        machine.received_close(&1000u16.to_be_bytes());
        assert_eq!(machine.received_ping(b"hb".to_vec()), None);
    }
}
