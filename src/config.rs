use crate::extensions::ExtensionBuilder;
use std::sync::Arc;
use std::time::Duration;

/// Automatic liveness pings driven by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPing {
    #[default]
    Disabled,
    Enabled(Duration),
}

#[derive(Clone)]
pub struct WebSocketConfig {
    /// Largest frame payload accepted from the peer. Oversized frames close
    /// the connection with 1009.
    pub max_frame_size: usize,
    /// Largest reassembled message. Oversized messages close with 1009.
    pub max_message_size: usize,
    pub auto_ping: AutoPing,
    /// How long to wait for the peer's close reply before dropping the
    /// transport.
    pub close_timeout: Duration,
    /// Validate text payloads at message boundaries, closing with 1007 on
    /// failure. Off by default; compliance suites should turn it on.
    pub validate_utf8: bool,
    /// Ordered list of extension builders to negotiate with.
    pub extensions: Vec<Arc<dyn ExtensionBuilder>>,
    /// Subprotocols this side is willing to speak, in preference order.
    pub subprotocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_frame_size: 16 << 10,
            max_message_size: 64 << 20,
            auto_ping: AutoPing::Disabled,
            close_timeout: Duration::from_secs(15),
            validate_utf8: false,
            extensions: Vec::new(),
            subprotocols: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
}
