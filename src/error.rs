use crate::close::CloseCode;
use httparse::Error as HttpParseError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // Channel / task errors
    #[error("channel communication error")]
    CommunicationError,

    #[error("connection is already closed")]
    ConnectionClosed,

    // General errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Handshake errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedWebsocketVersion,

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("upgrade declined with HTTP status {0}")]
    UpgradeDeclined(u16),

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("server negotiated extension `{0}` that was never offered")]
    UnsolicitedExtension(String),

    #[error("server selected subprotocol `{0}` that was never offered")]
    UnsolicitedSubprotocol(String),

    // Framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("fragment_size: `{0}` can't be greater than max_frame_size: `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("Invalid Opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("received an unmasked frame from a client")]
    UnmaskedFrame,

    #[error("received a masked frame from a server")]
    MaskedFrame,

    #[error("close frame with an invalid payload")]
    InvalidClosePayload,

    #[error("close code {0} must not appear on the wire")]
    DisallowedCloseCode(u16),

    // Fragmentation errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    // HTTP / URL errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    // Compression / decompression errors
    #[error("max_window_bits should be a value between 9 and 15")]
    InvalidMaxWindowBits,

    #[error("failed to compress message: {0}")]
    CompressionError(String),

    #[error("failed to decompress message: {0}")]
    DecompressionError(String),

    #[error("decompressed message exceeds the configured cap")]
    MaxDecompressedSize,
}

impl Error {
    /// The close code this failure maps to on the wire, if it is a protocol
    /// level failure at all. IO and handshake errors return `None`: there is
    /// no WebSocket connection to close gracefully.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::RSVNotZero
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::InvalidOpcode(_)
            | Error::UnmaskedFrame
            | Error::MaskedFrame
            | Error::InvalidClosePayload
            | Error::DisallowedCloseCode(_)
            | Error::InvalidFrameFragmentation
            | Error::InvalidContinuationFrame => Some(CloseCode::ProtocolError),

            Error::MaxFrameSize | Error::MaxMessageSize => Some(CloseCode::MessageTooBig),

            Error::FromUtf8Error { .. } => Some(CloseCode::InvalidFramePayloadData),

            Error::DecompressionError(_) | Error::MaxDecompressedSize => {
                Some(CloseCode::UnsupportedData)
            }

            _ => None,
        }
    }
}
