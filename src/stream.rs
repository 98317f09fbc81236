use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};

/// Any byte-oriented duplex transport the engine can run over. TCP streams,
/// TLS streams and in-memory duplex pipes all qualify; the caller owns
/// whatever security layer sits below.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub(crate) type TransportStream = Box<dyn Transport>;
pub(crate) type TransportReader = BufReader<ReadHalf<TransportStream>>;
pub(crate) type TransportWriter = WriteHalf<TransportStream>;
