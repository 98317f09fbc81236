//! Async WebSocket engine for the Tokio stack.
//!
//! This library implements the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! for both servers and clients over any byte-oriented duplex transport:
//! handshakes, frame decoding and masking, fragmented-message reassembly,
//! control-frame handling, automatic liveness pings, and the
//! `permessage-deflate` compression extension
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! A connection splits into a [`split::WSReader`], a `Stream` of reassembled
//! messages, and a [`split::WSWriter`] that serializes outbound frames. The
//! [`session`] and [`server`] modules compose the two with a user handler and
//! graceful-shutdown semantics.

pub mod close;
pub mod config;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod message;
mod read;
pub mod request;
pub mod server;
pub mod session;
pub mod split;
pub mod state;
pub mod stream;
mod utils;
mod write;


/// Which end of the connection this side is. Clients mask every outbound
/// frame; servers never do, and each side enforces the other's obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}
