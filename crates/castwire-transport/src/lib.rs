//! RTMP and SRT streaming client.
//!
//! This crate turns encoded frames into a live stream:
//! - [`StreamClient`] picks RTMP or SRT from the URL and owns the session
//! - RTMP sessions run the handshake, `connect`/`publish` commands and
//!   Adobe or Limelight authentication, and carry FLV tag bodies
//! - SRT sessions run the caller handshake and carry MPEG-TS
//! - a bounded send queue decouples the encoder from the socket
//!
//! Progress and failures are reported as [`ClientEvent`]s.

mod auth;
mod client;
mod config;
mod endpoint;
mod error;
pub mod mux;
mod pipeline;
mod queue;
mod rtmp;
mod session;
mod srt;

#[cfg(test)]
mod mock;

pub use auth::{Credentials, FixedNonce, NonceSource, RandomNonce};
pub use client::{RtmpClient, SrtClient, StreamClient};
pub use config::{ClientConfig, ReconnectPolicy};
pub use endpoint::{Endpoint, RtmpEndpoint, SrtEndpoint};
pub use error::{ConnectError, MuxError, ProtocolError, TransportError};
pub use mux::{FlvMuxer, MuxedPacket, Muxer, PacketKind, TsMuxer};

pub use castwire_ipc::{
    ClientEvent, ConnectionObserver, ConnectionState, FailureReason, TransportStatistics,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Port used when an rtmp:// URL has none.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Maximum reconnection attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay in milliseconds.
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;
