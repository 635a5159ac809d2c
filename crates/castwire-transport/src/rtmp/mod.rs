//! RTMP publishing client.
//!
//! [`publish::establish`] runs the handshake and drives an rml_rtmp client
//! session through `connect` (with authentication when the server asks for
//! it) and `publish`, then hands the stream and session to an
//! [`sink::RtmpSink`] that the sender task publishes FLV tag bodies through.

mod connection;
mod handshake;
mod publish;
mod sink;
mod status;

pub(crate) use publish::establish;
pub(crate) use sink::RtmpSink;
