//! SRT caller in live mode, carrying MPEG-TS.

mod handshake;
pub(crate) mod packet;
mod sink;

pub(crate) use handshake::{handshake, open};
pub(crate) use sink::SrtSink;
