//! Wire framing shared by the RPC client and server.
//!
//! A frame on the wire is `[len: u16][processor_id: u8][body]`, where `body`
//! is the bytes produced by the [`Processor`] identified by `processor_id`
//! encoding a [`Frame`]. The processor is pluggable so a future codec
//! (msgpack, a compact varint scheme, ...) can be added without touching
//! the client/server transport code, which only ever sees bytes.

mod frame;
mod processor;

pub use frame::{Frame, RequestFrame, ResponseFrame};
pub use processor::{JsonProcessor, Processor, ProcessorRegistry, RawProcessor};

/// Maximum body size representable with the 2-byte length prefix.
pub const MAX_BODY_LEN: usize = u16::MAX as usize - 1;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame body of {0} bytes exceeds the {MAX_BODY_LEN} byte limit")]
    TooLarge(usize),
    #[error("unknown processor id {0}")]
    UnknownProcessor(u8),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}
