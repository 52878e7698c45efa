//! Relay Protocol Definitions
//!
//! This crate defines the wire messages exchanged with the identity-aware
//! relay, the length-prefixed codec that frames them, and the stream
//! multiplexing frames carried inside a relay byte stream.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, RelayCodec};
pub use messages::*;
pub use mux::{MuxCodec, MuxError, MuxFrame, StreamId};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default receive window advertised by a client (bytes of unacknowledged data)
pub const DEFAULT_RECEIVE_WINDOW: u32 = 256 * 1024;
