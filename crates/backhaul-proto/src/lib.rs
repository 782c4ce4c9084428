//! Backhaul Protocol Definitions
//!
//! Wire formats shared by the exposure server and the agent: the one-shot
//! handshake that authenticates a link, and the frames multiplexed over it
//! afterwards.

pub mod codec;
pub mod handshake;
pub mod mux;

pub use codec::FrameCodec;
pub use handshake::{read_message, write_message, Command, HandshakeError, Message};
pub use mux::{Frame, FrameFlags, FrameType, MuxError, StreamId};

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
