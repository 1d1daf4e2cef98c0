//! Wire protocol for the agent RPC socket.
//!
//! Frames are newline-delimited JSON over a Unix domain socket. Clients send
//! `req` frames; the server answers with a single `res` frame per request and
//! may interleave `event` frames (stream deltas, tool events) carrying the
//! request id before the final response.

pub mod frames;
pub mod methods;

pub use frames::{ErrorShape, EventFrame, InboundFrame, ReqFrame, ResFrame};

/// Hard cap on a single wire frame. Larger lines are a protocol error.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;
