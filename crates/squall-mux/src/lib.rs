//! Stream multiplexer: turns one reliable, ordered byte stream into many
//! independently flow-controlled channels with open/accept semantics on both
//! sides.
//!
//! The ordering contract callers rely on: the k-th successful `open` on one
//! side is matched by the k-th successful `accept` on the other. Frames for
//! all channels travel a single write queue, so anything written to an
//! existing channel before an `open` is observed by the peer before the
//! matching accept.

mod channel;
mod error;
pub mod frame;
mod mux;

pub use channel::*;
pub use error::*;
pub use mux::*;
