//! Control protocol: the typed, self-describing messages carried on the two
//! reserved channels of a session, plus the out-of-band PTY-control frames.

mod codec;
mod error;
mod msg;
mod pty;

pub use codec::*;
pub use error::*;
pub use msg::*;
pub use pty::*;
