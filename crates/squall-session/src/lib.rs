//! The session core: establishment over a mux'd connection, the two-channel
//! control protocol, the dispatch loop, the port-forward engine, the
//! foreground pipe, and the master-side SOCKS surface.

mod dispatch;
mod error;
pub mod foreground;
pub mod forward;
mod session;
pub mod socks;

pub use dispatch::*;
pub use error::*;
pub use foreground::{ForegroundJob, ForegroundRunner, PtySize, request_foreground};
pub use forward::{DEFAULT_UDP_IDLE_TIMEOUT, ForwardSpec, request_remote_forward};
pub use session::*;
