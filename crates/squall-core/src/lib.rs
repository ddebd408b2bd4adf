mod context;
pub mod io;
pub mod log;
pub mod seed;
mod stream;
pub mod transport;
pub mod types;

pub use context::*;
pub use stream::*;
