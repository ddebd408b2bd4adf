use tokio::io::{AsyncRead, AsyncWrite};

/// A reliable, ordered, bidirectional byte stream. Everything the session
/// layer runs over (plain TCP today, a mux channel, an in-memory duplex in
/// tests) presents this shape.
pub trait AbstractStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AbstractStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
