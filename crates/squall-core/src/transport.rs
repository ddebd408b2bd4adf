//! The underlying wire. The session layer only ever sees an
//! [`AbstractStream`](crate::AbstractStream) plus a remote-endpoint label;
//! plain TCP is the one transport carried here, and anything else (TLS,
//! WebSocket, QUIC) slots in behind the same trait.

use std::{io, net::SocketAddr, time::Duration};

use eyre::Context as _;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{AbstractStream, types::TargetAddr, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One dialable / bindable wire.
pub trait AbstractTransport: Send + Sync {
	type Stream: AbstractStream + 'static;

	/// Connect to the remote endpoint. Returns the stream and its
	/// remote-endpoint label.
	fn dial(&self) -> impl Future<Output = eyre::Result<(Self::Stream, String)>> + Send;
}

pub struct TcpTransport {
	pub addr: TargetAddr,
}

impl AbstractTransport for TcpTransport {
	type Stream = TcpStream;

	async fn dial(&self) -> eyre::Result<(TcpStream, String)> {
		let addr = self
			.addr
			.resolve()
			.await
			.with_context(|| format!("resolving {}", self.addr))?;
		let stream = TcpStream::connect(addr)
			.await
			.with_context(|| format!("connecting to {}", self.addr))?;
		stream.set_nodelay(true)?;
		let label = stream
			.peer_addr()
			.map(|a| a.to_string())
			.unwrap_or_else(|_| self.addr.to_string());
		Ok((stream, label))
	}
}

impl TcpTransport {
	pub async fn bind(&self) -> eyre::Result<TcpListener> {
		let addr = self
			.addr
			.resolve()
			.await
			.with_context(|| format!("resolving {}", self.addr))?;
		TcpListener::bind(addr)
			.await
			.with_context(|| format!("listening on {}", self.addr))
	}
}

/// Accept the next connection, retrying transient failures after a short
/// delay. Returns `None` once the token fires or the listener reports a
/// closed-socket error.
pub async fn accept_retry(
	listener: &TcpListener,
	cancel: &CancellationToken,
) -> Option<(TcpStream, SocketAddr)> {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return None,
			res = listener.accept() => match res {
				Ok(pair) => return Some(pair),
				Err(err) if is_closed(&err) => return None,
				Err(err) => {
					warn!(target: "[ACCEPT]", "transient accept error: {err}");
					tokio::select! {
						_ = cancel.cancelled() => return None,
						_ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
					}
				}
			}
		}
	}
}

fn is_closed(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput | io::ErrorKind::BrokenPipe
	)
}

/// Turn on TCP keep-alive with OS-default timings.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
	SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new())
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn accept_retry_returns_none_on_cancel() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let cancel = CancellationToken::new();
		cancel.cancel();
		assert!(accept_retry(&listener, &cancel).await.is_none());
	}

	#[tokio::test]
	async fn tcp_transport_dials_a_listener() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let transport = TcpTransport { addr: addr.into() };
		let (dialed, accepted) = tokio::join!(transport.dial(), listener.accept());
		let (_, label) = dialed.unwrap();
		assert!(accepted.is_ok());
		assert_eq!(label, addr.to_string());
	}
}
