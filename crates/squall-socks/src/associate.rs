use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use futures_util::SinkExt as _;
use tokio::net::UdpSocket;
use tokio_stream::StreamExt as _;
use tokio_util::{codec::Framed, sync::CancellationToken};
use squall_core::{AbstractStream, debug, types::TargetAddr, warn};
use squall_proto::{Message, MessageCodec};

use crate::{BindSocketSnafu, SocksError, udp::bind_relay_socket};

const DATAGRAM_BUF: usize = 64 * 1024;

/// Slave side of a SOCKS UDP ASSOCIATE: open a local packet socket and pump
/// both ways. `SocksDatagram` messages arriving on the channel are emitted
/// to their `{addr, port}`; datagrams received on the socket are framed back
/// with the peer's address in the source field.
///
/// Ends when the channel closes or the token fires; both pumps stop and the
/// socket is released exactly once (it is owned here).
pub async fn serve_associate<S>(channel: S, cancel: &CancellationToken) -> Result<(), SocksError>
where
	S: AbstractStream,
{
	let socket = UdpSocket::from_std(bind_relay_socket(None).map_err(|source| {
		use snafu::IntoError as _;
		BindSocketSnafu.into_error(source)
	})?)?;
	let local_is_v6 = socket.local_addr()?.is_ipv6();
	let mut framed = Framed::new(channel, MessageCodec);
	let mut buf = vec![0u8; DATAGRAM_BUF];

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			msg = framed.next() => {
				let msg = match msg {
					None => break,
					Some(Err(err)) => return Err(err.into()),
					Some(Ok(msg)) => msg,
				};
				let (addr, port, data) = match msg {
					Message::SocksDatagram { addr, port, data } => (addr, port, data),
					other => {
						warn!(target: "[ASSOC]", "ignoring {} on a udp relay channel", other.tag());
						continue;
					}
				};
				match resolve_peer(&addr, port, local_is_v6).await {
					Ok(peer) => {
						if let Err(err) = socket.send_to(&data, peer).await {
							debug!(target: "[ASSOC]", "send to {peer} failed: {err}");
						}
					}
					Err(err) => debug!(target: "[ASSOC]", "cannot resolve {addr}:{port}: {err}"),
				}
			}
			received = socket.recv_from(&mut buf) => {
				let (len, from) = received?;
				let msg = Message::SocksDatagram {
					addr: from.ip().to_string(),
					port: from.port(),
					data: Bytes::copy_from_slice(&buf[..len]),
				};
				framed.send(msg).await?;
			}
		}
	}

	Ok(())
}

/// Resolve a datagram target, mapping v4 onto a dual-stack v6 socket when
/// needed.
async fn resolve_peer(host: &str, port: u16, local_is_v6: bool) -> std::io::Result<SocketAddr> {
	let addr = TargetAddr::new(host, port).resolve().await?;
	Ok(match (addr, local_is_v6) {
		(SocketAddr::V4(v4), true) => {
			SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
		}
		(addr, _) => addr,
	})
}

#[cfg(test)]
mod test {
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::Framed;

	use super::*;

	/// An external echo socket sees the relayed payload and its reply comes
	/// back framed with the echoer's address.
	#[test_log::test(tokio::test)]
	async fn relays_datagrams_both_ways() -> eyre::Result<()> {
		let echo = UdpSocket::bind("127.0.0.1:0").await?;
		let echo_addr = echo.local_addr()?;
		tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			let (len, from) = echo.recv_from(&mut buf).await.unwrap();
			echo.send_to(&buf[..len], from).await.unwrap();
		});

		let (far, near) = tokio::io::duplex(4096);
		let cancel = CancellationToken::new();
		let relay_cancel = cancel.clone();
		let relay = tokio::spawn(async move { serve_associate(far, &relay_cancel).await });

		let mut framed = Framed::new(near, MessageCodec);
		framed
			.send(Message::SocksDatagram {
				addr: echo_addr.ip().to_string(),
				port: echo_addr.port(),
				data: Bytes::from_static(b"echo me"),
			})
			.await?;

		let reply = tokio::time::timeout(std::time::Duration::from_secs(5), framed.next())
			.await?
			.unwrap()?;
		let (port, data) = match reply {
			Message::SocksDatagram { port, data, .. } => (port, data),
			other => panic!("unexpected message: {other:?}"),
		};
		assert_eq!(port, echo_addr.port());
		assert_eq!(data.as_ref(), b"echo me");

		cancel.cancel();
		relay.await??;
		Ok(())
	}

	/// Closing the channel ends the relay cleanly.
	#[test_log::test(tokio::test)]
	async fn channel_close_ends_relay() -> eyre::Result<()> {
		let (far, near) = tokio::io::duplex(4096);
		let cancel = CancellationToken::new();
		let relay = tokio::spawn(async move { serve_associate(far, &cancel).await });
		drop(near);
		tokio::time::timeout(std::time::Duration::from_secs(1), relay).await???;
		Ok(())
	}
}
