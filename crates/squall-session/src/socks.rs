//! Master-side SOCKS5 surface: the listener clients talk to, relaying
//! CONNECT and UDP ASSOCIATE over the session to the slave.

use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use eyre::Context as _;
use futures_util::SinkExt as _;
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::{TcpListener, TcpStream, UdpSocket},
	task::JoinSet,
};
use tokio_stream::StreamExt as _;
use tokio_util::{codec::Framed, sync::CancellationToken};
use squall_core::{debug, info, io::copy_io, transport::accept_retry, types::TargetAddr, warn};
use squall_proto::{Message, MessageCodec};
use squall_socks::{
	proto::{
		Command, ReplyCode, SocksAddr, serve_handshake, unspecified_bind, write_reply,
	},
	udp::{UdpFrame, bind_relay_socket},
};

use crate::Session;

const DATAGRAM_BUF: usize = 64 * 1024;

/// Serve SOCKS5 on `listen` until cancelled. Each client connection is
/// handled in its own task; failures there never take the server down.
pub async fn run_socks_server(
	session: Arc<Session>,
	listen: TargetAddr,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let addr = listen.resolve().await.wrap_err("resolving socks listen address")?;
	let listener = TcpListener::bind(addr)
		.await
		.wrap_err_with(|| format!("listening on {listen}"))?;
	info!(target: "[SOCKS]", "socks5 server on {}", listener.local_addr()?);

	let mut clients: JoinSet<()> = JoinSet::new();
	while let Some((stream, peer)) = accept_retry(&listener, &cancel).await {
		let session = session.clone();
		let client_cancel = cancel.child_token();
		clients.spawn(async move {
			if let Err(err) = serve_client(session, stream, client_cancel).await {
				debug!(target: "[SOCKS]", "client {peer}: {err:#}");
			}
		});
	}

	clients.shutdown().await;
	Ok(())
}

async fn serve_client(
	session: Arc<Session>,
	mut stream: TcpStream,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let request = serve_handshake(&mut stream).await?;
	match request.command {
		Command::Connect => {
			serve_client_connect(session, stream, TargetAddr::from(&request.target), cancel).await
		}
		Command::UdpAssociate => serve_client_associate(session, stream, cancel).await,
		command => {
			// 0x07: command not supported.
			write_reply(&mut stream, ReplyCode::Other(0x07), unspecified_bind()).await?;
			eyre::bail!("unsupported command {:?}", command)
		}
	}
}

/// Relay a CONNECT: the slave answers with one reply byte (its SOCKS code)
/// plus the dialed socket's bind address on success; mirror that to the
/// client and pipe.
async fn serve_client_connect(
	session: Arc<Session>,
	mut stream: TcpStream,
	target: TargetAddr,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let mut channel = session
		.send_and_open_one_channel(Message::SocksConnect {
			remote_host: target.host(),
			remote_port: target.port(),
		})
		.await
		.wrap_err("requesting connect relay")?;

	let code = match tokio::time::timeout(session.timeout(), channel.read_u8()).await {
		Ok(Ok(code)) => ReplyCode::from(code),
		// Slave closed the channel without a reply (handler failed hard).
		Ok(Err(err)) => {
			write_reply(&mut stream, ReplyCode::GeneralFailure, unspecified_bind()).await?;
			return Err(err).wrap_err("slave reply");
		}
		Err(_) => {
			write_reply(&mut stream, ReplyCode::GeneralFailure, unspecified_bind()).await?;
			eyre::bail!("slave reply timed out")
		}
	};

	if code != ReplyCode::Succeeded {
		debug!(target: "[SOCKS]", "connect to {target} refused: {code:?}");
		write_reply(&mut stream, code, unspecified_bind()).await?;
		return Ok(());
	}

	let bind = SocksAddr::read_from(&mut channel).await.wrap_err("slave bind address")?;
	write_reply(&mut stream, ReplyCode::Succeeded, bind).await?;

	let (_, _, err) = copy_io(&mut stream, &mut channel, &cancel).await;
	if let Some(err) = err {
		debug!(target: "[SOCKS]", "connect relay for {target} ended: {err}");
	}
	Ok(())
}

/// Relay a UDP ASSOCIATE: bind a local relay socket, tell the client about
/// it, then shuttle datagrams as `SocksDatagram` messages on the channel.
/// The relay lives until the client's TCP connection or the channel closes.
async fn serve_client_associate(
	session: Arc<Session>,
	mut stream: TcpStream,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let channel = session
		.send_and_open_one_channel(Message::SocksAssociate)
		.await
		.wrap_err("requesting associate relay")?;

	// Bind on the address the client reached us at, so the relay is
	// reachable wherever the TCP connection was.
	let socket = UdpSocket::from_std(
		bind_relay_socket(Some(stream.local_addr()?.ip())).wrap_err("binding udp relay")?,
	)?;
	let relay_addr = socket.local_addr()?;
	write_reply(&mut stream, ReplyCode::Succeeded, SocksAddr::from(relay_addr)).await?;
	debug!(target: "[SOCKS]", "udp relay on {relay_addr}");

	// Last address the SOCKS client sent from; replies go there.
	let client_addr: ArcSwap<Option<SocketAddr>> = ArcSwap::new(Arc::new(None));
	let mut framed = Framed::new(channel, MessageCodec);
	let mut buf = vec![0u8; DATAGRAM_BUF];
	let mut tcp_probe = [0u8; 1];

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			// The associate lives exactly as long as the controlling TCP
			// stream.
			res = stream.read(&mut tcp_probe) => {
				match res {
					Ok(0) | Err(_) => break,
					Ok(_) => {}
				}
			}
			received = socket.recv_from(&mut buf) => {
				let (len, from) = received.wrap_err("udp relay recv")?;
				client_addr.store(Arc::new(Some(from)));
				let frame = match UdpFrame::decode(&buf[..len]) {
					Ok(frame) => frame,
					Err(err) => {
						warn!(target: "[SOCKS]", "dropping udp frame from {from}: {err}");
						continue;
					}
				};
				let target = TargetAddr::from(&frame.target);
				framed.send(Message::SocksDatagram {
					addr: target.host(),
					port: target.port(),
					data: frame.payload,
				}).await.wrap_err("relay to slave")?;
			}
			msg = framed.next() => {
				let msg = match msg {
					None => break,
					Some(Err(err)) => return Err(err).wrap_err("relay channel decode"),
					Some(Ok(msg)) => msg,
				};
				let (addr, port, data) = match msg {
					Message::SocksDatagram { addr, port, data } => (addr, port, data),
					other => {
						warn!(target: "[SOCKS]", "ignoring {} on a relay channel", other.tag());
						continue;
					}
				};
				let Some(client) = **client_addr.load() else {
					debug!(target: "[SOCKS]", "reply before any client datagram, dropping");
					continue;
				};
				let frame = UdpFrame {
					target:  SocksAddr::from_host_port(&addr, port),
					payload: data,
				};
				if let Err(err) = socket.send_to(&frame.encode(), client).await {
					debug!(target: "[SOCKS]", "reply to {client} failed: {err}");
				}
			}
		}
	}

	Ok(())
}
