//! Port-forward engine: listen on one endpoint, splice every connection (or
//! datagram flow) onto a fresh channel announced with a `Connect` message.
//! The same engine serves master-side local forwards and the flipped
//! listener a `PortFwd` request starts on the peer.

use std::{
	collections::HashMap,
	net::SocketAddr,
	sync::{Arc, Mutex as StdMutex},
	time::{Duration, Instant},
};

use bytes::Bytes;
use eyre::Context as _;
use futures_util::SinkExt as _;
use tokio::{
	io::{ReadHalf, WriteHalf},
	net::{TcpListener, TcpStream, UdpSocket},
	task::JoinSet,
};
use tokio_stream::StreamExt as _;
use tokio_util::{
	codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec},
	sync::CancellationToken,
};
use squall_core::{debug, info, io::copy_io, transport::accept_retry, types::TargetAddr, warn};
use squall_mux::Channel;
use squall_proto::{Message, Protocol};

use crate::Session;

/// Idle eviction default for UDP forward sessions.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const DATAGRAM_BUF: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ForwardSpec {
	pub protocol: Protocol,
	/// Endpoint this engine listens on.
	pub local:    TargetAddr,
	/// Endpoint the peer dials for every forwarded connection.
	pub remote:   TargetAddr,
}

impl ForwardSpec {
	fn connect_message(&self) -> Message {
		Message::Connect {
			protocol:    self.protocol,
			remote_host: self.remote.host(),
			remote_port: self.remote.port(),
		}
	}
}

/// Ask the peer to run this engine with the endpoints flipped (remote
/// forward).
pub async fn request_remote_forward(
	session: &Session,
	spec: &ForwardSpec,
) -> Result<(), crate::SessionError> {
	session
		.send(Message::PortFwd {
			protocol:    spec.protocol,
			local_host:  spec.local.host(),
			local_port:  spec.local.port(),
			remote_host: spec.remote.host(),
			remote_port: spec.remote.port(),
		})
		.await
}

/// Run the listening side of a forward until cancelled.
pub async fn run_forward_listener(
	session: Arc<Session>,
	spec: ForwardSpec,
	udp_timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	match spec.protocol {
		Protocol::Udp => run_udp_listener(session, spec, udp_timeout, cancel).await,
		_ => run_tcp_listener(session, spec, cancel).await,
	}
}

async fn run_tcp_listener(
	session: Arc<Session>,
	spec: ForwardSpec,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let addr = spec.local.resolve().await.wrap_err("resolving listen address")?;
	let listener = TcpListener::bind(addr)
		.await
		.wrap_err_with(|| format!("listening on {}", spec.local))?;
	info!(target: "[FWD]", "forwarding {} -> {} ({})", spec.local, spec.remote, spec.protocol);

	let mut conns: JoinSet<()> = JoinSet::new();
	while let Some((mut stream, peer)) = accept_retry(&listener, &cancel).await {
		debug!(target: "[FWD]", "connection from {peer}");
		let session = session.clone();
		let msg = spec.connect_message();
		let conn_cancel = cancel.child_token();
		conns.spawn(async move {
			let mut channel = match session.send_and_open_one_channel(msg).await {
				Ok(channel) => channel,
				Err(err) => {
					warn!(target: "[FWD]", "cannot open forward channel for {peer}: {err}");
					return;
				}
			};
			let (_, _, err) = copy_io(&mut stream, &mut channel, &conn_cancel).await;
			if let Some(err) = err {
				debug!(target: "[FWD]", "forward for {peer} ended: {err}");
			}
		});
	}

	conns.shutdown().await;
	Ok(())
}

struct UdpSession {
	writer:      FramedWrite<WriteHalf<Channel>, LengthDelimitedCodec>,
	last_active: Arc<StdMutex<Instant>>,
	cancel:      CancellationToken,
}

type UdpTable = Arc<tokio::sync::Mutex<HashMap<String, UdpSession>>>;

async fn run_udp_listener(
	session: Arc<Session>,
	spec: ForwardSpec,
	udp_timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let addr = spec.local.resolve().await.wrap_err("resolving listen address")?;
	let socket = Arc::new(
		UdpSocket::bind(addr)
			.await
			.wrap_err_with(|| format!("binding {}", spec.local))?,
	);
	info!(target: "[FWD]", "forwarding {} -> {} (udp)", spec.local, spec.remote);

	let table: UdpTable = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
	let janitor = tokio::spawn(run_udp_janitor(table.clone(), udp_timeout, cancel.clone()));

	let mut buf = vec![0u8; DATAGRAM_BUF];
	loop {
		let (len, client) = tokio::select! {
			_ = cancel.cancelled() => break,
			received = socket.recv_from(&mut buf) => received.wrap_err("udp recv")?,
		};
		let datagram = Bytes::copy_from_slice(&buf[..len]);
		relay_client_datagram(&session, &spec, &socket, &table, &cancel, client, datagram).await;
	}

	let _ = janitor.await;
	let mut sessions = table.lock().await;
	for (_, entry) in sessions.drain() {
		entry.cancel.cancel();
	}
	Ok(())
}

/// Get-or-create the client's session under the table lock, then push the
/// datagram down its channel.
async fn relay_client_datagram(
	session: &Arc<Session>,
	spec: &ForwardSpec,
	socket: &Arc<UdpSocket>,
	table: &UdpTable,
	cancel: &CancellationToken,
	client: SocketAddr,
	datagram: Bytes,
) {
	let key = client.to_string();
	let mut sessions = table.lock().await;
	if !sessions.contains_key(&key) {
		let channel = match session.send_and_open_one_channel(spec.connect_message()).await {
			Ok(channel) => channel,
			Err(err) => {
				warn!(target: "[FWD]", "cannot open udp channel for {client}: {err}");
				return;
			}
		};
		let (read_half, write_half) = tokio::io::split(channel);
		let last_active = Arc::new(StdMutex::new(Instant::now()));
		let session_cancel = cancel.child_token();
		tokio::spawn(run_udp_session_reader(
			FramedRead::new(read_half, LengthDelimitedCodec::new()),
			socket.clone(),
			client,
			table.clone(),
			last_active.clone(),
			session_cancel.clone(),
		));
		sessions.insert(key.clone(), UdpSession {
			writer: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
			last_active,
			cancel: session_cancel,
		});
		debug!(target: "[FWD]", "new udp session for {client}");
	}

	let entry = sessions.get_mut(&key).expect("entry inserted above");
	touch(&entry.last_active);
	if let Err(err) = entry.writer.send(datagram).await {
		debug!(target: "[FWD]", "udp session for {client} broke: {err}");
		if let Some(entry) = sessions.remove(&key) {
			entry.cancel.cancel();
		}
	}
}

/// Sole writer of responses back to the client socket.
async fn run_udp_session_reader(
	mut frames: FramedRead<ReadHalf<Channel>, LengthDelimitedCodec>,
	socket: Arc<UdpSocket>,
	client: SocketAddr,
	table: UdpTable,
	last_active: Arc<StdMutex<Instant>>,
	cancel: CancellationToken,
) {
	loop {
		let frame = tokio::select! {
			_ = cancel.cancelled() => break,
			frame = frames.next() => frame,
		};
		match frame {
			Some(Ok(frame)) => {
				touch(&last_active);
				if let Err(err) = socket.send_to(&frame, client).await {
					debug!(target: "[FWD]", "reply to {client} failed: {err}");
					break;
				}
			}
			Some(Err(err)) => {
				debug!(target: "[FWD]", "udp channel for {client} failed: {err}");
				break;
			}
			None => break,
		}
	}
	let mut sessions = table.lock().await;
	if let Some(entry) = sessions.remove(&client.to_string()) {
		entry.cancel.cancel();
	}
}

/// Evict sessions idle longer than `timeout`; runs every `timeout / 2`.
async fn run_udp_janitor(table: UdpTable, timeout: Duration, cancel: CancellationToken) {
	let mut tick = tokio::time::interval(timeout / 2);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tick.tick() => {}
		}
		let now = Instant::now();
		let mut sessions = table.lock().await;
		sessions.retain(|client, entry| {
			let idle = now.duration_since(*entry.last_active.lock().unwrap_or_else(|e| e.into_inner()));
			if idle > timeout {
				debug!(target: "[FWD]", "evicting idle udp session for {client}");
				entry.cancel.cancel();
				false
			} else {
				true
			}
		});
	}
}

fn touch(last_active: &Arc<StdMutex<Instant>>) {
	*last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
}

/// Handler for an incoming `Connect`: dial the target and splice it onto
/// the already-accepted channel.
pub async fn serve_connect_stream(
	channel: Channel,
	protocol: Protocol,
	target: TargetAddr,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	match protocol {
		Protocol::Udp => serve_connect_udp(channel, target, cancel).await,
		_ => serve_connect_tcp(channel, target, cancel).await,
	}
}

async fn serve_connect_tcp(
	mut channel: Channel,
	target: TargetAddr,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let addr = target
		.resolve()
		.await
		.wrap_err_with(|| format!("resolving {target}"))?;
	let mut stream = TcpStream::connect(addr)
		.await
		.wrap_err_with(|| format!("dialing {target}"))?;
	debug!(target: "[FWD]", "connected to {target}");
	let (_, _, err) = copy_io(&mut channel, &mut stream, &cancel).await;
	match err {
		Some(err) => Err(err).wrap_err_with(|| format!("piping to {target}")),
		None => Ok(()),
	}
}

async fn serve_connect_udp(
	channel: Channel,
	target: TargetAddr,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let addr = target
		.resolve()
		.await
		.wrap_err_with(|| format!("resolving {target}"))?;
	let bind: SocketAddr = if addr.is_ipv6() {
		"[::]:0".parse().expect("constant addr")
	} else {
		"0.0.0.0:0".parse().expect("constant addr")
	};
	let socket = UdpSocket::bind(bind).await.wrap_err("binding udp socket")?;
	socket
		.connect(addr)
		.await
		.wrap_err_with(|| format!("connecting udp to {target}"))?;

	let mut framed = Framed::new(channel, LengthDelimitedCodec::new());
	let mut buf = vec![0u8; DATAGRAM_BUF];
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			frame = framed.next() => match frame {
				Some(Ok(frame)) => socket.send(&frame).await.map(|_| ()).wrap_err("udp send")?,
				Some(Err(err)) => return Err(err).wrap_err("udp channel decode"),
				None => break,
			},
			received = socket.recv(&mut buf) => {
				let len = received.wrap_err("udp recv")?;
				framed.send(Bytes::copy_from_slice(&buf[..len])).await.wrap_err("udp channel send")?;
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use squall_mux::{Mux, Side};

	use super::*;

	/// An entry idle longer than the timeout is gone within two periods.
	#[test_log::test(tokio::test)]
	async fn janitor_evicts_idle_sessions() -> eyre::Result<()> {
		let (near, far) = tokio::io::duplex(4096);
		let client = Mux::new(near, Side::Client);
		let _server = Mux::new(far, Side::Server);
		let channel = client.open().await?;
		let (_read_half, write_half) = tokio::io::split(channel);

		let timeout = Duration::from_millis(200);
		let table: UdpTable = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
		let cancel = CancellationToken::new();
		let entry_cancel = cancel.child_token();
		table.lock().await.insert(String::from("127.0.0.1:5000"), UdpSession {
			writer:      FramedWrite::new(write_half, LengthDelimitedCodec::new()),
			last_active: Arc::new(StdMutex::new(Instant::now())),
			cancel:      entry_cancel.clone(),
		});

		let janitor = tokio::spawn(run_udp_janitor(table.clone(), timeout, cancel.clone()));

		tokio::time::timeout(timeout * 4, async {
			loop {
				if table.lock().await.is_empty() {
					break;
				}
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		})
		.await
		.expect("idle session not evicted in time");
		assert!(entry_cancel.is_cancelled());

		cancel.cancel();
		let _ = janitor.await;
		Ok(())
	}

	/// Fresh traffic keeps an entry alive across janitor periods.
	#[test_log::test(tokio::test)]
	async fn janitor_keeps_active_sessions() -> eyre::Result<()> {
		let (near, far) = tokio::io::duplex(4096);
		let client = Mux::new(near, Side::Client);
		let _server = Mux::new(far, Side::Server);
		let channel = client.open().await?;
		let (_read_half, write_half) = tokio::io::split(channel);

		let timeout = Duration::from_millis(200);
		let table: UdpTable = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
		let cancel = CancellationToken::new();
		let last_active = Arc::new(StdMutex::new(Instant::now()));
		table.lock().await.insert(String::from("127.0.0.1:5001"), UdpSession {
			writer:      FramedWrite::new(write_half, LengthDelimitedCodec::new()),
			last_active: last_active.clone(),
			cancel:      cancel.child_token(),
		});

		let janitor = tokio::spawn(run_udp_janitor(table.clone(), timeout, cancel.clone()));

		for _ in 0..4 {
			tokio::time::sleep(timeout / 2).await;
			touch(&last_active);
		}
		assert!(!table.lock().await.is_empty(), "active session was evicted");

		cancel.cancel();
		let _ = janitor.await;
		Ok(())
	}
}
