use std::{
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};

use futures_util::SinkExt as _;
use snafu::IntoError as _;
use tokio_stream::StreamExt as _;
use tokio_util::{
	codec::{FramedRead, FramedWrite},
	sync::CancellationToken,
};
use squall_core::AbstractStream;
use squall_mux::{Channel, Mux, Side};
use squall_proto::{Message, MessageCodec, ProtoError};

use crate::{DecodeSnafu, HandshakeTimeoutSnafu, MuxSnafu, SessionError};

/// Default bound on every control operation, unless configured otherwise.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionOpts {
	/// Deadline applied to sends, channel opens/accepts and the handshake.
	pub timeout: Duration,
}

impl Default for SessionOpts {
	fn default() -> Self {
		Self {
			timeout: DEFAULT_CONTROL_TIMEOUT,
		}
	}
}

/// One established tunnel: the mux over the underlying connection plus the
/// two reserved control channels (first opened carries client→server
/// traffic, second the reverse; "client" is the dialer).
///
/// Concurrent senders are serialized by a mutex, so a message and the
/// channel opened right after it reach the peer back-to-back.
pub struct Session {
	mux:     Mux,
	peer:    String,
	timeout: Duration,
	send:    tokio::sync::Mutex<FramedWrite<Channel, MessageCodec>>,
	recv:    tokio::sync::Mutex<FramedRead<Channel, MessageCodec>>,
	token:   CancellationToken,
	closed:  AtomicBool,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("peer", &self.peer)
			.field("timeout", &self.timeout)
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish()
	}
}

/// Dial-side establishment: open the two control channels in order.
pub async fn open_session<S>(
	stream: S,
	peer: impl Into<String>,
	opts: SessionOpts,
) -> Result<Session, SessionError>
where
	S: AbstractStream + 'static,
{
	let mux = Mux::new(stream, Side::Client);
	let outgoing = mux.open().await.map_err(|e| MuxSnafu.into_error(e))?;
	let incoming = mux.open().await.map_err(|e| MuxSnafu.into_error(e))?;
	Ok(Session::assemble(mux, peer.into(), opts, outgoing, incoming))
}

/// Listen-side establishment: accept the two control channels the dialer
/// opened, in the same order. Fails with a handshake timeout if the peer
/// stalls.
pub async fn accept_session<S>(
	stream: S,
	peer: impl Into<String>,
	opts: SessionOpts,
) -> Result<Session, SessionError>
where
	S: AbstractStream + 'static,
{
	let mux = Mux::new(stream, Side::Server);
	let token = CancellationToken::new();
	let incoming = accept_control_channel(&mux, &token, opts.timeout).await?;
	let outgoing = accept_control_channel(&mux, &token, opts.timeout).await?;
	Ok(Session::assemble(mux, peer.into(), opts, outgoing, incoming))
}

async fn accept_control_channel(
	mux: &Mux,
	token: &CancellationToken,
	timeout: Duration,
) -> Result<Channel, SessionError> {
	match tokio::time::timeout(timeout, mux.accept(token)).await {
		Ok(Ok(channel)) => Ok(channel),
		Ok(Err(err)) => {
			mux.close();
			Err(MuxSnafu.into_error(err))
		}
		Err(_) => {
			mux.close();
			HandshakeTimeoutSnafu.fail()
		}
	}
}

impl Session {
	fn assemble(mux: Mux, peer: String, opts: SessionOpts, outgoing: Channel, incoming: Channel) -> Self {
		Self {
			mux,
			peer,
			timeout: opts.timeout,
			send: tokio::sync::Mutex::new(FramedWrite::new(outgoing, MessageCodec)),
			recv: tokio::sync::Mutex::new(FramedRead::new(incoming, MessageCodec)),
			token: CancellationToken::new(),
			closed: AtomicBool::new(false),
		}
	}

	/// Remote-endpoint label of the underlying connection.
	pub fn peer(&self) -> &str {
		&self.peer
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Fires when the session is closed; handlers derive their own tokens
	/// from it.
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Write one message atomically on the send channel.
	pub async fn send(&self, msg: Message) -> Result<(), SessionError> {
		let mut send = self.send.lock().await;
		self.send_locked(&mut send, msg).await
	}

	async fn send_locked(
		&self,
		send: &mut FramedWrite<Channel, MessageCodec>,
		msg: Message,
	) -> Result<(), SessionError> {
		match tokio::time::timeout(self.timeout, send.send(msg)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(err)) => Err(map_proto_err(err)),
			Err(_) => Err(SessionError::TimedOut),
		}
	}

	/// Read the next message. With no deadline the read blocks until a
	/// message arrives, the peer closes, or `cancel` fires; an explicit
	/// deadline is clamped to the session timeout.
	pub async fn receive(
		&self,
		cancel: &CancellationToken,
		deadline: Option<Duration>,
	) -> Result<Message, SessionError> {
		let mut recv = self.recv.lock().await;
		let next = async {
			match recv.next().await {
				Some(Ok(msg)) => Ok(msg),
				Some(Err(err)) => Err(map_proto_err(err)),
				None => Err(SessionError::PeerClosed),
			}
		};
		match deadline {
			Some(deadline) => {
				let deadline = deadline.min(self.timeout);
				tokio::select! {
					_ = cancel.cancelled() => Err(SessionError::Cancelled),
					res = tokio::time::timeout(deadline, next) => match res {
						Ok(res) => res,
						Err(_) => Err(SessionError::TimedOut),
					},
				}
			}
			None => {
				tokio::select! {
					_ = cancel.cancelled() => Err(SessionError::Cancelled),
					res = next => res,
				}
			}
		}
	}

	/// Raw channel creation, initiator side.
	pub async fn open_channel(&self) -> Result<Channel, SessionError> {
		match tokio::time::timeout(self.timeout, self.mux.open()).await {
			Ok(res) => res.map_err(|e| MuxSnafu.into_error(e)),
			Err(_) => Err(SessionError::TimedOut),
		}
	}

	/// Raw channel creation, responder side.
	pub async fn accept_channel(&self, cancel: &CancellationToken) -> Result<Channel, SessionError> {
		match tokio::time::timeout(self.timeout, self.mux.accept(cancel)).await {
			Ok(Ok(channel)) => Ok(channel),
			Ok(Err(squall_mux::MuxError::Cancelled)) => Err(SessionError::Cancelled),
			Ok(Err(err)) => Err(MuxSnafu.into_error(err)),
			Err(_) => Err(SessionError::TimedOut),
		}
	}

	/// Send `msg` and open one channel while still holding the send lock,
	/// so the peer sees the message no later than the matching accept.
	pub async fn send_and_open_one_channel(&self, msg: Message) -> Result<Channel, SessionError> {
		let mut send = self.send.lock().await;
		self.send_locked(&mut send, msg).await?;
		match tokio::time::timeout(self.timeout, self.mux.open()).await {
			Ok(res) => res.map_err(|e| MuxSnafu.into_error(e)),
			Err(_) => Err(SessionError::TimedOut),
		}
	}

	/// Symmetric variant for flows where the message sender is the channel
	/// acceptor.
	pub async fn send_and_accept_one_channel(&self, msg: Message) -> Result<Channel, SessionError> {
		let mut send = self.send.lock().await;
		self.send_locked(&mut send, msg).await?;
		self.accept_channel(&self.token).await
	}

	/// Send `msg`, then open two channels in fixed order (the foreground
	/// PTY pair: I/O first, control second).
	pub async fn send_and_get_two_channels(&self, msg: Message) -> Result<(Channel, Channel), SessionError> {
		let mut send = self.send.lock().await;
		self.send_locked(&mut send, msg).await?;
		let open_two = async {
			let first = self.mux.open().await?;
			let second = self.mux.open().await?;
			Ok::<_, squall_mux::MuxError>((first, second))
		};
		match tokio::time::timeout(self.timeout, open_two).await {
			Ok(res) => res.map_err(|e| MuxSnafu.into_error(e)),
			Err(_) => Err(SessionError::TimedOut),
		}
	}

	/// Close both control channels, then the mux (which releases the
	/// underlying connection). Safe to call any number of times.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.token.cancel();
		// Best effort: a sender stuck mid-write is torn down by the mux
		// close right after.
		if let Ok(mut send) = self.send.try_lock() {
			let _ = tokio::time::timeout(Duration::from_secs(1), send.close()).await;
		}
		self.mux.close();
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

fn map_proto_err(err: ProtoError) -> SessionError {
	match err {
		ProtoError::UnknownMessageType { value, .. } => {
			crate::ProtocolViolationSnafu { value }.build()
		}
		ProtoError::Io { ref source, .. } if is_closed_kind(source.kind()) => SessionError::PeerClosed,
		err => DecodeSnafu.into_error(err),
	}
}

fn is_closed_kind(kind: std::io::ErrorKind) -> bool {
	matches!(
		kind,
		std::io::ErrorKind::ConnectionAborted
			| std::io::ErrorKind::ConnectionReset
			| std::io::ErrorKind::UnexpectedEof
			| std::io::ErrorKind::BrokenPipe
	)
}
