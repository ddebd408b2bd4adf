use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use squall_core::{debug, error, info, types::TargetAddr, warn};
use squall_proto::Message;

use crate::{
	DEFAULT_UDP_IDLE_TIMEOUT, ForegroundRunner, ForwardSpec, HandshakeFailedSnafu, Session,
	SessionError, foreground, forward,
};

#[derive(Debug, Clone)]
pub struct DispatcherOpts {
	/// Identity sent in our `Hello`.
	pub id:          String,
	/// Idle eviction timeout for UDP forward sessions.
	pub udp_timeout: Duration,
}

impl Default for DispatcherOpts {
	fn default() -> Self {
		Self {
			id:          String::from("squall"),
			udp_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
		}
	}
}

/// The receive loop of one session endpoint: exchanges `Hello`s, then fans
/// every control message out to an asynchronous handler task. Handler
/// failures (and panics) are logged and never terminate the session; the
/// loop ends on peer close, cancellation, or a protocol violation.
pub struct Dispatcher<R> {
	session:        Arc<Session>,
	runner:         Arc<R>,
	opts:           DispatcherOpts,
	established_tx: tokio::sync::watch::Sender<bool>,
}

impl<R> Dispatcher<R>
where
	R: ForegroundRunner + 'static,
{
	pub fn new(session: Arc<Session>, runner: Arc<R>, opts: DispatcherOpts) -> Self {
		let (established_tx, _) = tokio::sync::watch::channel(false);
		Self {
			session,
			runner,
			opts,
			established_tx,
		}
	}

	/// Resolves to `true` once the identity exchange is done. Callers that
	/// send control messages of their own should wait for it, so nothing
	/// overtakes the `Hello`.
	pub fn subscribe_established(&self) -> tokio::sync::watch::Receiver<bool> {
		self.established_tx.subscribe()
	}

	pub async fn run(self) -> Result<(), SessionError> {
		let session = self.session.clone();
		let token = session.token().clone();

		// Handshaking: identity exchange, bounded by the session timeout.
		if let Err(err) = session.send(Message::Hello { id: self.opts.id.clone() }).await {
			session.close().await;
			return match err {
				SessionError::TimedOut | SessionError::PeerClosed => HandshakeFailedSnafu.fail(),
				err => Err(err),
			};
		}
		let peer_id = loop {
			match session.receive(&token, Some(session.timeout())).await {
				Ok(Message::Hello { id }) => break id,
				// Should not occur; drop anything racing the handshake.
				Ok(msg) => debug!(target: "[SESSION]", "discarding {} during handshake", msg.tag()),
				Err(SessionError::TimedOut | SessionError::PeerClosed) => {
					session.close().await;
					return HandshakeFailedSnafu.fail();
				}
				Err(err) => {
					session.close().await;
					return Err(err);
				}
			}
		};
		info!(target: "[SESSION]", "Session established with {} (peer id {peer_id:?})", session.peer());
		let _ = self.established_tx.send(true);

		let mut jobs: JoinSet<eyre::Result<()>> = JoinSet::new();
		let result = loop {
			tokio::select! {
				Some(joined) = jobs.join_next() => match joined {
					Ok(Ok(())) => {}
					Ok(Err(err)) => error!(target: "[SESSION]", "handler error: {err:#}"),
					Err(join_err) if join_err.is_panic() => {
						error!(target: "[SESSION]", "handler panicked: {join_err}");
					}
					Err(_) => {}
				},
				res = session.receive(&token, None) => match res {
					Ok(msg) => {
						if let Err(err) = self.dispatch(msg, &mut jobs).await {
							break Err(err);
						}
					}
					// Transient deadline from polling; keep going.
					Err(SessionError::TimedOut) => {}
					Err(SessionError::Cancelled | SessionError::PeerClosed) => break Ok(()),
					Err(err) => break Err(err),
				},
			}
		};

		session.close().await;
		jobs.shutdown().await;
		match &result {
			Ok(()) => info!(target: "[SESSION]", "session with {} closed", session.peer()),
			Err(err) => error!(target: "[SESSION]", "session with {} failed: {err}", session.peer()),
		}
		result
	}

	/// Accept whatever channels the message pairs with (in FIFO order,
	/// while no other message can interleave), then hand the job to its
	/// own task.
	async fn dispatch(
		&self,
		msg: Message,
		jobs: &mut JoinSet<eyre::Result<()>>,
	) -> Result<(), SessionError> {
		let session = self.session.clone();
		let cancel = session.token().child_token();
		debug!(target: "[SESSION]", "dispatching {}", msg.tag());
		match msg {
			// A second Hello is harmless; ignore it.
			Message::Hello { id } => {
				debug!(target: "[SESSION]", "ignoring extra Hello from {id:?}");
			}
			Message::Foreground { exec, pty } => {
				let io = session.accept_channel(session.token()).await?;
				let control = if pty {
					Some(session.accept_channel(session.token()).await?)
				} else {
					None
				};
				let runner = self.runner.clone();
				let timeout = session.timeout();
				jobs.spawn(async move {
					foreground::serve_foreground(io, control, exec, runner, timeout, cancel).await
				});
			}
			Message::Connect { protocol, remote_host, remote_port } => {
				let channel = session.accept_channel(session.token()).await?;
				let target = TargetAddr::new(&remote_host, remote_port);
				jobs.spawn(async move {
					forward::serve_connect_stream(channel, protocol, target, cancel).await
				});
			}
			Message::PortFwd {
				protocol,
				local_host,
				local_port,
				remote_host,
				remote_port,
			} => {
				// Listen where the peer asked and forward back into it:
				// the peer's "remote" is our listen endpoint.
				let spec = ForwardSpec {
					protocol,
					local:  TargetAddr::new(&remote_host, remote_port),
					remote: TargetAddr::new(&local_host, local_port),
				};
				let udp_timeout = self.opts.udp_timeout;
				jobs.spawn(async move {
					forward::run_forward_listener(session, spec, udp_timeout, cancel).await
				});
			}
			Message::SocksConnect { remote_host, remote_port } => {
				let channel = session.accept_channel(session.token()).await?;
				let target = TargetAddr::new(&remote_host, remote_port);
				jobs.spawn(async move {
					squall_socks::serve_connect(channel, &target, &cancel).await?;
					Ok(())
				});
			}
			Message::SocksAssociate => {
				let channel = session.accept_channel(session.token()).await?;
				jobs.spawn(async move {
					squall_socks::serve_associate(channel, &cancel).await?;
					Ok(())
				});
			}
			Message::SocksDatagram { .. } => {
				// Datagrams belong on relay channels, never on the control
				// channel.
				warn!(target: "[SESSION]", "stray SocksDatagram on the control channel");
			}
		}
		Ok(())
	}
}
