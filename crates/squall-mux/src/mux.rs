use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex,
		atomic::{AtomicU32, Ordering},
	},
};

use futures_util::SinkExt as _;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::StreamExt as _;
use tokio_util::{
	codec::{FramedRead, FramedWrite},
	sync::{CancellationToken, PollSemaphore, PollSender},
};

use crate::{
	Channel, MuxError,
	channel::{Registry, StreamEntry, StreamEvent, lock_registry},
	frame::{Frame, FrameCodec, FrameKind},
};
use squall_core::{AbstractStream, debug};

/// Send credit a fresh stream starts with, mirrored on both sides.
pub(crate) const INITIAL_WINDOW: usize = 256 * 1024;

/// Pending frames towards the writer task.
const FRAME_BACKLOG: usize = 256;

/// Incoming opens the application has not accepted yet. The reader task
/// stalls (backpressuring the peer) once this fills up.
const ACCEPT_BACKLOG: usize = 128;

/// Which end of the underlying connection this mux sits on; determines
/// stream id parity so simultaneous opens cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	/// The dialing side; opens odd stream ids.
	Client,
	/// The listening side; opens even stream ids.
	Server,
}

/// Stream multiplexer over one [`AbstractStream`]. `open` and `accept` hand
/// out [`Channel`]s; closing the mux (or an I/O error on the underlying
/// connection) fails every channel with a closed-stream error.
pub struct Mux {
	registry:  Registry,
	frame_tx:  mpsc::Sender<Frame>,
	credit_tx: mpsc::UnboundedSender<Frame>,
	accept_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
	next_id:   AtomicU32,
	token:     CancellationToken,
}

impl Mux {
	pub fn new<S>(stream: S, side: Side) -> Self
	where
		S: AbstractStream + 'static,
	{
		let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
		let (frame_tx, frame_rx) = mpsc::channel(FRAME_BACKLOG);
		let (credit_tx, credit_rx) = mpsc::unbounded_channel();
		let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
		let token = CancellationToken::new();

		let (read_half, write_half) = tokio::io::split(stream);

		tokio::spawn(run_writer(write_half, frame_rx, credit_rx, token.clone()));
		tokio::spawn(run_reader(
			read_half,
			side,
			registry.clone(),
			frame_tx.clone(),
			credit_tx.clone(),
			accept_tx,
			token.clone(),
		));

		Self {
			registry,
			frame_tx,
			credit_tx,
			accept_rx: tokio::sync::Mutex::new(accept_rx),
			next_id: AtomicU32::new(match side {
				Side::Client => 1,
				Side::Server => 2,
			}),
			token,
		}
	}

	/// Open a new outgoing stream. The peer observes opens in the order
	/// their SYN frames enter the write queue.
	pub async fn open(&self) -> Result<Channel, MuxError> {
		if self.token.is_cancelled() {
			return Err(MuxError::Closed);
		}
		let id = self.next_id.fetch_add(2, Ordering::Relaxed);
		let channel = register_stream(id, &self.registry, &self.frame_tx, &self.credit_tx);
		self.frame_tx
			.send(Frame::syn(id))
			.await
			.map_err(|_| MuxError::Closed)?;
		Ok(channel)
	}

	/// Next incoming stream, in the order the peer opened them. Cancellable
	/// via `cancel`; a closed mux releases all pending accepts.
	pub async fn accept(&self, cancel: &CancellationToken) -> Result<Channel, MuxError> {
		let mut accept_rx = self.accept_rx.lock().await;
		tokio::select! {
			_ = cancel.cancelled() => Err(MuxError::Cancelled),
			_ = self.token.cancelled() => Err(MuxError::Closed),
			channel = accept_rx.recv() => channel.ok_or(MuxError::Closed),
		}
	}

	/// Tear down the mux and every channel on it. Idempotent.
	pub fn close(&self) {
		self.token.cancel();
	}

	pub fn is_closed(&self) -> bool {
		self.token.is_cancelled()
	}
}

impl Drop for Mux {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

fn register_stream(
	id: u32,
	registry: &Registry,
	frame_tx: &mpsc::Sender<Frame>,
	credit_tx: &mpsc::UnboundedSender<Frame>,
) -> Channel {
	let (data_tx, data_rx) = mpsc::unbounded_channel();
	let send_window = Arc::new(Semaphore::new(INITIAL_WINDOW));
	let entry = StreamEntry {
		data_tx,
		send_window: send_window.clone(),
	};
	lock_registry(registry).insert(id, entry);
	Channel::new(
		id,
		data_rx,
		PollSender::new(frame_tx.clone()),
		PollSemaphore::new(send_window),
		credit_tx.clone(),
		Arc::downgrade(registry),
	)
}

async fn run_writer<W>(
	write_half: W,
	mut frame_rx: mpsc::Receiver<Frame>,
	mut credit_rx: mpsc::UnboundedReceiver<Frame>,
	token: CancellationToken,
) where
	W: tokio::io::AsyncWrite + Send + Unpin,
{
	let mut framed = FramedWrite::new(write_half, FrameCodec);

	loop {
		let res: Result<(), MuxError> = tokio::select! {
			biased;
			_ = token.cancelled() => break,
			Some(frame) = credit_rx.recv() => framed.send(frame).await,
			frame = frame_rx.recv() => {
				let Some(frame) = frame else { break };
				// Drain whatever else is already queued before flushing.
				let mut res = framed.feed(frame).await;
				while res.is_ok() {
					match frame_rx.try_recv() {
						Ok(next) => res = framed.feed(next).await,
						Err(_) => break,
					}
				}
				match res {
					Ok(()) => framed.flush().await,
					err => err,
				}
			}
		};
		if let Err(err) = res {
			debug!(target: "[MUX]", "writer failed: {err}");
			break;
		}
	}

	token.cancel();
	let _ = framed.close().await;
}

async fn run_reader<R>(
	read_half: R,
	side: Side,
	registry: Registry,
	frame_tx: mpsc::Sender<Frame>,
	credit_tx: mpsc::UnboundedSender<Frame>,
	accept_tx: mpsc::Sender<Channel>,
	token: CancellationToken,
) where
	R: tokio::io::AsyncRead + Send + Unpin,
{
	let mut framed = FramedRead::new(read_half, FrameCodec);

	loop {
		let frame = tokio::select! {
			_ = token.cancelled() => break,
			frame = framed.next() => frame,
		};
		let frame = match frame {
			Some(Ok(frame)) => frame,
			Some(Err(err)) => {
				debug!(target: "[MUX]", "reader failed: {err}");
				break;
			}
			// Peer closed the connection.
			None => break,
		};
		if let Err(err) = handle_frame(frame, side, &registry, &frame_tx, &credit_tx, &accept_tx).await {
			debug!(target: "[MUX]", "fatal frame: {err}");
			break;
		}
	}

	token.cancel();
	// Every surviving stream observes a closed-stream error on its next
	// operation.
	let entries: Vec<StreamEntry> = {
		lock_registry(&registry).drain().map(|(_, entry)| entry).collect()
	};
	for entry in entries {
		let _ = entry.data_tx.send(StreamEvent::Reset);
		entry.send_window.close();
	}
}

async fn handle_frame(
	frame: Frame,
	side: Side,
	registry: &Registry,
	frame_tx: &mpsc::Sender<Frame>,
	credit_tx: &mpsc::UnboundedSender<Frame>,
	accept_tx: &mpsc::Sender<Channel>,
) -> Result<(), MuxError> {
	match frame.kind {
		FrameKind::Syn => {
			let expected_parity = match side {
				// We are the client: the peer opens even ids.
				Side::Client => 0,
				Side::Server => 1,
			};
			snafu::ensure!(frame.id % 2 == expected_parity, crate::SynParitySnafu { id: frame.id });
			snafu::ensure!(
				!lock_registry(registry).contains_key(&frame.id),
				crate::SynInUseSnafu { id: frame.id }
			);
			let channel = register_stream(frame.id, registry, frame_tx, credit_tx);
			// Blocks once the accept backlog fills; that backpressures the
			// whole mux rather than dropping the open.
			let _ = accept_tx.send(channel).await;
		}
		FrameKind::Data => {
			let streams = lock_registry(registry);
			if let Some(entry) = streams.get(&frame.id) {
				let _ = entry.data_tx.send(StreamEvent::Data(frame.payload));
			}
		}
		FrameKind::Window => {
			let credit = frame.credit() as usize;
			let streams = lock_registry(registry);
			if let Some(entry) = streams.get(&frame.id) {
				entry.send_window.add_permits(credit.min(INITIAL_WINDOW));
			}
		}
		FrameKind::Fin => {
			let streams = lock_registry(registry);
			if let Some(entry) = streams.get(&frame.id) {
				let _ = entry.data_tx.send(StreamEvent::Eof);
			}
		}
		FrameKind::Rst => {
			let entry = lock_registry(registry).remove(&frame.id);
			if let Some(entry) = entry {
				let _ = entry.data_tx.send(StreamEvent::Reset);
				entry.send_window.close();
			}
		}
		FrameKind::Other(value) => return crate::UnknownFrameKindSnafu { value }.fail(),
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
	use tokio_util::sync::CancellationToken;

	use super::*;

	fn mux_pair() -> (Mux, Mux) {
		let (client_io, server_io) = tokio::io::duplex(64 * 1024);
		(Mux::new(client_io, Side::Client), Mux::new(server_io, Side::Server))
	}

	#[test_log::test(tokio::test)]
	async fn data_round_trips_on_one_channel() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let mut near = client.open().await?;
		let mut far = server.accept(&cancel).await?;

		near.write_all(b"over the mux").await?;
		let mut buf = [0u8; 12];
		far.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"over the mux");

		far.write_all(b"and back").await?;
		let mut buf = [0u8; 8];
		near.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"and back");
		Ok(())
	}

	/// The k-th open on one side is the k-th accept on the other.
	#[test_log::test(tokio::test)]
	async fn accepts_match_open_order() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let mut opened = Vec::new();
		for i in 0u8..5 {
			let mut channel = client.open().await?;
			channel.write_all(&[i]).await?;
			opened.push(channel);
		}
		for i in 0u8..5 {
			let mut accepted = server.accept(&cancel).await?;
			let mut tag = [0u8; 1];
			accepted.read_exact(&mut tag).await?;
			assert_eq!(tag[0], i, "accept {i} paired with a different open");
		}
		Ok(())
	}

	/// Bytes written to an existing channel before an `open` are readable
	/// before the matching accept fires.
	#[test_log::test(tokio::test)]
	async fn writes_are_ordered_before_later_opens() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let mut first = client.open().await?;
		let mut far_first = server.accept(&cancel).await?;

		first.write_all(b"before").await?;
		let _second = client.open().await?;
		let _far_second = server.accept(&cancel).await?;

		// The payload must already be buffered; read it with a zero-ish
		// deadline to prove it arrived ahead of the SYN.
		let mut buf = [0u8; 6];
		tokio::time::timeout(std::time::Duration::from_millis(100), far_first.read_exact(&mut buf))
			.await
			.expect("message bytes arrived after the later open")?;
		assert_eq!(&buf, b"before");
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn shutdown_is_seen_as_eof() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let mut near = client.open().await?;
		let mut far = server.accept(&cancel).await?;

		near.write_all(b"bye").await?;
		near.shutdown().await?;

		let mut buf = Vec::new();
		far.read_to_end(&mut buf).await?;
		assert_eq!(buf, b"bye");
		Ok(())
	}

	/// A transfer much larger than the initial window forces credit returns.
	#[test_log::test(tokio::test)]
	async fn flow_control_survives_large_transfer() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let mut near = client.open().await?;
		let mut far = server.accept(&cancel).await?;

		let payload: Vec<u8> = (0..INITIAL_WINDOW * 4).map(|i| (i % 251) as u8).collect();
		let expected = payload.clone();
		let writer = tokio::spawn(async move {
			near.write_all(&payload).await?;
			near.shutdown().await?;
			std::io::Result::Ok(())
		});

		let mut received = Vec::new();
		far.read_to_end(&mut received).await?;
		writer.await.unwrap()?;
		assert_eq!(received.len(), expected.len());
		assert_eq!(received, expected);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn closing_the_mux_releases_pending_accepts() -> eyre::Result<()> {
		let (_client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let pending = tokio::spawn(async move { server.accept(&cancel).await.map(|_| ()) });
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		// Dropping the client tears the shared connection down.
		drop(_client);
		let res = tokio::time::timeout(std::time::Duration::from_secs(1), pending).await??;
		assert!(matches!(res.unwrap_err(), MuxError::Closed));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn accept_is_cancellable() -> eyre::Result<()> {
		let (_client, server) = mux_pair();
		let cancel = CancellationToken::new();
		cancel.cancel();
		assert!(matches!(server.accept(&cancel).await.unwrap_err(), MuxError::Cancelled));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn peer_drop_resets_the_stream() -> eyre::Result<()> {
		let (client, server) = mux_pair();
		let cancel = CancellationToken::new();

		let near = client.open().await?;
		let mut far = server.accept(&cancel).await?;
		drop(near);

		let mut buf = [0u8; 1];
		let err = far.read_exact(&mut buf).await.unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn close_is_idempotent() -> eyre::Result<()> {
		let (client, _server) = mux_pair();
		client.close();
		client.close();
		assert!(client.is_closed());
		assert!(matches!(client.open().await.unwrap_err(), MuxError::Closed));
		Ok(())
	}
}
