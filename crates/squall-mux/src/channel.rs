use std::{
	collections::HashMap,
	io,
	pin::Pin,
	sync::{Mutex, Weak},
	task::{Context, Poll},
};

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::{PollSemaphore, PollSender};

use crate::frame::Frame;

/// Largest slice moved into a single DATA frame. Kept below the peer's
/// initial window so a fresh channel can always make progress.
pub(crate) const WRITE_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) enum StreamEvent {
	Data(Bytes),
	Eof,
	Reset,
}

pub(crate) struct StreamEntry {
	pub data_tx:     mpsc::UnboundedSender<StreamEvent>,
	pub send_window: std::sync::Arc<tokio::sync::Semaphore>,
}

pub(crate) type Registry = std::sync::Arc<Mutex<HashMap<u32, StreamEntry>>>;

/// Lock the registry, shrugging off poisoning; a panicked task must not
/// wedge every other stream.
pub(crate) fn lock_registry(
	registry: &Mutex<HashMap<u32, StreamEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<u32, StreamEntry>> {
	registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One logical byte stream inside the mux. Reads see the peer's DATA frames
/// in order; writes consume send-window credit and are chunked into DATA
/// frames on the shared write queue. Dropping the channel resets the stream.
pub struct Channel {
	id:       u32,
	events:   mpsc::UnboundedReceiver<StreamEvent>,
	readbuf:  Bytes,
	eof:      bool,
	reset:    bool,
	frames:   PollSender<Frame>,
	window:   PollSemaphore,
	pending:  Option<(OwnedSemaphorePermit, usize)>,
	credits:  mpsc::UnboundedSender<Frame>,
	fin_sent: bool,
	registry: Weak<Mutex<HashMap<u32, StreamEntry>>>,
}

impl Channel {
	pub(crate) fn new(
		id: u32,
		events: mpsc::UnboundedReceiver<StreamEvent>,
		frames: PollSender<Frame>,
		window: PollSemaphore,
		credits: mpsc::UnboundedSender<Frame>,
		registry: Weak<Mutex<HashMap<u32, StreamEntry>>>,
	) -> Self {
		Self {
			id,
			events,
			readbuf: Bytes::new(),
			eof: false,
			reset: false,
			frames,
			window,
			pending: None,
			credits,
			fin_sent: false,
			registry,
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	fn closed_err() -> io::Error {
		io::Error::new(io::ErrorKind::ConnectionAborted, "mux closed")
	}
}

impl tokio::io::AsyncRead for Channel {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if !this.readbuf.is_empty() {
				let take = this.readbuf.len().min(buf.remaining());
				buf.put_slice(&this.readbuf.split_to(take));
				// Hand the consumed bytes back to the peer as send credit.
				let _ = this.credits.send(Frame::window(this.id, take as u32));
				return Poll::Ready(Ok(()));
			}
			if this.eof {
				return Poll::Ready(Ok(()));
			}
			if this.reset {
				return Poll::Ready(Err(io::Error::new(
					io::ErrorKind::ConnectionReset,
					"stream reset by peer",
				)));
			}
			match this.events.poll_recv(cx) {
				Poll::Ready(Some(StreamEvent::Data(data))) => this.readbuf = data,
				Poll::Ready(Some(StreamEvent::Eof)) => this.eof = true,
				Poll::Ready(Some(StreamEvent::Reset)) => this.reset = true,
				Poll::Ready(None) => return Poll::Ready(Err(Self::closed_err())),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

impl tokio::io::AsyncWrite for Channel {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		if buf.is_empty() {
			return Poll::Ready(Ok(0));
		}
		loop {
			if this.pending.is_some() {
				match this.frames.poll_reserve(cx) {
					Poll::Ready(Ok(())) => {
						let (permit, acquired) = this.pending.take().unwrap();
						let take = acquired.min(buf.len());
						permit.forget();
						let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..take]));
						if this.frames.send_item(frame).is_err() {
							return Poll::Ready(Err(Self::closed_err()));
						}
						return Poll::Ready(Ok(take));
					}
					Poll::Ready(Err(_)) => return Poll::Ready(Err(Self::closed_err())),
					Poll::Pending => return Poll::Pending,
				}
			}
			let want = buf.len().min(WRITE_CHUNK);
			match this.window.poll_acquire_many(cx, want as u32) {
				Poll::Ready(Some(permit)) => this.pending = Some((permit, want)),
				Poll::Ready(None) => return Poll::Ready(Err(Self::closed_err())),
				Poll::Pending => return Poll::Pending,
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		// Frames are queued in order; the writer task owns the real flush.
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if this.fin_sent {
			return Poll::Ready(Ok(()));
		}
		match this.frames.poll_reserve(cx) {
			Poll::Ready(Ok(())) => {
				this.fin_sent = true;
				let _ = this.frames.send_item(Frame::fin(this.id));
				Poll::Ready(Ok(()))
			}
			// Mux already gone; there is nothing left to half-close.
			Poll::Ready(Err(_)) => {
				this.fin_sent = true;
				Poll::Ready(Ok(()))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl Drop for Channel {
	fn drop(&mut self) {
		if let Some(registry) = self.registry.upgrade() {
			lock_registry(&registry).remove(&self.id);
		}
		// Abortive close. After a graceful shutdown the FIN is already
		// ordered behind our data; an RST here could overtake it on the
		// prioritized control queue and truncate the stream.
		if !self.fin_sent {
			let _ = self.credits.send(Frame::rst(self.id));
		}
	}
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel").field("id", &self.id).finish_non_exhaustive()
	}
}
