//! Foreground jobs: the interactive shell / raw pipe, with an optional
//! PTY-control sidechannel carrying resize frames. Process execution and
//! PTY allocation stay behind [`ForegroundRunner`]; this module owns the
//! channel wiring and the byte pump.

use std::{sync::Arc, time::Duration};

use futures_util::SinkExt as _;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::{
	codec::{FramedRead, FramedWrite},
	sync::CancellationToken,
};
use squall_core::{AbstractStream, debug, io::pipe_io, warn};
use squall_mux::Channel;
use squall_proto::{Message, PtyControl, PtyControlCodec};

use crate::{Session, SessionError};

/// Terminal dimensions, rows by columns.
pub type PtySize = (u16, u16);

/// What actually runs the requested command. An empty `exec` means "no
/// child": wire the stream to the local stdio instead.
pub trait ForegroundRunner: Send + Sync {
	fn spawn(
		&self,
		exec: &str,
		initial_size: Option<PtySize>,
	) -> impl Future<Output = eyre::Result<ForegroundJob>> + Send;
}

/// A running foreground job: its byte stream and, when PTY-backed, a
/// resize hook.
pub struct ForegroundJob {
	pub io:     Box<dyn AbstractStream>,
	pub resize: Option<Box<dyn Fn(u16, u16) + Send + Sync>>,
}

/// Slave side: the channels were accepted by the dispatcher (I/O first,
/// control second). With a PTY the initial size is the first control frame;
/// later frames resize the running job.
pub async fn serve_foreground<R>(
	io: Channel,
	control: Option<Channel>,
	exec: String,
	runner: Arc<R>,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()>
where
	R: ForegroundRunner,
{
	let mut control = control.map(|channel| FramedRead::new(channel, PtyControlCodec));

	let initial_size = match &mut control {
		Some(frames) => match tokio::time::timeout(timeout, frames.next()).await {
			Ok(Some(Ok(PtyControl::Resize { rows, cols }))) => Some((rows, cols)),
			Ok(Some(Err(err))) => return Err(err.into()),
			Ok(None) => return Err(eyre::eyre!("pty control channel closed before sizing")),
			Err(_) => return Err(eyre::eyre!("no initial terminal size within {timeout:?}")),
		},
		None => None,
	};

	let job = runner.spawn(&exec, initial_size).await?;

	// Apply later resize frames as they arrive.
	let resize_task = control.map(|mut frames| {
		let resize = job.resize;
		let cancel = cancel.clone();
		tokio::spawn(async move {
			loop {
				let frame = tokio::select! {
					_ = cancel.cancelled() => break,
					frame = frames.next() => frame,
				};
				match frame {
					Some(Ok(PtyControl::Resize { rows, cols })) => {
						debug!(target: "[FG]", "resize to {rows}x{cols}");
						if let Some(resize) = &resize {
							resize(rows, cols);
						}
					}
					Some(Err(err)) => {
						warn!(target: "[FG]", "pty control decode: {err}");
						break;
					}
					None => break,
				}
			}
		})
	});

	pipe_io(io, job.io, cancel.clone(), |direction, err| {
		warn!(target: "[FG]", "pipe {direction:?} failed: {err}");
	})
	.await;

	// The pipe is done; stop listening for resizes and drop the control
	// channel.
	cancel.cancel();
	if let Some(task) = resize_task {
		let _ = task.await;
	}
	Ok(())
}

/// Master side: request a foreground job and pump `local_io` through it.
/// With `pty` a control channel is opened as the second channel and fed
/// from `resize_rx` (which should yield the initial size first).
pub async fn request_foreground<IO>(
	session: &Session,
	exec: &str,
	local_io: IO,
	resize_rx: Option<mpsc::Receiver<PtySize>>,
	cancel: CancellationToken,
) -> Result<(), SessionError>
where
	IO: AbstractStream + 'static,
{
	let msg = Message::Foreground {
		exec: exec.to_string(),
		pty:  resize_rx.is_some(),
	};

	let (io, control) = if resize_rx.is_some() {
		let (io, control) = session.send_and_get_two_channels(msg).await?;
		(io, Some(control))
	} else {
		(session.send_and_open_one_channel(msg).await?, None)
	};

	let resize_task = match (control, resize_rx) {
		(Some(channel), Some(mut resize_rx)) => {
			let mut frames = FramedWrite::new(channel, PtyControlCodec);
			let cancel = cancel.clone();
			Some(tokio::spawn(async move {
				loop {
					let size = tokio::select! {
						_ = cancel.cancelled() => break,
						size = resize_rx.recv() => size,
					};
					let Some((rows, cols)) = size else { break };
					if frames.send(PtyControl::Resize { rows, cols }).await.is_err() {
						break;
					}
				}
			}))
		}
		_ => None,
	};

	pipe_io(local_io, io, cancel.clone(), |direction, err| {
		warn!(target: "[FG]", "pipe {direction:?} failed: {err}");
	})
	.await;

	cancel.cancel();
	if let Some(task) = resize_task {
		let _ = task.await;
	}
	Ok(())
}
