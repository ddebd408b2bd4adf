//! Foreground jobs on the slave: spawn the requested command with piped
//! stdio, or hand back the process's own stdio for a raw pipe. PTY
//! allocation is a platform concern squall does not carry; a PTY request
//! still runs the command, just without a terminal.

use std::{
	pin::Pin,
	process::Stdio,
	task::{Context, Poll},
};

use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	process::Command,
};
use squall_core::warn;
use squall_session::{ForegroundJob, ForegroundRunner, PtySize};

pub struct ExecRunner;

impl ForegroundRunner for ExecRunner {
	async fn spawn(&self, exec: &str, initial_size: Option<PtySize>) -> eyre::Result<ForegroundJob> {
		if initial_size.is_some() {
			warn!(target: "[EXEC]", "no pty support on this build, running piped");
		}
		if exec.is_empty() {
			return Ok(ForegroundJob {
				io:     Box::new(StdioStream::new()),
				resize: None,
			});
		}

		let mut parts = exec.split_whitespace();
		let program = parts
			.next()
			.ok_or_else(|| eyre::eyre!("empty command line"))?;
		let mut child = Command::new(program)
			.args(parts)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;

		let stdin = child.stdin.take().ok_or_else(|| eyre::eyre!("child stdin missing"))?;
		let stdout = child.stdout.take().ok_or_else(|| eyre::eyre!("child stdout missing"))?;
		let mut stderr = child.stderr.take().ok_or_else(|| eyre::eyre!("child stderr missing"))?;

		// Both output streams feed the same duplex; the far end is the
		// job's byte stream. The child dies with it (kill_on_drop).
		let (near, far) = tokio::io::duplex(16 * 1024);
		let (mut near_rd, near_wr) = tokio::io::split(near);
		let near_wr = std::sync::Arc::new(tokio::sync::Mutex::new(near_wr));
		{
			let near_wr = near_wr.clone();
			let mut stdout = stdout;
			tokio::spawn(async move {
				copy_into_shared(&mut stdout, &near_wr).await;
			});
		}
		{
			let near_wr = near_wr.clone();
			tokio::spawn(async move {
				copy_into_shared(&mut stderr, &near_wr).await;
			});
		}
		tokio::spawn(async move {
			let mut stdin = stdin;
			let _ = tokio::io::copy(&mut near_rd, &mut stdin).await;
			// Reap the child once its input is gone.
			let _ = child.wait().await;
		});

		Ok(ForegroundJob {
			io:     Box::new(far),
			resize: None,
		})
	}
}

async fn copy_into_shared<R>(
	src: &mut R,
	dst: &std::sync::Arc<tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
) where
	R: AsyncRead + Unpin,
{
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
	let mut buf = [0u8; 8 * 1024];
	loop {
		match src.read(&mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(n) => {
				let mut dst = dst.lock().await;
				if dst.write_all(&buf[..n]).await.is_err() {
					break;
				}
			}
		}
	}
}

/// The process's own stdio presented as one bidirectional stream.
pub struct StdioStream {
	stdin:  tokio::io::Stdin,
	stdout: tokio::io::Stdout,
}

impl StdioStream {
	pub fn new() -> Self {
		Self {
			stdin:  tokio::io::stdin(),
			stdout: tokio::io::stdout(),
		}
	}
}

impl Default for StdioStream {
	fn default() -> Self {
		Self::new()
	}
}

impl AsyncRead for StdioStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.stdin).poll_read(cx, buf)
	}
}

impl AsyncWrite for StdioStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.stdout).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.stdout).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.stdout).poll_shutdown(cx)
	}
}
