use std::{io, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 16 * 1024;

/// Which half of a bidirectional pump failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
	AtoB,
	BtoA,
}

/// Pump bytes both ways between `a` and `b` until one direction sees EOF or
/// an error, or the token fires. Returns the byte counts moved in each
/// direction and the terminating error, if any.
pub async fn copy_io<A, B>(
	a: &mut A,
	b: &mut B,
	cancel: &CancellationToken,
) -> (usize, usize, Option<io::Error>)
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let mut a2b = [0u8; BUFFER_SIZE];
	let mut b2a = [0u8; BUFFER_SIZE];

	let mut a2b_num = 0;
	let mut b2a_num = 0;

	let mut last_err = None;

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			a2b_res = a.read(&mut a2b) => match a2b_res {
				Ok(0) => break,
				Ok(num) => {
					a2b_num += num;
					if let Err(err) = b.write_all(&a2b[..num]).await {
						last_err = Some(err);
						break;
					}
				}
				Err(err) => {
					last_err = Some(err);
					break;
				}
			},
			b2a_res = b.read(&mut b2a) => match b2a_res {
				Ok(0) => break,
				Ok(num) => {
					b2a_num += num;
					if let Err(err) = a.write_all(&b2a[..num]).await {
						last_err = Some(err);
						break;
					}
				}
				Err(err) => {
					last_err = Some(err);
					break;
				}
			},
		}
	}

	let _ = a.shutdown().await;
	let _ = b.shutdown().await;

	(a2b_num, b2a_num, last_err)
}

/// Bidirectional pump over owned endpoints, one task per direction. The pipe
/// ends as soon as either direction returns EOF or fails; the remaining
/// direction is cancelled and both tasks are joined before returning.
/// `on_error` fires at most once per direction, and only for non-EOF
/// failures.
pub async fn pipe_io<A, B, F>(a: A, b: B, cancel: CancellationToken, on_error: F)
where
	A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	F: Fn(CopyDirection, io::Error) + Send + Sync + 'static,
{
	let (mut a_rd, mut a_wr) = tokio::io::split(a);
	let (mut b_rd, mut b_wr) = tokio::io::split(b);
	let on_error = Arc::new(on_error);
	let local = cancel.child_token();

	let fwd = {
		let local = local.clone();
		let on_error = on_error.clone();
		tokio::spawn(async move {
			if let Err(err) = pump(&mut a_rd, &mut b_wr, &local).await {
				on_error(CopyDirection::AtoB, err);
			}
			local.cancel();
			let _ = b_wr.shutdown().await;
		})
	};
	let rev = {
		let local = local.clone();
		let on_error = on_error.clone();
		tokio::spawn(async move {
			if let Err(err) = pump(&mut b_rd, &mut a_wr, &local).await {
				on_error(CopyDirection::BtoA, err);
			}
			local.cancel();
			let _ = a_wr.shutdown().await;
		})
	};

	let _ = fwd.await;
	let _ = rev.await;
}

async fn pump<R, W>(rd: &mut R, wr: &mut W, cancel: &CancellationToken) -> io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = [0u8; BUFFER_SIZE];
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			res = rd.read(&mut buf) => match res {
				Ok(0) => return Ok(()),
				Ok(num) => wr.write_all(&buf[..num]).await?,
				Err(err) => return Err(err),
			},
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio_util::sync::CancellationToken;

	use super::*;

	#[tokio::test]
	async fn copy_io_moves_both_ways_until_eof() {
		let (mut near_a, mut far_a) = tokio::io::duplex(64);
		let (mut near_b, mut far_b) = tokio::io::duplex(64);
		let cancel = CancellationToken::new();

		let pump = tokio::spawn(async move { copy_io(&mut far_a, &mut near_b, &cancel).await });

		near_a.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 4];
		far_b.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		far_b.write_all(b"pong!").await.unwrap();
		let mut buf = [0u8; 5];
		near_a.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong!");

		drop(near_a);
		drop(far_b);
		let (a2b, b2a, err) = pump.await.unwrap();
		assert_eq!(a2b, 4);
		assert_eq!(b2a, 5);
		assert!(err.is_none());
	}

	#[tokio::test]
	async fn pipe_io_ends_when_one_side_closes() {
		let (mut near_a, far_a) = tokio::io::duplex(64);
		let (mut near_b, far_b) = tokio::io::duplex(64);
		let errors = Arc::new(AtomicUsize::new(0));
		let errors_in_cb = errors.clone();

		let pipe = tokio::spawn(pipe_io(far_a, far_b, CancellationToken::new(), move |_, _| {
			errors_in_cb.fetch_add(1, Ordering::SeqCst);
		}));

		near_a.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		near_b.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		// EOF on one side takes the whole pipe down without error callbacks.
		drop(near_a);
		pipe.await.unwrap();
		assert_eq!(errors.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn pipe_io_is_cancellable() {
		let (_near_a, far_a) = tokio::io::duplex(64);
		let (_near_b, far_b) = tokio::io::duplex(64);
		let cancel = CancellationToken::new();

		let pipe = tokio::spawn(pipe_io(far_a, far_b, cancel.clone(), |_, _| {}));
		cancel.cancel();
		tokio::time::timeout(std::time::Duration::from_secs(1), pipe)
			.await
			.expect("pipe did not end on cancellation")
			.unwrap();
	}
}
