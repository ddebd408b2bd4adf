use std::time::Duration;

use bytes::BytesMut;
use snafu::ResultExt as _;
use tokio::{io::AsyncWriteExt as _, net::TcpStream};
use tokio_util::sync::CancellationToken;
use squall_core::{AbstractStream, debug, io::copy_io, transport::enable_keepalive, types::TargetAddr};

use crate::{
	ReplyTimeoutSnafu, ReplyWriteSnafu, SocksError,
	proto::{ReplyCode, SocksAddr, reply_code_for},
};

/// How long the slave gets to push a reply into the channel before the job
/// is abandoned.
const REPLY_DEADLINE: Duration = Duration::from_secs(3);

/// Slave side of a SOCKS CONNECT: dial the target, report the outcome as a
/// one-byte reply code (followed by the local bind address on success), then
/// splice the channel onto the dialed socket.
///
/// A dial failure is returned to the caller after the error reply went out;
/// if even the reply cannot be written, that secondary failure is returned
/// instead.
pub async fn serve_connect<S>(
	mut channel: S,
	target: &TargetAddr,
	cancel: &CancellationToken,
) -> Result<(), SocksError>
where
	S: AbstractStream,
{
	let dialed = async {
		let addr = target.resolve().await?;
		TcpStream::connect(addr).await
	}
	.await;

	let mut stream = match dialed {
		Ok(stream) => stream,
		Err(err) => {
			let code = reply_code_for(&err);
			debug!(target: "[CONNECT]", "dial {target} failed ({err}), replying {code:?}");
			write_deadline(&mut channel, &[code.into()]).await?;
			return Err(err.into());
		}
	};

	let mut reply = BytesMut::with_capacity(1 + 19);
	reply.extend_from_slice(&[ReplyCode::Succeeded.into()]);
	SocksAddr::from(stream.local_addr()?).encode(&mut reply);
	write_deadline(&mut channel, &reply).await?;

	if let Err(err) = enable_keepalive(&stream) {
		debug!(target: "[CONNECT]", "keep-alive not enabled: {err}");
	}

	let (_, _, err) = copy_io(&mut channel, &mut stream, cancel).await;
	match err {
		Some(err) => Err(err.into()),
		None => Ok(()),
	}
}

async fn write_deadline<S>(channel: &mut S, reply: &[u8]) -> Result<(), SocksError>
where
	S: AbstractStream,
{
	let write = async {
		channel.write_all(reply).await?;
		channel.flush().await
	};
	tokio::time::timeout(REPLY_DEADLINE, write)
		.await
		.map_err(|_| ReplyTimeoutSnafu.build())?
		.context(ReplyWriteSnafu)
}
