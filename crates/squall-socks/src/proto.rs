//! SOCKS5 wire pieces shared by the server handshake and the relays
//! (RFC 1928).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::ensure;
use squall_core::types::TargetAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
	NoAcceptableAuthSnafu, SocksError, UnknownAddressTypeSnafu, UnsupportedVersionSnafu,
};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	Connect      = 0x01,
	Bind         = 0x02,
	UdpAssociate = 0x03,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Reply codes this implementation emits.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
	Succeeded          = 0x00,
	GeneralFailure     = 0x01,
	NetworkUnreachable = 0x03,
	HostUnreachable    = 0x04,
	ConnectionRefused  = 0x05,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Map a resolve/dial failure to the reply code the client sees. Typed
/// error kinds are consulted first; the error-text suffixes cover platforms
/// where the kind degrades to `Other`.
pub fn reply_code_for(err: &std::io::Error) -> ReplyCode {
	match err.kind() {
		std::io::ErrorKind::ConnectionRefused => return ReplyCode::ConnectionRefused,
		std::io::ErrorKind::HostUnreachable => return ReplyCode::HostUnreachable,
		std::io::ErrorKind::NetworkUnreachable => return ReplyCode::NetworkUnreachable,
		std::io::ErrorKind::NotFound => return ReplyCode::HostUnreachable,
		_ => {}
	}
	let text = err.to_string();
	if text.ends_with("no such host") {
		ReplyCode::HostUnreachable
	} else if text.ends_with("connection refused") || text.ends_with("host is down") {
		ReplyCode::ConnectionRefused
	} else if text.ends_with("network is unreachable") {
		ReplyCode::NetworkUnreachable
	} else {
		ReplyCode::GeneralFailure
	}
}

/// Target or bind address in SOCKS encoding: ATYP, then the address body,
/// then a big-endian port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
	V4(Ipv4Addr, u16),
	V6(Ipv6Addr, u16),
	Domain(String, u16),
}

impl SocksAddr {
	/// Build from a stringly host, keeping literal IPs literal.
	pub fn from_host_port(host: &str, port: u16) -> Self {
		match host.parse::<IpAddr>() {
			Ok(IpAddr::V4(ip)) => Self::V4(ip, port),
			Ok(IpAddr::V6(ip)) => Self::V6(ip, port),
			Err(_) => Self::Domain(host.to_string(), port),
		}
	}

	pub fn port(&self) -> u16 {
		match self {
			Self::V4(_, port) | Self::V6(_, port) | Self::Domain(_, port) => *port,
		}
	}

	pub fn encode(&self, dst: &mut BytesMut) {
		match self {
			Self::V4(ip, port) => {
				dst.reserve(1 + 4 + 2);
				dst.put_u8(ATYP_IPV4);
				dst.put_slice(&ip.octets());
				dst.put_u16(*port);
			}
			Self::V6(ip, port) => {
				dst.reserve(1 + 16 + 2);
				dst.put_u8(ATYP_IPV6);
				dst.put_slice(&ip.octets());
				dst.put_u16(*port);
			}
			Self::Domain(domain, port) => {
				let len = domain.len().min(u8::MAX as usize);
				dst.reserve(1 + 1 + len + 2);
				dst.put_u8(ATYP_DOMAIN);
				dst.put_u8(len as u8);
				dst.put_slice(&domain.as_bytes()[..len]);
				dst.put_u16(*port);
			}
		}
	}

	/// Decode from a buffer that already holds the whole address (UDP
	/// frames). Advances `src` past the address.
	pub fn decode(src: &mut BytesMut) -> Result<Self, SocksError> {
		ensure!(src.remaining() >= 1, crate::UdpFrameTooShortSnafu);
		let atyp = src.get_u8();
		match atyp {
			ATYP_IPV4 => {
				ensure!(src.remaining() >= 4 + 2, crate::UdpFrameTooShortSnafu);
				let mut octets = [0u8; 4];
				src.copy_to_slice(&mut octets);
				Ok(Self::V4(Ipv4Addr::from(octets), src.get_u16()))
			}
			ATYP_IPV6 => {
				ensure!(src.remaining() >= 16 + 2, crate::UdpFrameTooShortSnafu);
				let mut octets = [0u8; 16];
				src.copy_to_slice(&mut octets);
				Ok(Self::V6(Ipv6Addr::from(octets), src.get_u16()))
			}
			ATYP_DOMAIN => {
				ensure!(src.remaining() >= 1, crate::UdpFrameTooShortSnafu);
				let len = src.get_u8() as usize;
				ensure!(src.remaining() >= len + 2, crate::UdpFrameTooShortSnafu);
				let domain = String::from_utf8_lossy(&src[..len]).into_owned();
				src.advance(len);
				Ok(Self::Domain(domain, src.get_u16()))
			}
			atyp => UnknownAddressTypeSnafu { atyp }.fail(),
		}
	}

	/// Read from a stream, one field at a time (TCP requests).
	pub async fn read_from<S>(stream: &mut S) -> Result<Self, SocksError>
	where
		S: AsyncRead + Unpin,
	{
		let atyp = stream.read_u8().await?;
		match atyp {
			ATYP_IPV4 => {
				let mut octets = [0u8; 4];
				stream.read_exact(&mut octets).await?;
				let port = stream.read_u16().await?;
				Ok(Self::V4(Ipv4Addr::from(octets), port))
			}
			ATYP_IPV6 => {
				let mut octets = [0u8; 16];
				stream.read_exact(&mut octets).await?;
				let port = stream.read_u16().await?;
				Ok(Self::V6(Ipv6Addr::from(octets), port))
			}
			ATYP_DOMAIN => {
				let len = stream.read_u8().await? as usize;
				let mut raw = vec![0u8; len];
				stream.read_exact(&mut raw).await?;
				let port = stream.read_u16().await?;
				Ok(Self::Domain(String::from_utf8_lossy(&raw).into_owned(), port))
			}
			atyp => UnknownAddressTypeSnafu { atyp }.fail(),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(v4) => Self::V4(*v4.ip(), v4.port()),
			SocketAddr::V6(v6) => Self::V6(*v6.ip(), v6.port()),
		}
	}
}

impl From<&SocksAddr> for TargetAddr {
	fn from(addr: &SocksAddr) -> Self {
		match addr {
			SocksAddr::V4(ip, port) => TargetAddr::IPv4(*ip, *port),
			SocksAddr::V6(ip, port) => TargetAddr::IPv6(*ip, *port),
			SocksAddr::Domain(domain, port) => TargetAddr::Domain(domain.clone(), *port),
		}
	}
}

impl std::fmt::Display for SocksAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", TargetAddr::from(self))
	}
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
	pub command: Command,
	pub target:  SocksAddr,
}

/// Run method negotiation (no-auth only) and read the request. The caller
/// decides whether the command is acceptable and replies accordingly.
pub async fn serve_handshake<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let version = stream.read_u8().await?;
	ensure!(version == VERSION, UnsupportedVersionSnafu { version });
	let n_methods = stream.read_u8().await? as usize;
	let mut methods = vec![0u8; n_methods];
	stream.read_exact(&mut methods).await?;

	if !methods.contains(&METHOD_NO_AUTH) {
		stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
		return NoAcceptableAuthSnafu.fail();
	}
	stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

	let version = stream.read_u8().await?;
	ensure!(version == VERSION, UnsupportedVersionSnafu { version });
	let command = Command::from(stream.read_u8().await?);
	let _rsv = stream.read_u8().await?;
	let target = SocksAddr::read_from(stream).await?;

	Ok(SocksRequest { command, target })
}

/// Write a full reply: VER, REP, RSV, then the bind address.
pub async fn write_reply<S>(stream: &mut S, code: ReplyCode, bind: SocksAddr) -> Result<(), SocksError>
where
	S: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(22);
	buf.put_u8(VERSION);
	buf.put_u8(code.into());
	buf.put_u8(0x00);
	bind.encode(&mut buf);
	stream.write_all(&buf).await?;
	stream.flush().await?;
	Ok(())
}

/// The all-zero bind address used when there is nothing meaningful to
/// report (error replies).
pub fn unspecified_bind() -> SocksAddr {
	SocksAddr::V4(Ipv4Addr::UNSPECIFIED, 0)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn reply_codes_match_rfc_values() {
		assert_eq!(u8::from(ReplyCode::Succeeded), 0x00);
		assert_eq!(u8::from(ReplyCode::GeneralFailure), 0x01);
		assert_eq!(u8::from(ReplyCode::NetworkUnreachable), 0x03);
		assert_eq!(u8::from(ReplyCode::HostUnreachable), 0x04);
		assert_eq!(u8::from(ReplyCode::ConnectionRefused), 0x05);
	}

	#[test]
	fn error_suffixes_map_to_reply_codes() {
		let err = |text: &str| std::io::Error::other(text.to_string());
		assert_eq!(reply_code_for(&err("lookup x.invalid: no such host")), ReplyCode::HostUnreachable);
		assert_eq!(reply_code_for(&err("dial tcp: connection refused")), ReplyCode::ConnectionRefused);
		assert_eq!(reply_code_for(&err("dial tcp: host is down")), ReplyCode::ConnectionRefused);
		assert_eq!(reply_code_for(&err("dial tcp: network is unreachable")), ReplyCode::NetworkUnreachable);
		assert_eq!(reply_code_for(&err("something else entirely")), ReplyCode::GeneralFailure);
		assert_eq!(
			reply_code_for(&std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
			ReplyCode::ConnectionRefused
		);
	}

	#[test]
	fn socks_addr_encode_decode() {
		let addrs = vec![
			SocksAddr::V4(Ipv4Addr::LOCALHOST, 80),
			SocksAddr::V6(Ipv6Addr::LOCALHOST, 443),
			SocksAddr::Domain(String::from("example.com"), 8080),
		];
		for addr in addrs {
			let mut buf = BytesMut::new();
			addr.encode(&mut buf);
			let decoded = SocksAddr::decode(&mut buf).unwrap();
			assert_eq!(decoded, addr);
			assert!(buf.is_empty());
		}
	}

	#[tokio::test]
	async fn handshake_negotiates_no_auth() -> eyre::Result<()> {
		let (mut client, mut server) = tokio::io::duplex(256);
		let task = tokio::spawn(async move { serve_handshake(&mut server).await });

		use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
		// greeting: VER=5, 2 methods, [no-auth, gssapi]
		client.write_all(&[0x05, 0x02, 0x00, 0x01]).await?;
		let mut method = [0u8; 2];
		client.read_exact(&mut method).await?;
		assert_eq!(method, [0x05, 0x00]);
		// request: CONNECT 127.0.0.1:1
		client.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 1]).await?;

		let request = task.await??;
		assert_eq!(request.command, Command::Connect);
		assert_eq!(request.target, SocksAddr::V4(Ipv4Addr::LOCALHOST, 1));
		Ok(())
	}

	#[tokio::test]
	async fn handshake_rejects_authless_clients() -> eyre::Result<()> {
		let (mut client, mut server) = tokio::io::duplex(256);
		let task = tokio::spawn(async move { serve_handshake(&mut server).await });

		use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
		// Client only offers username/password auth.
		client.write_all(&[0x05, 0x01, 0x02]).await?;
		let mut method = [0u8; 2];
		client.read_exact(&mut method).await?;
		assert_eq!(method, [0x05, 0xFF]);
		assert!(matches!(task.await?, Err(SocksError::NoAcceptableAuth { .. })));
		Ok(())
	}
}
