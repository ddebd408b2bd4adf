//! SOCKS5 UDP relay plumbing: the datagram header
//! `{RSV(2)=0, FRAG(1), ATYP, DST.ADDR, DST.PORT}` and the relay socket
//! bind.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::ensure;
use socket2::{Domain, Socket, Type};

use crate::{FragmentNotSupportedSnafu, SocksError, UdpFrameTooShortSnafu, proto::SocksAddr};

/// One SOCKS UDP datagram with its header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame {
	pub target:  SocksAddr,
	pub payload: Bytes,
}

impl UdpFrame {
	/// Parse a datagram received from a SOCKS client. Fragmented frames
	/// (FRAG != 0) are rejected.
	pub fn decode(datagram: &[u8]) -> Result<Self, SocksError> {
		let mut src = BytesMut::from(datagram);
		ensure!(src.remaining() >= 4, UdpFrameTooShortSnafu);
		let _rsv = src.get_u16();
		let frag = src.get_u8();
		ensure!(frag == 0, FragmentNotSupportedSnafu { frag });
		let target = SocksAddr::decode(&mut src)?;
		Ok(Self {
			target,
			payload: src.freeze(),
		})
	}

	/// Wrap a payload for delivery to a SOCKS client; `target` is the
	/// datagram's source as seen by the relay.
	pub fn encode(&self) -> Bytes {
		let mut dst = BytesMut::with_capacity(4 + 19 + self.payload.len());
		dst.put_u16(0);
		dst.put_u8(0);
		self.target.encode(&mut dst);
		dst.put_slice(&self.payload);
		dst.freeze()
	}
}

/// Bind the relay's UDP socket on an ephemeral port. With an explicit IP
/// the socket binds there; otherwise a dual-stack v6 socket is attempted
/// first, falling back to v4.
pub fn bind_relay_socket(addr: Option<IpAddr>) -> std::io::Result<std::net::UdpSocket> {
	if let Some(addr) = addr {
		let sock_addr = SocketAddr::new(addr, 0);
		let socket = Socket::new(Domain::for_address(sock_addr), Type::DGRAM, None)?;
		socket.bind(&sock_addr.into())?;
		Ok(socket)
	} else {
		const V4_UNSPEC: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
		const V6_UNSPEC: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
		Socket::new(Domain::IPV6, Type::DGRAM, None)
			.and_then(|socket| socket.set_only_v6(false).map(|_| socket))
			.and_then(|socket| socket.bind(&V6_UNSPEC.into()).map(|_| socket))
			.or_else(|_| {
				Socket::new(Domain::IPV4, Type::DGRAM, None)
					.and_then(|socket| socket.bind(&V4_UNSPEC.into()).map(|_| socket))
			})
	}
	.and_then(|socket| socket.set_nonblocking(true).map(|_| socket))
	.map(Into::into)
}

#[cfg(test)]
mod test {
	use super::*;

	/// Header encode/decode is involutive.
	#[test]
	fn udp_frame_round_trips() {
		let frames = vec![
			UdpFrame {
				target:  SocksAddr::V4(Ipv4Addr::LOCALHOST, 53),
				payload: Bytes::from_static(b"query"),
			},
			UdpFrame {
				target:  SocksAddr::V6(Ipv6Addr::LOCALHOST, 5353),
				payload: Bytes::new(),
			},
			UdpFrame {
				target:  SocksAddr::Domain(String::from("dns.test"), 53),
				payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
			},
		];
		for frame in frames {
			let wire = frame.encode();
			assert_eq!(UdpFrame::decode(&wire).unwrap(), frame);
		}
	}

	#[test]
	fn fragmented_frames_are_rejected() {
		let frame = UdpFrame {
			target:  SocksAddr::V4(Ipv4Addr::LOCALHOST, 53),
			payload: Bytes::from_static(b"x"),
		};
		let mut wire = frame.encode().to_vec();
		wire[2] = 1;
		assert!(matches!(
			UdpFrame::decode(&wire).unwrap_err(),
			SocksError::FragmentNotSupported { frag: 1, .. }
		));
	}

	#[test]
	fn short_frames_are_rejected() {
		assert!(matches!(
			UdpFrame::decode(&[0, 0, 0]).unwrap_err(),
			SocksError::UdpFrameTooShort { .. }
		));
	}

	#[test]
	fn relay_socket_binds_ephemeral() {
		let socket = bind_relay_socket(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
		assert_ne!(socket.local_addr().unwrap().port(), 0);
	}
}
