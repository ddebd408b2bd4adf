use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	BytesRemainingSnafu, Message, MessageTooLargeSnafu, MsgType, ProtoError, Protocol,
	StringTooLongSnafu, TruncatedSnafu, UnknownMessageTypeSnafu, UnknownProtocolSnafu,
	error::FailParseStringSnafu,
};

/// Outer frame limit. A `SocksDatagram` carries at most one UDP payload, so
/// anything beyond this is corruption.
pub const MAX_MESSAGE: usize = 128 * 1024;

/// Limit for string fields (identities, host names).
pub const MAX_STRING: usize = 4 * 1024;

/// Length-delimited codec for [`Message`]: a u32 frame length followed by a
/// one-byte type tag and the variant's fields. Strings are u16-prefixed
/// UTF-8; datagram payloads are u32-prefixed opaque bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
	type Error = ProtoError;
	type Item = Message;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 4 {
			return Ok(None);
		}
		let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
		ensure!(len <= MAX_MESSAGE && len >= 1, MessageTooLargeSnafu { len });
		if src.len() < 4 + len {
			src.reserve(4 + len - src.len());
			return Ok(None);
		}
		src.advance(4);
		let mut body = src.split_to(len);
		let msg = decode_body(&mut body)?;
		Ok(Some(msg))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<Message> for MessageCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let mut body = BytesMut::with_capacity(64);
		encode_body(&item, &mut body)?;
		ensure!(body.len() <= MAX_MESSAGE, MessageTooLargeSnafu { len: body.len() });
		dst.reserve(4 + body.len());
		dst.put_u32(body.len() as u32);
		dst.put_slice(&body);
		Ok(())
	}
}

fn encode_body(msg: &Message, dst: &mut BytesMut) -> Result<(), ProtoError> {
	dst.put_u8(msg.msg_type().into());
	match msg {
		Message::Hello { id } => put_string(dst, id)?,
		Message::Foreground { exec, pty } => {
			put_string(dst, exec)?;
			dst.put_u8(u8::from(*pty));
		}
		Message::Connect { protocol, remote_host, remote_port } => {
			dst.put_u8((*protocol).into());
			put_string(dst, remote_host)?;
			dst.put_u16(*remote_port);
		}
		Message::PortFwd {
			protocol,
			local_host,
			local_port,
			remote_host,
			remote_port,
		} => {
			dst.put_u8((*protocol).into());
			put_string(dst, local_host)?;
			dst.put_u16(*local_port);
			put_string(dst, remote_host)?;
			dst.put_u16(*remote_port);
		}
		Message::SocksConnect { remote_host, remote_port } => {
			put_string(dst, remote_host)?;
			dst.put_u16(*remote_port);
		}
		Message::SocksAssociate => {}
		Message::SocksDatagram { addr, port, data } => {
			put_string(dst, addr)?;
			dst.put_u16(*port);
			dst.put_u32(data.len() as u32);
			dst.put_slice(data);
		}
	}
	Ok(())
}

fn decode_body(src: &mut BytesMut) -> Result<Message, ProtoError> {
	let tag = MsgType::from(src.get_u8());
	match tag {
		MsgType::Hello => Ok(Message::Hello {
			id: get_string(src, "Hello", "id")?,
		}),
		MsgType::Foreground => {
			let exec = get_string(src, "Foreground", "exec")?;
			ensure!(src.remaining() >= 1, TruncatedSnafu { tag: "Foreground", field: "pty" });
			Ok(Message::Foreground { exec, pty: src.get_u8() != 0 })
		}
		MsgType::Connect => {
			let protocol = get_protocol(src, "Connect")?;
			let remote_host = get_string(src, "Connect", "remote_host")?;
			let remote_port = get_port(src, "Connect", "remote_port")?;
			Ok(Message::Connect { protocol, remote_host, remote_port })
		}
		MsgType::PortFwd => {
			let protocol = get_protocol(src, "PortFwd")?;
			let local_host = get_string(src, "PortFwd", "local_host")?;
			let local_port = get_port(src, "PortFwd", "local_port")?;
			let remote_host = get_string(src, "PortFwd", "remote_host")?;
			let remote_port = get_port(src, "PortFwd", "remote_port")?;
			Ok(Message::PortFwd {
				protocol,
				local_host,
				local_port,
				remote_host,
				remote_port,
			})
		}
		MsgType::SocksConnect => {
			let remote_host = get_string(src, "SocksConnect", "remote_host")?;
			let remote_port = get_port(src, "SocksConnect", "remote_port")?;
			Ok(Message::SocksConnect { remote_host, remote_port })
		}
		MsgType::SocksAssociate => Ok(Message::SocksAssociate),
		MsgType::SocksDatagram => {
			let addr = get_string(src, "SocksDatagram", "addr")?;
			let port = get_port(src, "SocksDatagram", "port")?;
			ensure!(
				src.remaining() >= 4,
				TruncatedSnafu { tag: "SocksDatagram", field: "data" }
			);
			let len = src.get_u32() as usize;
			ensure!(
				src.remaining() >= len,
				TruncatedSnafu { tag: "SocksDatagram", field: "data" }
			);
			let data = src.split_to(len).freeze();
			Ok(Message::SocksDatagram { addr, port, data })
		}
		MsgType::Other(value) => UnknownMessageTypeSnafu { value }.fail(),
	}
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtoError> {
	ensure!(s.len() <= MAX_STRING, StringTooLongSnafu { len: s.len() });
	dst.put_u16(s.len() as u16);
	dst.put_slice(s.as_bytes());
	Ok(())
}

fn get_string(src: &mut BytesMut, tag: &'static str, field: &'static str) -> Result<String, ProtoError> {
	ensure!(src.remaining() >= 2, TruncatedSnafu { tag, field });
	let len = src.get_u16() as usize;
	ensure!(len <= MAX_STRING, StringTooLongSnafu { len });
	ensure!(src.remaining() >= len, TruncatedSnafu { tag, field });
	let raw = src.split_to(len);
	String::from_utf8(raw.to_vec()).map_err(|source| {
		use snafu::IntoError as _;
		FailParseStringSnafu.into_error(source)
	})
}

fn get_port(src: &mut BytesMut, tag: &'static str, field: &'static str) -> Result<u16, ProtoError> {
	ensure!(src.remaining() >= 2, TruncatedSnafu { tag, field });
	Ok(src.get_u16())
}

fn get_protocol(src: &mut BytesMut, tag: &'static str) -> Result<Protocol, ProtoError> {
	ensure!(src.remaining() >= 1, TruncatedSnafu { tag, field: "protocol" });
	let protocol = Protocol::from(src.get_u8());
	ensure!(
		!matches!(protocol, Protocol::Other(_)),
		UnknownProtocolSnafu { value: u8::from(protocol) }
	);
	Ok(protocol)
}

#[cfg(test)]
mod test {
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::*;

	fn all_variants() -> Vec<Message> {
		vec![
			Message::Hello { id: String::from("endpoint-a") },
			Message::Foreground { exec: String::from("/bin/sh"), pty: true },
			Message::Foreground { exec: String::new(), pty: false },
			Message::Connect {
				protocol:    Protocol::Tcp,
				remote_host: String::from("example.com"),
				remote_port: 80,
			},
			Message::Connect {
				protocol:    Protocol::Udp,
				remote_host: String::from("::1"),
				remote_port: 53,
			},
			Message::PortFwd {
				protocol:    Protocol::Tcp,
				local_host:  String::from("127.0.0.1"),
				local_port:  9000,
				remote_host: String::from("127.0.0.1"),
				remote_port: 9001,
			},
			Message::SocksConnect {
				remote_host: String::from("target.test"),
				remote_port: 443,
			},
			Message::SocksAssociate,
			Message::SocksDatagram {
				addr: String::from("10.0.0.1"),
				port: 5353,
				data: Bytes::from_static(b"\x00\x01payload\xff"),
			},
		]
	}

	/// Every variant round-trips bit-exactly.
	#[test_log::test(tokio::test)]
	async fn test_msg_1() -> eyre::Result<()> {
		for msg in all_variants() {
			let buffer = Vec::with_capacity(256);
			let mut writer = FramedWrite::new(buffer, MessageCodec);
			writer.send(msg.clone()).await?;
			let buffer = writer.get_ref();
			let mut reader = FramedRead::new(buffer.as_slice(), MessageCodec);
			let frame = reader.next().await.unwrap()?;
			assert_eq!(msg, frame);
		}
		Ok(())
	}

	/// A stream of messages preserves boundaries and order.
	#[test_log::test(tokio::test)]
	async fn test_msg_2() -> eyre::Result<()> {
		let buffer = Vec::with_capacity(1024);
		let mut writer = FramedWrite::new(buffer, MessageCodec);
		for msg in all_variants() {
			writer.send(msg).await?;
		}
		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), MessageCodec);
		for msg in all_variants() {
			assert_eq!(reader.next().await.unwrap()?, msg);
		}
		assert!(reader.next().await.is_none());
		Ok(())
	}

	/// Data not fully arrived
	#[test_log::test(tokio::test)]
	async fn test_msg_3() -> eyre::Result<()> {
		for msg in all_variants() {
			let buffer = Vec::with_capacity(256);
			let mut writer = FramedWrite::new(buffer, MessageCodec);
			writer.send(msg.clone()).await?;
			let mut buffer = writer.into_inner();
			let full_len = buffer.len();
			let mut half_b = buffer.split_off(full_len / 2);
			let mut half_a = buffer;
			{
				let mut reader = FramedRead::new(half_a.as_slice(), MessageCodec);
				assert!(matches!(
					reader.next().await.unwrap().unwrap_err(),
					ProtoError::BytesRemaining
				));
			}
			half_a.append(&mut half_b);
			let mut reader = FramedRead::new(half_a.as_slice(), MessageCodec);
			assert_eq!(reader.next().await.unwrap()?, msg);
		}
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_msg_rejects_unknown_tag() -> eyre::Result<()> {
		let mut raw = BytesMut::new();
		raw.put_u32(1);
		raw.put_u8(0xEE);
		let raw = raw.freeze();
		let mut reader = FramedRead::new(raw.as_ref(), MessageCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::UnknownMessageType { value: 0xEE, .. }
		));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_msg_rejects_truncated_body() -> eyre::Result<()> {
		// Hello frame whose declared string length overruns the body.
		let mut raw = BytesMut::new();
		raw.put_u32(3);
		raw.put_u8(MsgType::Hello.into());
		raw.put_u16(40);
		let raw = raw.freeze();
		let mut reader = FramedRead::new(raw.as_ref(), MessageCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::Truncated { tag: "Hello", .. }
		));
		Ok(())
	}

	#[test]
	fn tags_are_stable() {
		let tags: Vec<_> = all_variants().iter().map(Message::tag).collect();
		assert!(tags.contains(&"Hello"));
		assert!(tags.contains(&"SocksDatagram"));
	}
}
