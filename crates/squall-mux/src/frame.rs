use bytes::{Buf, BufMut, Bytes};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::{BytesRemainingSnafu, FrameTooLargeSnafu, MuxError, UnknownFrameKindSnafu};

/// Largest payload a single DATA frame may carry. Writers chunk at this
/// size; a decoder seeing more treats the stream as corrupt.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Wire header: stream id (4), kind (1), payload length (4).
pub const HEADER_LEN: usize = 9;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
	/// Open a new stream. The k-th SYN from one side matches the k-th
	/// accept on the other.
	Syn    = 0,
	Data   = 1,
	/// Half-close: the sender will write no more data.
	Fin    = 2,
	/// Abortive close; the stream id may be forgotten immediately.
	Rst    = 3,
	/// Returns send credit to the peer; payload is a u32 byte count.
	Window = 4,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub id:      u32,
	pub kind:    FrameKind,
	pub payload: Bytes,
}

impl Frame {
	pub fn syn(id: u32) -> Self {
		Self { id, kind: FrameKind::Syn, payload: Bytes::new() }
	}

	pub fn data(id: u32, payload: Bytes) -> Self {
		Self { id, kind: FrameKind::Data, payload }
	}

	pub fn fin(id: u32) -> Self {
		Self { id, kind: FrameKind::Fin, payload: Bytes::new() }
	}

	pub fn rst(id: u32) -> Self {
		Self { id, kind: FrameKind::Rst, payload: Bytes::new() }
	}

	pub fn window(id: u32, credit: u32) -> Self {
		Self {
			id,
			kind: FrameKind::Window,
			payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
		}
	}

	/// Credit carried by a WINDOW frame.
	pub fn credit(&self) -> u32 {
		let mut buf = [0u8; 4];
		let len = self.payload.len().min(4);
		buf[..len].copy_from_slice(&self.payload[..len]);
		u32::from_be_bytes(buf)
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
	type Error = MuxError;
	type Item = Frame;

	fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < HEADER_LEN {
			return Ok(None);
		}

		let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
		ensure!(len <= MAX_PAYLOAD, FrameTooLargeSnafu { len });

		if src.len() < HEADER_LEN + len {
			src.reserve(HEADER_LEN + len - src.len());
			return Ok(None);
		}

		let id = src.get_u32();
		let kind = FrameKind::from(src.get_u8());
		ensure!(
			!matches!(kind, FrameKind::Other(_)),
			UnknownFrameKindSnafu { value: u8::from(kind) }
		);
		src.advance(4);
		let payload = src.split_to(len).freeze();

		Ok(Some(Frame { id, kind, payload }))
	}

	fn decode_eof(&mut self, buf: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = MuxError;

	fn encode(&mut self, item: Frame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
		ensure!(
			item.payload.len() <= MAX_PAYLOAD,
			FrameTooLargeSnafu { len: item.payload.len() }
		);
		dst.reserve(HEADER_LEN + item.payload.len());
		dst.put_u32(item.id);
		dst.put_u8(item.kind.into());
		dst.put_u32(item.payload.len() as u32);
		dst.put_slice(&item.payload);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::*;

	/// Usual round trip
	#[test_log::test(tokio::test)]
	async fn test_frame_1() -> eyre::Result<()> {
		let vars = vec![
			Frame::syn(1),
			Frame::data(1, Bytes::from_static(b"hello mux")),
			Frame::window(1, 9),
			Frame::fin(1),
			Frame::rst(2),
		];
		let buffer = Vec::with_capacity(128);
		let mut writer = FramedWrite::new(buffer, FrameCodec);
		let mut expect_len = 0;
		for frame in &vars {
			expect_len += HEADER_LEN + frame.payload.len();
			writer.send(frame.clone()).await?;
			assert_eq!(writer.get_ref().len(), expect_len);
		}

		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), FrameCodec);
		for frame in vars {
			assert_eq!(reader.next().await.unwrap()?, frame);
		}
		Ok(())
	}

	/// Data not fully arrived
	#[test_log::test(tokio::test)]
	async fn test_frame_2() -> eyre::Result<()> {
		let frame = Frame::data(7, Bytes::from_static(b"partial payload"));
		let buffer = Vec::with_capacity(128);
		let mut writer = FramedWrite::new(buffer, FrameCodec);
		writer.send(frame.clone()).await?;
		let mut buffer = writer.into_inner();
		let full_len = buffer.len();
		let mut half_b = buffer.split_off(full_len / 2);
		let mut half_a = buffer;
		{
			let mut reader = FramedRead::new(half_a.as_slice(), FrameCodec);
			assert!(matches!(
				reader.next().await.unwrap().unwrap_err(),
				MuxError::BytesRemaining
			));
		}
		half_a.append(&mut half_b);
		let mut reader = FramedRead::new(half_a.as_slice(), FrameCodec);
		assert_eq!(reader.next().await.unwrap()?, frame);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_frame_rejects_oversize() -> eyre::Result<()> {
		let mut oversize = bytes::BytesMut::new();
		oversize.put_u32(1);
		oversize.put_u8(FrameKind::Data.into());
		oversize.put_u32((MAX_PAYLOAD + 1) as u32);
		let raw = oversize.freeze();
		let mut reader = FramedRead::new(raw.as_ref(), FrameCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			MuxError::FrameTooLarge { .. }
		));
		Ok(())
	}

	#[test]
	fn window_credit_round_trips() {
		assert_eq!(Frame::window(3, 0xDEAD_BEEF).credit(), 0xDEAD_BEEF);
		assert_eq!(Frame::window(3, 0).credit(), 0);
	}
}
