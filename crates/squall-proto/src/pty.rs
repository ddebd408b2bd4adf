use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::{BytesRemainingSnafu, ProtoError, UnknownControlKindSnafu};

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ControlKind {
	Resize = 0,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Out-of-band frame on the PTY sidechannel of a foreground job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyControl {
	Resize { rows: u16, cols: u16 },
}

/// Fixed five-byte frames: kind, then two u16 fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtyControlCodec;

impl Decoder for PtyControlCodec {
	type Error = ProtoError;
	type Item = PtyControl;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 5 {
			return Ok(None);
		}
		let kind = ControlKind::from(src.get_u8());
		ensure!(
			!matches!(kind, ControlKind::Other(_)),
			UnknownControlKindSnafu { value: u8::from(kind) }
		);
		let rows = src.get_u16();
		let cols = src.get_u16();
		Ok(Some(PtyControl::Resize { rows, cols }))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<PtyControl> for PtyControlCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: PtyControl, dst: &mut BytesMut) -> Result<(), Self::Error> {
		match item {
			PtyControl::Resize { rows, cols } => {
				dst.reserve(5);
				dst.put_u8(ControlKind::Resize.into());
				dst.put_u16(rows);
				dst.put_u16(cols);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::*;

	#[test_log::test(tokio::test)]
	async fn resize_round_trips() -> eyre::Result<()> {
		let frames = vec![
			PtyControl::Resize { rows: 24, cols: 80 },
			PtyControl::Resize { rows: 50, cols: 200 },
		];
		let buffer = Vec::with_capacity(16);
		let mut writer = FramedWrite::new(buffer, PtyControlCodec);
		for frame in &frames {
			writer.send(*frame).await?;
		}
		assert_eq!(writer.get_ref().len(), 10);
		let mut reader = FramedRead::new(writer.get_ref().as_slice(), PtyControlCodec);
		for frame in frames {
			assert_eq!(reader.next().await.unwrap()?, frame);
		}
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn unknown_kind_is_rejected() -> eyre::Result<()> {
		let raw = [9u8, 0, 0, 0, 0];
		let mut reader = FramedRead::new(&raw[..], PtyControlCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::UnknownControlKind { value: 9, .. }
		));
		Ok(())
	}
}
