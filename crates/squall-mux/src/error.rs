use std::backtrace::Backtrace;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MuxError {
	/// The mux (or the underlying connection) is gone.
	#[snafu(display("mux closed"))]
	Closed,

	/// The caller's cancellation token fired while waiting.
	#[snafu(display("operation cancelled"))]
	Cancelled,

	#[snafu(display("frame payload of {len} bytes exceeds the frame limit"))]
	FrameTooLarge {
		len:       usize,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown frame kind {value}"))]
	UnknownFrameKind {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("peer opened stream {id} with our own id parity"))]
	SynParity {
		id:        u32,
		backtrace: Backtrace,
	},

	#[snafu(display("peer reopened live stream {id}"))]
	SynInUse {
		id:        u32,
		backtrace: Backtrace,
	},

	// Caller should yield
	BytesRemaining,

	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for MuxError {
	#[inline(always)]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
