use std::backtrace::Backtrace;

use snafu::Snafu;
use squall_mux::MuxError;
use squall_proto::ProtoError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
	#[snafu(display("peer did not complete the control-channel handshake in time"))]
	HandshakeTimeout {
		backtrace: Backtrace,
	},

	#[snafu(display("peer never sent its identity"))]
	HandshakeFailed {
		backtrace: Backtrace,
	},

	#[snafu(display("control operation timed out"))]
	TimedOut,

	#[snafu(display("control operation cancelled"))]
	Cancelled,

	#[snafu(display("peer closed the session"))]
	PeerClosed,

	#[snafu(display("unknown message tag {value}"))]
	ProtocolViolation {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("decoding control message"))]
	Decode {
		source:    ProtoError,
		backtrace: Backtrace,
	},

	Mux {
		source:    MuxError,
		backtrace: Backtrace,
	},

	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}
