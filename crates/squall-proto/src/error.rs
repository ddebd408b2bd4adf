use std::{backtrace::Backtrace, string::FromUtf8Error};

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("unknown message type {value}"))]
	UnknownMessageType {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown protocol {value}"))]
	UnknownProtocol {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown control frame kind {value}"))]
	UnknownControlKind {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("{tag} message body ends early at field {field}"))]
	Truncated {
		tag:       &'static str,
		field:     &'static str,
		backtrace: Backtrace,
	},

	#[snafu(display("message of {len} bytes exceeds the message limit"))]
	MessageTooLarge {
		len:       usize,
		backtrace: Backtrace,
	},

	#[snafu(display("string field of {len} bytes exceeds the field limit"))]
	StringTooLong {
		len:       usize,
		backtrace: Backtrace,
	},

	FailParseString {
		source:    FromUtf8Error,
		backtrace: Backtrace,
	},

	// Caller should yield
	BytesRemaining,

	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for ProtoError {
	#[inline(always)]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
