//! SOCKS5 on both ends of the tunnel: the server-side handshake primitives
//! the master exposes to clients, and the slave-side CONNECT / UDP ASSOCIATE
//! handlers that terminate relayed requests.

use std::backtrace::Backtrace;

use snafu::Snafu;

mod associate;
mod connect;
pub mod proto;
pub mod udp;

pub use associate::*;
pub use connect::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SocksError {
	#[snafu(display("client speaks SOCKS version {version}, not 5"))]
	UnsupportedVersion {
		version:   u8,
		backtrace: Backtrace,
	},

	#[snafu(display("client offered no supported auth method"))]
	NoAcceptableAuth {
		backtrace: Backtrace,
	},

	#[snafu(display("unsupported command {command}"))]
	UnsupportedCommand {
		command:   u8,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown address type {atyp}"))]
	UnknownAddressType {
		atyp:      u8,
		backtrace: Backtrace,
	},

	#[snafu(display("fragmented SOCKS UDP frame (frag={frag}) rejected"))]
	FragmentNotSupported {
		frag:      u8,
		backtrace: Backtrace,
	},

	#[snafu(display("SOCKS UDP frame too short"))]
	UdpFrameTooShort {
		backtrace: Backtrace,
	},

	#[snafu(display("binding relay udp socket"))]
	BindSocket {
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	/// Failed to deliver a reply (the primary failure is already encoded in
	/// the reply code itself).
	#[snafu(display("writing SOCKS reply"))]
	ReplyWrite {
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("SOCKS reply write timed out"))]
	ReplyTimeout {
		backtrace: Backtrace,
	},

	Proto {
		source:    squall_proto::ProtoError,
		backtrace: Backtrace,
	},

	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for SocksError {
	#[inline(always)]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}

impl From<squall_proto::ProtoError> for SocksError {
	#[inline(always)]
	fn from(source: squall_proto::ProtoError) -> Self {
		use snafu::IntoError as _;
		ProtoSnafu.into_error(source)
	}
}
