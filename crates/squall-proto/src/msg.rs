use bytes::Bytes;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Transport protocol a forward applies to.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
	Tcp = 0,
	Udp = 1,
	#[num_enum(catch_all)]
	Other(u8),
}

impl std::fmt::Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Tcp => f.write_str("tcp"),
			Self::Udp => f.write_str("udp"),
			Self::Other(value) => write!(f, "protocol({value})"),
		}
	}
}

/// Message type discriminants on the wire. This enum is the registry the
/// decoder consults; a value outside it is a protocol violation.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
	Hello          = 0,
	Foreground     = 1,
	Connect        = 2,
	PortFwd        = 3,
	SocksConnect   = 4,
	SocksAssociate = 5,
	SocksDatagram  = 6,
	#[num_enum(catch_all)]
	Other(u8),
}

/// One control message. The session carries these on its two reserved
/// channels; the SOCKS UDP relay additionally carries `SocksDatagram` on its
/// per-job channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	/// Identity exchange; first message in both directions.
	Hello {
		id: String,
	},
	/// Interactive shell or raw pipe request.
	Foreground {
		exec: String,
		pty:  bool,
	},
	/// One-shot forward connect: dial `remote_host:remote_port` and splice
	/// it onto the channel that follows.
	Connect {
		protocol:    Protocol,
		remote_host: String,
		remote_port: u16,
	},
	/// Listen-and-forward request: the receiver listens on its local
	/// endpoint and forwards each connection back with `Connect` messages.
	PortFwd {
		protocol:    Protocol,
		local_host:  String,
		local_port:  u16,
		remote_host: String,
		remote_port: u16,
	},
	/// SOCKS5 CONNECT target.
	SocksConnect {
		remote_host: String,
		remote_port: u16,
	},
	/// Begin a SOCKS5 UDP ASSOCIATE relay.
	SocksAssociate,
	/// One UDP datagram on an associate relay channel.
	SocksDatagram {
		addr: String,
		port: u16,
		data: Bytes,
	},
}

impl Message {
	/// Stable tag for logs and error reports.
	pub fn tag(&self) -> &'static str {
		match self {
			Self::Hello { .. } => "Hello",
			Self::Foreground { .. } => "Foreground",
			Self::Connect { .. } => "Connect",
			Self::PortFwd { .. } => "PortFwd",
			Self::SocksConnect { .. } => "SocksConnect",
			Self::SocksAssociate => "SocksAssociate",
			Self::SocksDatagram { .. } => "SocksDatagram",
		}
	}

	pub fn msg_type(&self) -> MsgType {
		match self {
			Self::Hello { .. } => MsgType::Hello,
			Self::Foreground { .. } => MsgType::Foreground,
			Self::Connect { .. } => MsgType::Connect,
			Self::PortFwd { .. } => MsgType::PortFwd,
			Self::SocksConnect { .. } => MsgType::SocksConnect,
			Self::SocksAssociate => MsgType::SocksAssociate,
			Self::SocksDatagram { .. } => MsgType::SocksDatagram,
		}
	}
}
