use std::{
	fmt,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
	str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A connect or listen target: either a literal IP address or a hostname to
/// be resolved on the side that dials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
	Domain(String, u16),
	IPv4(Ipv4Addr, u16),
	IPv6(Ipv6Addr, u16),
}

impl TargetAddr {
	pub fn new(host: &str, port: u16) -> Self {
		match host.parse::<IpAddr>() {
			Ok(IpAddr::V4(ip)) => Self::IPv4(ip, port),
			Ok(IpAddr::V6(ip)) => Self::IPv6(ip, port),
			Err(_) => Self::Domain(host.to_string(), port),
		}
	}

	pub fn host(&self) -> String {
		match self {
			Self::Domain(host, _) => host.clone(),
			Self::IPv4(ip, _) => ip.to_string(),
			Self::IPv6(ip, _) => ip.to_string(),
		}
	}

	pub fn port(&self) -> u16 {
		match self {
			Self::Domain(_, port) | Self::IPv4(_, port) | Self::IPv6(_, port) => *port,
		}
	}

	/// Resolve to a socket address, performing a DNS lookup for domains.
	pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
		match self {
			Self::IPv4(ip, port) => Ok(SocketAddr::from((*ip, *port))),
			Self::IPv6(ip, port) => Ok(SocketAddr::from((*ip, *port))),
			Self::Domain(host, port) => {
				tokio::net::lookup_host((host.as_str(), *port))
					.await?
					.next()
					.ok_or_else(|| {
						std::io::Error::new(
							std::io::ErrorKind::NotFound,
							format!("lookup {host}: no such host"),
						)
					})
			}
		}
	}
}

impl From<SocketAddr> for TargetAddr {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(v4) => Self::IPv4(*v4.ip(), v4.port()),
			SocketAddr::V6(v6) => Self::IPv6(*v6.ip(), v6.port()),
		}
	}
}

/// `host:port` for IPv4 and plain hostnames, `[host]:port` for anything
/// containing a colon.
impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::IPv4(ip, port) => write!(f, "{ip}:{port}"),
			Self::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
			Self::Domain(host, port) if host.contains(':') => write!(f, "[{host}]:{port}"),
			Self::Domain(host, port) => write!(f, "{host}:{port}"),
		}
	}
}

/// Format an arbitrary host string with the same bracketing rule as
/// [`TargetAddr`]'s `Display`.
pub fn join_host_port(host: &str, port: u16) -> String {
	if host.contains(':') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

impl FromStr for TargetAddr {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			let (host, rest) = rest
				.split_once(']')
				.ok_or_else(|| format!("invalid address {s:?}: missing ']'"))?;
			let port = rest
				.strip_prefix(':')
				.ok_or_else(|| format!("invalid address {s:?}: missing port"))?;
			(host, port)
		} else {
			s.rsplit_once(':')
				.ok_or_else(|| format!("invalid address {s:?}: missing port"))?
		};
		let port = port
			.parse::<u16>()
			.map_err(|e| format!("invalid port in {s:?}: {e}"))?;
		Ok(Self::new(host, port))
	}
}

impl Serialize for TargetAddr {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for TargetAddr {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}
