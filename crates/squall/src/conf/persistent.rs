use std::{path::PathBuf, str::FromStr, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use squall_core::types::TargetAddr;
use squall_proto::Protocol;

/// One forward, written `proto:lhost:lport:rhost:rport` (bracket IPv6
/// hosts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardRule {
	pub protocol: String,
	pub local:    TargetAddr,
	pub remote:   TargetAddr,
}

impl ForwardRule {
	pub fn protocol(&self) -> Protocol {
		if self.protocol.eq_ignore_ascii_case("udp") {
			Protocol::Udp
		} else {
			Protocol::Tcp
		}
	}
}

impl FromStr for ForwardRule {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (protocol, rest) = s
			.split_once(':')
			.ok_or_else(|| format!("invalid forward {s:?}: missing protocol"))?;
		if !protocol.eq_ignore_ascii_case("tcp") && !protocol.eq_ignore_ascii_case("udp") {
			return Err(format!("invalid forward {s:?}: protocol must be tcp or udp"));
		}
		let (local, remote) = split_endpoints(rest)
			.ok_or_else(|| format!("invalid forward {s:?}: expected lhost:lport:rhost:rport"))?;
		Ok(Self {
			protocol: protocol.to_ascii_lowercase(),
			local:    local.parse()?,
			remote:   remote.parse()?,
		})
	}
}

/// Split `lhost:lport:rhost:rport` into two `host:port` halves, honoring
/// `[...]` brackets around IPv6 hosts.
fn split_endpoints(s: &str) -> Option<(&str, &str)> {
	let mut depth = 0usize;
	let mut colons = Vec::new();
	for (idx, ch) in s.char_indices() {
		match ch {
			'[' => depth += 1,
			']' => depth = depth.saturating_sub(1),
			':' if depth == 0 => colons.push(idx),
			_ => {}
		}
	}
	// The middle colon of the four fields separates the endpoints.
	if colons.len() != 3 {
		return None;
	}
	let mid = colons[1];
	Some((&s[..mid], &s[mid + 1..]))
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub common: CommonOpt,
	pub master: MasterOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct CommonOpt {
	/// Identity announced in the handshake.
	#[educe(Default = "squall")]
	pub id: String,

	/// Deadline for control operations.
	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub timeout: Duration,

	/// Idle eviction timeout for UDP forward sessions.
	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(60)))]
	pub udp_timeout: Duration,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct MasterOpt {
	#[educe(Default = None)]
	pub socks: Option<TargetAddr>,

	#[educe(Default(expression = Vec::new()))]
	pub local_forwards: Vec<ForwardRule>,

	#[educe(Default(expression = Vec::new()))]
	pub remote_forwards: Vec<ForwardRule>,

	#[educe(Default = None)]
	pub exec: Option<String>,

	#[educe(Default = false)]
	pub pty: bool,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &PathBuf, format: &str) -> eyre::Result<()> {
		use std::io::Write as _;

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = std::fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = std::fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("Unsupported file format: {}", format)),
		}

		Ok(())
	}

	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		let dir = config_dir.unwrap_or_else(|| PathBuf::from("."));
		let config_toml = dir.join("config.toml");
		if config_toml.exists() {
			figment = figment.merge(Toml::file(config_toml));
		}
		let config_yaml = dir.join("config.yaml");
		if config_yaml.exists() {
			figment = figment.merge(Yaml::file(config_yaml));
		}

		// An explicit config file overrides the defaults.
		if let Some(config_path) = config_path {
			if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file(config_path));
			} else {
				figment = figment.merge(Toml::file(config_path));
			}
		}

		// Environment variables override config files.
		figment = figment.merge(Env::prefixed("SQUALL_").split("__"));

		Ok(figment.extract()?)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn forward_rule_parses() {
		let rule: ForwardRule = "tcp:127.0.0.1:9000:10.0.0.1:80".parse().unwrap();
		assert_eq!(rule.protocol(), Protocol::Tcp);
		assert_eq!(rule.local, TargetAddr::new("127.0.0.1", 9000));
		assert_eq!(rule.remote, TargetAddr::new("10.0.0.1", 80));

		let rule: ForwardRule = "udp:[::1]:53:[2001:db8::1]:53".parse().unwrap();
		assert_eq!(rule.protocol(), Protocol::Udp);
		assert_eq!(rule.local, TargetAddr::new("::1", 53));
		assert_eq!(rule.remote, TargetAddr::new("2001:db8::1", 53));

		assert!("tcp:only:one".parse::<ForwardRule>().is_err());
		assert!("icmp:a:1:b:2".parse::<ForwardRule>().is_err());
	}

	#[test]
	fn default_config_round_trips_through_yaml() {
		let config = PersistentConfig::default();
		let yaml = serde_yaml::to_string(&config).unwrap();
		let back: PersistentConfig = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(back.common.id, "squall");
		assert_eq!(back.common.timeout, Duration::from_secs(10));
		assert_eq!(back.common.udp_timeout, Duration::from_secs(60));
	}
}
