use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use squall_core::types::TargetAddr;

use crate::conf::persistent::ForwardRule;

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Set a custom config file
	#[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
	pub config: Option<String>,

	/// Set configuration directory
	#[arg(short = 'C', visible_short_alias = 'd', long, value_name = "PATH")]
	pub config_dir: Option<PathBuf>,

	/// Show current version
	#[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
	pub version: bool,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct EndpointArgs {
	/// Listen for the peer on this address
	#[arg(short, long, value_name = "HOST:PORT", conflicts_with = "connect")]
	pub listen: Option<TargetAddr>,

	/// Dial the peer at this address
	#[arg(short, long, value_name = "HOST:PORT")]
	pub connect: Option<TargetAddr>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Run the controlling endpoint
	Master {
		#[command(flatten)]
		endpoint: EndpointArgs,

		/// Serve SOCKS5 on this address, relayed through the tunnel
		#[arg(long, value_name = "HOST:PORT")]
		socks: Option<TargetAddr>,

		/// Local forward, e.g. tcp:127.0.0.1:9000:10.0.0.1:80
		#[arg(short = 'L', long = "local", value_name = "PROTO:LHOST:LPORT:RHOST:RPORT")]
		local_forwards: Vec<ForwardRule>,

		/// Remote forward (the slave listens), same syntax
		#[arg(short = 'R', long = "remote", value_name = "PROTO:LHOST:LPORT:RHOST:RPORT")]
		remote_forwards: Vec<ForwardRule>,

		/// Run a command on the slave and attach to it
		#[arg(short, long, value_name = "CMD")]
		exec: Option<String>,

		/// Ask for a PTY-backed foreground job
		#[arg(long, action = ArgAction::SetTrue)]
		pty: bool,
	},

	/// Run the executing endpoint
	Slave {
		#[command(flatten)]
		endpoint: EndpointArgs,
	},

	/// Initialize a new default configuration file
	Init {
		/// Specify the configuration file format (yaml or toml)
		#[arg(short, long, value_enum, default_value = "yaml")]
		format: ConfigFormat,
	},
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
	Yaml,
	Toml,
}
