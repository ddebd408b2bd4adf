use squall_session::{DispatcherOpts, SessionOpts};

use super::persistent::PersistentConfig;

/// Options derived from the persistent config, in the shapes the session
/// layer wants.
pub struct Config {
	pub session_opts:    SessionOpts,
	pub dispatcher_opts: DispatcherOpts,
}

impl Config {
	pub fn from_persist(config: &PersistentConfig) -> Self {
		Self {
			session_opts:    SessionOpts {
				timeout: config.common.timeout,
			},
			dispatcher_opts: DispatcherOpts {
				id:          config.common.id.clone(),
				udp_timeout: config.common.udp_timeout,
			},
		}
	}
}
