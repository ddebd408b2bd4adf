use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Process-wide task context: the cancellation root and the tracker every
/// long-lived background task is spawned onto. Child tokens are handed to
/// sessions, handlers and relays so that one `cancel()` tears the whole
/// tree down.
pub struct AppContext {
	pub token: CancellationToken,
	pub tasks: TaskTracker,
}

impl Default for AppContext {
	fn default() -> Self {
		Self {
			token: CancellationToken::new(),
			tasks: TaskTracker::new(),
		}
	}
}

impl AppContext {
	/// Cancel everything and wait for tracked tasks to drain.
	pub async fn shutdown(&self) {
		self.token.cancel();
		self.tasks.close();
		self.tasks.wait().await;
	}
}
