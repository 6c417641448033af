use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Shared process context: the root cancellation token every endpoint and
/// binding derives its own token from, plus the tracker keeping
/// fire-and-forget tasks alive until shutdown. Completed tasks drop out of
/// the tracker on their own.
#[derive(Debug, Default)]
pub struct AppContext {
	pub token: CancellationToken,
	pub tasks: TaskTracker,
}

impl AppContext {
	/// Cancels everything derived from the root token and waits for the
	/// tracked tasks to drain.
	pub async fn shutdown(&self) {
		self.token.cancel();
		self.tasks.close();
		self.tasks.wait().await;
	}
}
