use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::proxy::messages::PoolInbound;
use crate::proxy::ProxyHandle;

/// Bounded wait before the process treats any still-registered sandbox as leaked, per §5/§6.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Inner {
	handles: Mutex<HashMap<u64, ProxyHandle>>,
	changed: Notify,
	next_id: AtomicU64,
}

/// Tracks every sandbox-owning proxy spawned by this process so a termination signal can drain
/// them within a bounded wait (§5, §6). Proxies register on `Start`/first `Run` and deregister
/// once they emit `ContainerRemoved`; modeled on the teacher's debounced termination-signal
/// handling (repeated signals escalate urgency, they don't restart the wait).
#[derive(Clone)]
pub struct ShutdownGroup {
	inner: Arc<Inner>,
}

/// Returned by [`ShutdownGroup::register`]; dropping or calling [`ShutdownGuard::complete`]
/// deregisters the proxy.
pub struct ShutdownGuard {
	id: u64,
	inner: Arc<Inner>,
}

impl ShutdownGuard {
	pub fn complete(self) {
		// Drop performs the deregistration.
	}
}

impl Drop for ShutdownGuard {
	fn drop(&mut self) {
		let inner = self.inner.clone();
		let id = self.id;
		tokio::spawn(async move {
			inner.handles.lock().await.remove(&id);
			inner.changed.notify_waiters();
		});
	}
}

impl ShutdownGroup {
	pub fn new() -> Self {
		ShutdownGroup {
			inner: Arc::new(Inner {
				handles: Mutex::new(HashMap::new()),
				changed: Notify::new(),
				next_id: AtomicU64::new(0),
			}),
		}
	}

	pub async fn register(&self, handle: ProxyHandle) -> ShutdownGuard {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner.handles.lock().await.insert(id, handle);
		ShutdownGuard {
			id,
			inner: self.inner.clone(),
		}
	}

	pub async fn active_count(&self) -> usize {
		self.inner.handles.lock().await.len()
	}

	/// Sends `Remove` to every registered proxy and waits up to `grace` for all of them to
	/// deregister. Any proxy still registered when the deadline passes is left to the caller
	/// to force-exit around (this crate never calls `std::process::exit`).
	#[tracing::instrument(skip(self))]
	pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
		let handles: Vec<ProxyHandle> = self.inner.handles.lock().await.values().cloned().collect();
		for handle in &handles {
			// Best-effort: a proxy that already tore itself down has a closed channel.
			let _ = handle.send(PoolInbound::Remove).await;
		}

		let deadline = tokio::time::Instant::now() + grace;
		loop {
			if self.inner.handles.lock().await.is_empty() {
				return ShutdownOutcome::Clean;
			}

			let now = tokio::time::Instant::now();
			if now >= deadline {
				let leaked = self.inner.handles.lock().await.len();
				tracing::warn!(leaked, "shutdown grace period elapsed with sandboxes still registered");
				return ShutdownOutcome::TimedOut { leaked };
			}

			let _ = tokio::time::timeout(deadline - now, self.inner.changed.notified()).await;
		}
	}
}

impl Default for ShutdownGroup {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
	Clean,
	TimedOut { leaked: usize },
}
