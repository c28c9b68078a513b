use std::time::Duration;

/// Knobs the state machine itself owns. Deliberately not a layered file/env config loader —
/// that remains out of scope (§1) — just the plain struct the proxy is constructed with.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
	/// Idle timer driving `Ready -> Pausing` (§5's `pauseGrace`).
	pub pause_grace: Duration,
	/// Bound on `ack` so shutdown stays deterministic even if the controller never responds.
	pub ack_timeout: Duration,
	/// Bound on `store` for the same reason.
	pub store_timeout: Duration,
	/// Bound on `resume()` before it is treated as a `ResumeFailed`.
	pub resume_timeout: Duration,
	/// Bound on `suspend()` before it is treated as a `SuspendFailed`.
	pub suspend_timeout: Duration,
	/// Bound on `destroy()`.
	pub destroy_timeout: Duration,
	/// Default `concurrencyLimit` used when an action does not declare one.
	pub default_concurrency_limit: u32,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		ProxyConfig {
			pause_grace: Duration::from_secs(10 * 60),
			ack_timeout: Duration::from_secs(30),
			store_timeout: Duration::from_secs(30),
			resume_timeout: Duration::from_secs(10),
			suspend_timeout: Duration::from_secs(10),
			destroy_timeout: Duration::from_secs(30),
			default_concurrency_limit: 1,
		}
	}
}

/// Knobs for the [`MrswCache`](crate::cache::MrswCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
	pub max_capacity: u64,
	pub time_to_live: Duration,
}

impl Default for CacheConfig {
	fn default() -> Self {
		CacheConfig {
			max_capacity: 10_000,
			// "TTL (5 minutes recommended)" per §4.3.
			time_to_live: Duration::from_secs(5 * 60),
		}
	}
}
