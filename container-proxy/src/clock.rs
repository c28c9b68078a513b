use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Monotonic time source. Abstracted so tests can control the passage of time instead of
/// sleeping on the wall clock.
pub trait Clock: Send + Sync {
	fn now(&self) -> Instant;
}

/// A single-shot timer. `fire()` resolves once `duration` has elapsed (or is cancelled, in
/// which case it never resolves).
#[async_trait]
pub trait TimerSource: Send + Sync {
	async fn sleep(&self, duration: Duration);
}

/// Real-clock implementation backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

#[async_trait]
impl TimerSource for SystemClock {
	async fn sleep(&self, duration: Duration) {
		tokio::time::sleep(duration).await;
	}
}

pub type SharedClock = Arc<dyn Clock>;
pub type SharedTimerSource = Arc<dyn TimerSource>;

pub fn system_clock() -> SharedClock {
	Arc::new(SystemClock)
}

pub fn system_timer_source() -> SharedTimerSource {
	Arc::new(SystemClock)
}
