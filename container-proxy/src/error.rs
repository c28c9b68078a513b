use std::time::Duration;

use crate::activation::Interval;

/// Failures surfaced directly by a [`ContainerOps`](crate::container_ops::ContainerOps) call:
/// timeout, transport failure, or a non-zero sandbox exit.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ContainerOpsError {
	#[error("operation timed out after {0:?}")]
	Timeout(Duration),
	#[error("transport failure talking to sandbox: {0}")]
	Transport(String),
	#[error("sandbox exited with non-zero status {0}")]
	NonZeroExit(i32),
}

/// Whether an `initialize` failure is attributable to the developer's code or to the
/// runtime/system itself. Only `Developer` is surfaced to the caller as an error message;
/// `System` is logged internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailureKind {
	Developer,
	System,
}

#[derive(Debug, thiserror::Error, Clone)]
#[error("initialize failed ({kind:?}): {message}")]
pub struct InitError {
	pub kind: InitFailureKind,
	pub interval: Interval,
	pub message: String,
}

/// Log collection failed. `partial` carries whatever lines were gathered before the failure;
/// the sandbox is destroyed regardless of which variant this is.
#[derive(Debug, thiserror::Error, Clone)]
pub enum LogCollectError {
	#[error("log collection failed after gathering {lines} partial lines")]
	Partial { lines: usize },
	#[error("log collection failed with no recoverable output")]
	Terminal,
}

/// Errors the [`MRSWCache`](crate::cache::MrswCache) can surface. These are internal-bug
/// conditions the cache itself detects (races against its own invariants); they are never
/// raised in the absence of a loader/writer/invalidator error.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
	/// A lookup observed its own in-flight read transition to `InvalidateInProgress` after
	/// publishing its future to a coalesced caller, but before the read completed successfully
	/// for this caller.
	#[error("stale read for cache key {key_hash:x}")]
	StaleRead { key_hash: u64 },
	/// A compare-and-set lost to a concurrent operation this cache's invariants say cannot
	/// happen (e.g. two writers observed in `WriteInProgress` for the same key).
	#[error("concurrent operation conflict for cache key {key_hash:x}")]
	ConcurrentOp { key_hash: u64 },
}
