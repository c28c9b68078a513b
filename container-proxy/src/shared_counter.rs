use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// Seam over a per-namespace counter that, in the original system, is replicated cluster-wide
/// via a CRDT. That replication is out of scope here (§9 design notes) — the proxy only
/// increments, decrements, and reads one; a pluggable trait is the entire contract.
#[async_trait]
pub trait SharedCounter: Send + Sync {
	async fn incr(&self, by: i64) -> i64;
	async fn decr(&self, by: i64) -> i64;
	async fn get(&self) -> i64;
}

/// Process-local counter suitable for single-node deployments and tests. Does not replicate
/// across hosts.
#[derive(Debug, Default)]
pub struct LocalSharedCounter {
	value: AtomicI64,
}

impl LocalSharedCounter {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait]
impl SharedCounter for LocalSharedCounter {
	async fn incr(&self, by: i64) -> i64 {
		self.value.fetch_add(by, Ordering::SeqCst) + by
	}

	async fn decr(&self, by: i64) -> i64 {
		self.value.fetch_sub(by, Ordering::SeqCst) - by
	}

	async fn get(&self) -> i64 {
		self.value.load(Ordering::SeqCst)
	}
}
