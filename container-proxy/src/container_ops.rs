use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::activation::{ActionMetadata, ActivationLogs, ActivationRecord, ActivationResponse, Interval};
use crate::error::{ContainerOpsError, InitError, LogCollectError};

/// The executable/image descriptor carried on `Start(exec, memory)`.
#[derive(Debug, Clone)]
pub struct Exec {
	pub kind: String,
	pub image: String,
}

/// Abstract capability set over one already-created sandbox (§4.1). Implementations (Docker,
/// Kubernetes, ...) are out of scope for this crate; only the contract is specified.
#[async_trait]
pub trait ContainerOps: Send + Sync {
	/// Initializes the sandbox for a specific action. `concurrency` is the action's declared
	/// `concurrencyLimit`, passed through so the runtime can configure its own request muxing.
	async fn initialize(
		&self,
		init_payload: Value,
		timeout: Duration,
		concurrency: u32,
	) -> Result<Interval, InitError>;

	/// Runs one invocation against an already-initialized sandbox.
	async fn run(
		&self,
		params: Value,
		env: Value,
		timeout: Duration,
		concurrency: u32,
	) -> Result<(Interval, ActivationResponse), ContainerOpsError>;

	/// Collects raw log bytes for the most recent activation. `wait_for_sentinel` blocks until
	/// the runtime-specific sentinel marker that terminates a per-activation log segment is
	/// observed or `limit` bytes have been read, whichever comes first.
	async fn logs(&self, limit: u64, wait_for_sentinel: bool) -> Result<ActivationLogs, LogCollectError>;

	/// Closes any kept HTTP connection into the sandbox.
	async fn suspend(&self) -> Result<(), ContainerOpsError>;

	/// Re-establishes the HTTP connection into the sandbox before returning.
	async fn resume(&self) -> Result<(), ContainerOpsError>;

	/// Idempotent. Reclaims all sandbox resources.
	async fn destroy(&self) -> Result<(), ContainerOpsError>;
}

/// Creates a fresh sandbox. Kept separate from [`ContainerOps`] because the proxy does not
/// obtain a `ContainerOps` handle until creation succeeds (see the `Uninitialized -> Starting`
/// transition, §4.2).
#[async_trait]
pub trait ContainerFactory: Send + Sync {
	async fn create(&self, exec: &Exec, memory_mb: u32) -> Result<Arc<dyn ContainerOps>, ContainerOpsError>;
}

/// Publishes an activation's result to the calling controller. Must be invoked exactly once
/// per activation (§6).
#[async_trait]
pub trait Acker: Send + Sync {
	async fn ack(
		&self,
		transaction_id: &str,
		activation: &ActivationRecord,
		blocking: bool,
		controller_id: &str,
		user_id: &str,
		acknowledgment: Value,
	) -> anyhow::Result<()>;
}

/// Persists an activation record. May be skipped by the caller when the action's log limit is
/// zero and the response fits inline (§6) — that decision is made by the proxy, not this trait.
#[async_trait]
pub trait Store: Send + Sync {
	async fn store(
		&self,
		transaction_id: &str,
		activation: &ActivationRecord,
		user_context: &str,
	) -> anyhow::Result<()>;
}

/// Gathers logs for one activation out of a running or just-stopped sandbox.
#[async_trait]
pub trait LogCollector: Send + Sync {
	async fn collect(
		&self,
		transaction_id: &str,
		user_id: &str,
		activation_id: &str,
		ops: &dyn ContainerOps,
		action: &ActionMetadata,
	) -> Result<ActivationLogs, LogCollectError>;
}
