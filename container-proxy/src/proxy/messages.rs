use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::activation::ActionMetadata;
use crate::container_ops::Exec;

/// Sending half of a proxy's inbound channel, handed to the pool when the proxy is spawned.
pub type ProxyHandle = mpsc::Sender<PoolInbound>;

/// Everything the proxy needs to drive one invocation through `ContainerOps`, independent of
/// transport (how `params`/`env` arrived is the pool's concern, not the proxy's).
#[derive(Debug, Clone)]
pub struct RunMessage {
	pub transaction_id: String,
	pub activation_id: String,
	pub user_id: String,
	pub controller_id: String,
	pub blocking: bool,
	pub user_context: String,
	/// Declared invocation arguments, pre-partitioning (§6's partitioning rule splits this into
	/// the `env`/`params` halves of the `run` call).
	pub params: Value,
	/// Additional pool-supplied environment entries layered in underneath the system fields
	/// (namespace/action/activation/transaction/deadline) that the proxy always injects.
	pub env: Value,
	/// Epoch-millis deadline for this activation; stringified into the `run` environment
	/// boundary per §6. Wall-clock, not the monotonic `arrived_at` below.
	pub deadline_epoch_millis: u64,
	/// API key material, included in the `run` environment boundary only when the action's
	/// `provide_api_key` annotation is set.
	pub api_key: Option<Value>,
	/// `message.transid.start` in §4.2's `waitTime` formula.
	pub arrived_at: Instant,
}

/// Messages the pool sends to a proxy (§6).
#[derive(Debug)]
pub enum PoolInbound {
	Start { exec: Exec, memory_mb: u32 },
	Run { action: Arc<ActionMetadata>, message: RunMessage },
	Remove,
}

/// The proxy's observable lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
	Uninitialized,
	Starting,
	Started,
	Running,
	Ready,
	Pausing,
	Paused,
	Removing,
}

/// What `NeedWork` carries, stripped of the live `ContainerOps` handle — the pool only needs to
/// know the sandbox's shape, never to call it directly (§5: "the sandbox is owned exclusively by
/// its proxy").
#[derive(Debug, Clone)]
pub enum ProxyDataSnapshot {
	NoData,
	ResourcesData { memory_mb: u32 },
	PreWarmedData { kind: String, memory_mb: u32 },
	WarmingData { namespace: String, action: String, active_count: u32 },
	WarmingColdData { namespace: String, action: String, active_count: u32 },
	WarmedData { namespace: String, action: String, active_count: u32 },
}

/// Messages a proxy publishes to the pool (§4.2, §6).
#[derive(Debug)]
pub enum PoolOutbound {
	NeedWork(ProxyDataSnapshot),
	ContainerRemoved,
	RescheduleJob { action: Arc<ActionMetadata>, message: RunMessage },
	Transition { from: ProxyPhase, to: ProxyPhase },
}
