//! `ContainerProxy`: the finite-state-machine actor that owns one sandbox from birth to death
//! (§4.2). One task per proxy processes exactly one inbound message or background-task
//! completion at a time; `ContainerOps` calls that must not block the actor (a run pipeline, a
//! suspend, a destroy) are spawned and fold their result back in as an event, per §9's design
//! note on actor-like state machines.

pub mod messages;
mod pipeline;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::activation::ActionMetadata;
use crate::clock::{SharedClock, SharedTimerSource};
use crate::config::ProxyConfig;
use crate::container_ops::{Acker, ContainerFactory, ContainerOps, Exec, LogCollector, Store};
use crate::shared_counter::SharedCounter;

use messages::{PoolInbound, PoolOutbound, ProxyDataSnapshot, ProxyPhase, RunMessage};
use pipeline::PipelineOutcome;

pub use messages::ProxyHandle;

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const INTERNAL_CHANNEL_CAPACITY: usize = 64;

/// Collaborators a proxy needs, gathered so `spawn_proxy` takes one argument instead of six.
/// Trait objects rather than generics: a pool holds many proxies of possibly-different backing
/// implementations in one collection, which `ContainerProxy<F, A, S, L, C>` would make
/// unnecessarily awkward (mirrors the `Arc<dyn ...>` seams the teacher uses for its own
/// workflow activities).
pub struct ProxyDeps {
	pub factory: Arc<dyn ContainerFactory>,
	pub acker: Arc<dyn Acker>,
	pub store: Arc<dyn Store>,
	pub log_collector: Arc<dyn LogCollector>,
	pub counter: Arc<dyn SharedCounter>,
	pub clock: SharedClock,
	pub timers: SharedTimerSource,
	pub config: ProxyConfig,
}

/// The live sandbox handle plus whatever is bound to it, mirroring §3's tagged `ProxyData`
/// variants. Kept separate from [`ProxyDataSnapshot`] because the pool must never see the
/// `Arc<dyn ContainerOps>` itself (§5: the sandbox is owned exclusively by its proxy).
enum ProxyData {
	NoData,
	Resources { kind: String, memory_mb: u32 },
	PreWarmed { ops: Arc<dyn ContainerOps>, kind: String, memory_mb: u32 },
	Warming { ops: Arc<dyn ContainerOps>, namespace: String, action: Arc<ActionMetadata>, last_used: Instant, active_count: u32 },
	WarmingCold { namespace: String, action: Arc<ActionMetadata>, last_used: Instant, active_count: u32 },
	Warmed { ops: Arc<dyn ContainerOps>, namespace: String, action: Arc<ActionMetadata>, last_used: Instant, active_count: u32 },
}

impl ProxyData {
	fn snapshot(&self) -> ProxyDataSnapshot {
		match self {
			ProxyData::NoData => ProxyDataSnapshot::NoData,
			ProxyData::Resources { memory_mb, .. } => ProxyDataSnapshot::ResourcesData { memory_mb: *memory_mb },
			ProxyData::PreWarmed { kind, memory_mb, .. } => {
				ProxyDataSnapshot::PreWarmedData { kind: kind.clone(), memory_mb: *memory_mb }
			}
			ProxyData::Warming { namespace, action, active_count, .. } => ProxyDataSnapshot::WarmingData {
				namespace: namespace.clone(),
				action: action.name.clone(),
				active_count: *active_count,
			},
			ProxyData::WarmingCold { namespace, action, active_count, .. } => ProxyDataSnapshot::WarmingColdData {
				namespace: namespace.clone(),
				action: action.name.clone(),
				active_count: *active_count,
			},
			ProxyData::Warmed { namespace, action, active_count, .. } => ProxyDataSnapshot::WarmedData {
				namespace: namespace.clone(),
				action: action.name.clone(),
				active_count: *active_count,
			},
		}
	}

	fn active_count(&self) -> u32 {
		match self {
			ProxyData::Warming { active_count, .. }
			| ProxyData::WarmingCold { active_count, .. }
			| ProxyData::Warmed { active_count, .. } => *active_count,
			_ => 0,
		}
	}

	fn set_active_count(&mut self, value: u32) {
		match self {
			ProxyData::Warming { active_count, .. }
			| ProxyData::WarmingCold { active_count, .. }
			| ProxyData::Warmed { active_count, .. } => *active_count = value,
			_ => {}
		}
	}

	fn ops(&self) -> Option<Arc<dyn ContainerOps>> {
		match self {
			ProxyData::PreWarmed { ops, .. } | ProxyData::Warming { ops, .. } | ProxyData::Warmed { ops, .. } => {
				Some(ops.clone())
			}
			_ => None,
		}
	}

	fn namespace(&self) -> String {
		match self {
			ProxyData::Warming { namespace, .. } | ProxyData::WarmingCold { namespace, .. } | ProxyData::Warmed { namespace, .. } => {
				namespace.clone()
			}
			_ => String::new(),
		}
	}
}

/// Per-proxy counters tracked for the testable properties of §8 (`suspendCount <= resumeCount +
/// 1`, exactly one `destroy`/`ContainerRemoved`, ...). Tests observe these indirectly through
/// the outbound channel and the fake `ContainerOps`' own call counters.
struct ProxyState {
	phase: ProxyPhase,
	data: ProxyData,
	stashed: VecDeque<(Arc<ActionMetadata>, RunMessage)>,
	remove_latch: bool,
	removed_announced: bool,
	idle_timer_id: u64,
	suspend_count: u64,
	resume_count: u64,
	initialize_count: u64,
	run_count: u64,
	destroy_count: u64,
}

impl ProxyState {
	fn new() -> Self {
		ProxyState {
			phase: ProxyPhase::Uninitialized,
			data: ProxyData::NoData,
			stashed: VecDeque::new(),
			remove_latch: false,
			removed_announced: false,
			idle_timer_id: 0,
			suspend_count: 0,
			resume_count: 0,
			initialize_count: 0,
			run_count: 0,
			destroy_count: 0,
		}
	}

	fn is_terminal(&self) -> bool {
		matches!(self.phase, ProxyPhase::Removing) && matches!(self.data, ProxyData::NoData)
	}
}

enum Internal {
	CreatedForStart(Result<Arc<dyn ContainerOps>, crate::error::ContainerOpsError>),
	CreatedForRun { result: Result<Arc<dyn ContainerOps>, crate::error::ContainerOpsError>, action: Arc<ActionMetadata>, message: RunMessage },
	Pipeline(PipelineOutcome),
	Suspend { ok: bool },
	Resume { ok: bool, action: Arc<ActionMetadata>, message: RunMessage },
	Destroy,
	IdleTimeout { timer_id: u64 },
}

/// Spawns a proxy's actor task. Returns the handle the pool sends messages on, the receiving
/// half of its outbound channel, and the task's `JoinHandle` (useful in tests to await clean
/// exit).
pub fn spawn_proxy(deps: Arc<ProxyDeps>) -> (ProxyHandle, mpsc::Receiver<PoolOutbound>, tokio::task::JoinHandle<()>) {
	let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
	let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
	let handle = tokio::spawn(run_actor(deps, inbound_rx, outbound_tx));
	(inbound_tx, outbound_rx, handle)
}

#[tracing::instrument(skip_all)]
async fn run_actor(deps: Arc<ProxyDeps>, mut inbound: mpsc::Receiver<PoolInbound>, outbound: mpsc::Sender<PoolOutbound>) {
	let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(INTERNAL_CHANNEL_CAPACITY);
	let mut state = ProxyState::new();

	loop {
		tokio::select! {
			msg = inbound.recv() => {
				match msg {
					Some(msg) => handle_inbound(&mut state, &deps, &outbound, &internal_tx, msg).await,
					None => break,
				}
			}
			Some(event) = internal_rx.recv() => {
				handle_internal(&mut state, &deps, &outbound, &internal_tx, event).await;
			}
		}

		if state.is_terminal() {
			break;
		}
	}
}

fn transition(state: &mut ProxyState, outbound: &mpsc::Sender<PoolOutbound>, to: ProxyPhase) {
	let from = state.phase;
	if from == to {
		return;
	}
	tracing::debug!(?from, ?to, "proxy transition");
	state.phase = to;
	let _ = outbound.try_send(PoolOutbound::Transition { from, to });
}

/// Sends `ContainerRemoved` at most once per proxy (§8: "exactly one `ContainerRemoved` is
/// emitted").
fn announce_removed(state: &mut ProxyState, outbound: &mpsc::Sender<PoolOutbound>) {
	if !state.removed_announced {
		state.removed_announced = true;
		let _ = outbound.try_send(PoolOutbound::ContainerRemoved);
	}
}

fn arm_idle_timer(state: &mut ProxyState, deps: &Arc<ProxyDeps>, internal_tx: &mpsc::Sender<Internal>) {
	state.idle_timer_id += 1;
	let timer_id = state.idle_timer_id;
	let deps = deps.clone();
	let internal_tx = internal_tx.clone();
	tokio::spawn(async move {
		deps.timers.sleep(deps.config.pause_grace).await;
		let _ = internal_tx.send(Internal::IdleTimeout { timer_id }).await;
	});
}

fn action_exec(action: &ActionMetadata) -> Exec {
	Exec { kind: action.kind.clone(), image: action.path.clone() }
}

/// The bound action's declared `concurrencyLimit`, or 1 once nothing is bound yet.
fn concurrency_capacity(data: &ProxyData, config: &ProxyConfig) -> u32 {
	match data {
		ProxyData::Warming { action, .. } | ProxyData::WarmingCold { action, .. } | ProxyData::Warmed { action, .. } => {
			action.limits.effective_concurrency_limit(config)
		}
		_ => 1,
	}
}

async fn handle_inbound(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	msg: PoolInbound,
) {
	match msg {
		PoolInbound::Start { exec, memory_mb } => on_start(state, deps, internal_tx, outbound, exec, memory_mb),
		PoolInbound::Run { action, message } => on_run(state, deps, outbound, internal_tx, action, message),
		PoolInbound::Remove => on_remove(state, deps, outbound, internal_tx),
	}
}

fn on_start(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	internal_tx: &mpsc::Sender<Internal>,
	outbound: &mpsc::Sender<PoolOutbound>,
	exec: Exec,
	memory_mb: u32,
) {
	if !matches!(state.phase, ProxyPhase::Uninitialized) {
		return;
	}
	transition(state, outbound, ProxyPhase::Starting);
	state.data = ProxyData::Resources { kind: exec.kind.clone(), memory_mb };

	let deps = deps.clone();
	let internal_tx = internal_tx.clone();
	tokio::spawn(async move {
		let result = deps.factory.create(&exec, memory_mb).await;
		let _ = internal_tx.send(Internal::CreatedForStart(result)).await;
	});
}

fn on_run(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	action: Arc<ActionMetadata>,
	message: RunMessage,
) {
	match state.phase {
		ProxyPhase::Uninitialized => {
			transition(state, outbound, ProxyPhase::Running);
			state.data = ProxyData::WarmingCold {
				namespace: action.namespace.clone(),
				action: action.clone(),
				last_used: deps.clock.now(),
				active_count: 1,
			};
			state.run_count += 1;

			let deps2 = deps.clone();
			let internal_tx2 = internal_tx.clone();
			let exec = action_exec(&action);
			tokio::spawn(async move {
				let result = deps2.factory.create(&exec, 0).await;
				let _ = internal_tx2.send(Internal::CreatedForRun { result, action, message }).await;
			});
		}
		ProxyPhase::Started => {
			if let Some(ops) = state.data.ops() {
				transition(state, outbound, ProxyPhase::Running);
				state.data = ProxyData::Warming {
					ops: ops.clone(),
					namespace: action.namespace.clone(),
					action: action.clone(),
					last_used: deps.clock.now(),
					active_count: 1,
				};
				state.initialize_count += 1;
				state.run_count += 1;
				spawn_pipeline(deps, internal_tx, ops, action.namespace.clone(), action, message, true);
			}
		}
		ProxyPhase::Ready => {
			let capacity = action.limits.effective_concurrency_limit(&deps.config);
			if state.data.active_count() < capacity {
				if let Some(ops) = state.data.ops() {
					let namespace = state.data.namespace();
					bump_active(state, deps, 1);
					transition(state, outbound, ProxyPhase::Running);
					state.run_count += 1;
					spawn_pipeline(deps, internal_tx, ops, namespace, action, message, false);
					return;
				}
			}
			state.stashed.push_back((action, message));
		}
		ProxyPhase::Running => {
			let capacity = action.limits.effective_concurrency_limit(&deps.config);
			if state.data.active_count() < capacity && matches!(state.data, ProxyData::Warmed { .. }) {
				if let Some(ops) = state.data.ops() {
					let namespace = state.data.namespace();
					bump_active(state, deps, 1);
					state.run_count += 1;
					spawn_pipeline(deps, internal_tx, ops, namespace, action, message, false);
					return;
				}
			}
			state.stashed.push_back((action, message));
		}
		ProxyPhase::Paused => {
			if let Some(ops) = state.data.ops() {
				let internal_tx2 = internal_tx.clone();
				let resume_timeout = deps.config.resume_timeout;
				tokio::spawn(async move {
					let ok = tokio::time::timeout(resume_timeout, ops.resume()).await.map(|r| r.is_ok()).unwrap_or(false);
					let _ = internal_tx2.send(Internal::Resume { ok, action, message }).await;
				});
			} else {
				state.stashed.push_back((action, message));
			}
		}
		ProxyPhase::Pausing | ProxyPhase::Starting => {
			state.stashed.push_back((action, message));
		}
		ProxyPhase::Removing => {
			let _ = outbound.try_send(PoolOutbound::RescheduleJob { action, message });
		}
	}
}

fn on_remove(state: &mut ProxyState, deps: &Arc<ProxyDeps>, outbound: &mpsc::Sender<PoolOutbound>, internal_tx: &mpsc::Sender<Internal>) {
	match state.phase {
		ProxyPhase::Running => {
			state.remove_latch = true;
		}
		ProxyPhase::Removing => {}
		_ => {
			transition(state, outbound, ProxyPhase::Removing);
			begin_destroy(state, deps, outbound, internal_tx);
		}
	}
}

fn begin_destroy(state: &mut ProxyState, deps: &Arc<ProxyDeps>, outbound: &mpsc::Sender<PoolOutbound>, internal_tx: &mpsc::Sender<Internal>) {
	match state.data.ops() {
		Some(ops) => {
			let internal_tx = internal_tx.clone();
			let destroy_timeout = deps.config.destroy_timeout;
			tokio::spawn(async move {
				match tokio::time::timeout(destroy_timeout, ops.destroy()).await {
					Ok(Ok(())) => {}
					Ok(Err(err)) => {
						tracing::warn!(error = %err, "destroy failed; treating sandbox as gone regardless");
					}
					Err(_) => {
						tracing::warn!("destroy timed out; treating sandbox as gone regardless");
					}
				}
				let _ = internal_tx.send(Internal::Destroy).await;
			});
		}
		None => {
			state.destroy_count += 1;
			state.data = ProxyData::NoData;
			announce_removed(state, outbound);
		}
	}
}

async fn handle_internal(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	event: Internal,
) {
	// Once destruction is underway, a lingering create/suspend/resume completion from before
	// `Remove` interrupted it is moot; only the destroy completion itself still matters.
	if matches!(state.phase, ProxyPhase::Removing)
		&& !matches!(event, Internal::Destroy | Internal::Pipeline(_))
	{
		return;
	}

	match event {
		Internal::CreatedForStart(Ok(ops)) => {
			let (kind, memory_mb) = match &state.data {
				ProxyData::Resources { kind, memory_mb } => (kind.clone(), *memory_mb),
				_ => (String::new(), 0),
			};
			state.data = ProxyData::PreWarmed { ops, kind, memory_mb };
			transition(state, outbound, ProxyPhase::Started);
			let _ = outbound.try_send(PoolOutbound::NeedWork(state.data.snapshot()));
		}
		Internal::CreatedForStart(Err(err)) => {
			tracing::warn!(error = %err, "sandbox creation failed during prewarm");
			state.data = ProxyData::NoData;
			announce_removed(state, outbound);
			transition(state, outbound, ProxyPhase::Removing);
		}
		Internal::CreatedForRun { result: Ok(ops), action, message } => {
			state.data = ProxyData::Warming {
				ops: ops.clone(),
				namespace: action.namespace.clone(),
				action: action.clone(),
				last_used: deps.clock.now(),
				active_count: 1,
			};
			state.initialize_count += 1;
			spawn_pipeline(deps, internal_tx, ops, action.namespace.clone(), action, message, true);
		}
		Internal::CreatedForRun { result: Err(err), action, message } => {
			tracing::warn!(error = %err, action = %action.name, "sandbox creation failed");
			let now = deps.clock.now();
			let record = pipeline::creation_failure_record(&action.namespace, &action, &message, now);
			pipeline::ack_and_store(deps, &message, &record).await;
			state.data = ProxyData::NoData;
			announce_removed(state, outbound);
			transition(state, outbound, ProxyPhase::Removing);
		}
		Internal::Pipeline(outcome) => on_pipeline_done(state, deps, outbound, internal_tx, outcome),
		Internal::Suspend { ok } => on_suspend_done(state, deps, outbound, internal_tx, ok),
		Internal::Resume { ok, action, message } => on_resume_done(state, deps, outbound, internal_tx, ok, action, message),
		Internal::Destroy => {
			state.destroy_count += 1;
			state.data = ProxyData::NoData;
			announce_removed(state, outbound);
		}
		Internal::IdleTimeout { timer_id } => on_idle_timeout(state, deps, outbound, internal_tx, timer_id),
	}
}

fn spawn_pipeline(
	deps: &Arc<ProxyDeps>,
	internal_tx: &mpsc::Sender<Internal>,
	ops: Arc<dyn ContainerOps>,
	namespace: String,
	action: Arc<ActionMetadata>,
	message: RunMessage,
	needs_init: bool,
) {
	let deps = deps.clone();
	let internal_tx = internal_tx.clone();
	tokio::spawn(async move {
		let outcome = pipeline::run_pipeline(deps, ops, namespace, action, message, needs_init).await;
		let _ = internal_tx.send(Internal::Pipeline(outcome)).await;
	});
}

fn on_pipeline_done(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	outcome: PipelineOutcome,
) {
	bump_active(state, deps, -1);

	if outcome.container_fatal {
		transition(state, outbound, ProxyPhase::Removing);
		begin_destroy(state, deps, outbound, internal_tx);
		return;
	}

	let ops = match outcome.ops {
		Some(ops) => ops,
		None => return,
	};
	let active_count = state.data.active_count();

	state.data = ProxyData::Warmed {
		ops,
		namespace: outcome.namespace,
		action: outcome.action,
		last_used: deps.clock.now(),
		active_count,
	};

	if state.remove_latch && active_count == 0 {
		transition(state, outbound, ProxyPhase::Removing);
		begin_destroy(state, deps, outbound, internal_tx);
		return;
	}

	// Refill up to the bound action's concurrency limit rather than one-at-a-time: a
	// concurrency-enabled action should keep as many stashed runs in flight as it's allowed,
	// not serialize them behind each other (§4.2's concurrency sub-machine).
	let capacity = concurrency_capacity(&state.data, &deps.config);
	while state.data.active_count() < capacity {
		let Some((action, message)) = state.stashed.pop_front() else {
			break;
		};
		let Some(ops) = state.data.ops() else {
			state.stashed.push_front((action, message));
			break;
		};
		let namespace = state.data.namespace();
		bump_active(state, deps, 1);
		state.run_count += 1;
		spawn_pipeline(deps, internal_tx, ops, namespace, action, message, false);
	}

	if state.data.active_count() == 0 {
		// §5 Ordering: `Transition(_, Running) -> NeedWork(warmed) -> Transition(Running, Ready)` —
		// NeedWork is emitted while the proxy is still `Running`, before the `Ready` transition.
		let _ = outbound.try_send(PoolOutbound::NeedWork(state.data.snapshot()));
		transition(state, outbound, ProxyPhase::Ready);
		arm_idle_timer(state, deps, internal_tx);
	}
}

fn on_suspend_done(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	ok: bool,
) {
	if ok {
		state.suspend_count += 1;
		transition(state, outbound, ProxyPhase::Paused);
		arm_idle_timer(state, deps, internal_tx);
	} else {
		tracing::warn!("suspend failed; removing sandbox immediately");
		announce_removed(state, outbound);
		transition(state, outbound, ProxyPhase::Removing);
		begin_destroy(state, deps, outbound, internal_tx);
	}
}

fn on_resume_done(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	ok: bool,
	action: Arc<ActionMetadata>,
	message: RunMessage,
) {
	if ok {
		state.resume_count += 1;
		if let Some(ops) = state.data.ops() {
			let namespace = state.data.namespace();
			bump_active(state, deps, 1);
			transition(state, outbound, ProxyPhase::Running);
			state.run_count += 1;
			spawn_pipeline(deps, internal_tx, ops, namespace, action, message, false);
		}
	} else {
		tracing::warn!(action = %action.name, "resume failed; rescheduling job and destroying sandbox");
		let _ = outbound.try_send(PoolOutbound::RescheduleJob { action, message });
		transition(state, outbound, ProxyPhase::Removing);
		begin_destroy(state, deps, outbound, internal_tx);
	}
}

fn on_idle_timeout(
	state: &mut ProxyState,
	deps: &Arc<ProxyDeps>,
	outbound: &mpsc::Sender<PoolOutbound>,
	internal_tx: &mpsc::Sender<Internal>,
	timer_id: u64,
) {
	if timer_id != state.idle_timer_id {
		return;
	}
	match state.phase {
		ProxyPhase::Ready => {
			if let Some(ops) = state.data.ops() {
				transition(state, outbound, ProxyPhase::Pausing);
				let internal_tx2 = internal_tx.clone();
				let suspend_timeout = deps.config.suspend_timeout;
				tokio::spawn(async move {
					let ok = tokio::time::timeout(suspend_timeout, ops.suspend()).await.map(|r| r.is_ok()).unwrap_or(false);
					let _ = internal_tx2.send(Internal::Suspend { ok }).await;
				});
			}
		}
		ProxyPhase::Paused => {
			transition(state, outbound, ProxyPhase::Removing);
			begin_destroy(state, deps, outbound, internal_tx);
		}
		_ => {}
	}
}

/// Adjusts `activeCount` and mirrors the delta into the cluster-wide `SharedCounter` (§9).
fn bump_active(state: &mut ProxyState, deps: &Arc<ProxyDeps>, delta: i32) {
	let new_count = (state.data.active_count() as i64 + delta as i64).max(0) as u32;
	state.data.set_active_count(new_count);

	let counter = deps.counter.clone();
	tokio::spawn(async move {
		if delta >= 0 {
			counter.incr(delta as i64).await;
		} else {
			counter.decr((-delta) as i64).await;
		}
	});
}
