//! Fakes shared by the end-to-end scenario tests in §8: a scriptable `ContainerOps`/
//! `ContainerFactory` pair, recording `Acker`/`Store`/`LogCollector` implementations, and a
//! hand-fired `TimerSource` so tests control `StateTimeout` without sleeping on wall time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use rivet_container_proxy::*;

pub fn sample_limits(concurrency_limit: u32) -> ActionLimits {
	ActionLimits {
		memory_mb: 256,
		timeout: Duration::from_secs(60),
		log_limit_bytes: 10 * 1024 * 1024,
		concurrency_limit,
	}
}

pub fn sample_action(concurrency_limit: u32) -> Arc<ActionMetadata> {
	Arc::new(ActionMetadata {
		namespace: "ns".into(),
		name: "greet".into(),
		path: "ns/greet".into(),
		kind: "nodejs:18".into(),
		limits: sample_limits(concurrency_limit),
		provide_api_key: false,
	})
}

pub fn sample_message(activation_id: &str) -> RunMessage {
	RunMessage {
		transaction_id: format!("tid-{activation_id}"),
		activation_id: activation_id.to_string(),
		user_id: "user-1".into(),
		controller_id: "controller-1".into(),
		blocking: true,
		user_context: "ctx".into(),
		params: json!({}),
		env: json!({}),
		deadline_epoch_millis: 0,
		api_key: None,
		arrived_at: Instant::now(),
	}
}

#[derive(Clone, Copy)]
pub enum InitScript {
	Succeed,
	FailDeveloper,
}

#[derive(Clone, Copy)]
pub enum RunScript {
	AlwaysSuccess,
	OddApplicationError,
}

/// A scriptable sandbox. One instance is reused across the lifetime of a warm proxy, mirroring
/// how the real `ContainerOps` handle persists across runs.
pub struct FakeOps {
	pub init_script: InitScript,
	pub run_script: RunScript,
	pub run_delay: Duration,
	pub suspend_ok: AtomicBool,
	pub resume_ok: AtomicBool,
	pub initialize_count: AtomicU64,
	pub run_count: AtomicU64,
	pub suspend_count: AtomicU64,
	pub resume_count: AtomicU64,
	pub destroy_count: AtomicU64,
	pub current_concurrent: AtomicI64,
	pub max_concurrent: AtomicI64,
}

impl FakeOps {
	pub fn new(init_script: InitScript, run_script: RunScript) -> Arc<Self> {
		Arc::new(FakeOps {
			init_script,
			run_script,
			run_delay: Duration::ZERO,
			suspend_ok: AtomicBool::new(true),
			resume_ok: AtomicBool::new(true),
			initialize_count: AtomicU64::new(0),
			run_count: AtomicU64::new(0),
			suspend_count: AtomicU64::new(0),
			resume_count: AtomicU64::new(0),
			destroy_count: AtomicU64::new(0),
			current_concurrent: AtomicI64::new(0),
			max_concurrent: AtomicI64::new(0),
		})
	}

	pub fn with_run_delay(mut self: Arc<Self>, delay: Duration) -> Arc<Self> {
		Arc::get_mut(&mut self).expect("no other owners yet").run_delay = delay;
		self
	}
}

#[async_trait]
impl ContainerOps for FakeOps {
	async fn initialize(&self, _payload: Value, _timeout: Duration, _concurrency: u32) -> Result<Interval, InitError> {
		self.initialize_count.fetch_add(1, Ordering::SeqCst);
		let now = Instant::now();
		match self.init_script {
			InitScript::Succeed => Ok(Interval::new(now, now + Duration::from_millis(5))),
			InitScript::FailDeveloper => Err(InitError {
				kind: InitFailureKind::Developer,
				interval: Interval::new(now, now + Duration::from_millis(2)),
				message: "user code threw during init".into(),
			}),
		}
	}

	async fn run(&self, _params: Value, _env: Value, _timeout: Duration, _concurrency: u32) -> Result<(Interval, ActivationResponse), ContainerOpsError> {
		let n = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
		let current = self.current_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_concurrent.fetch_max(current, Ordering::SeqCst);

		if !self.run_delay.is_zero() {
			tokio::time::sleep(self.run_delay).await;
		}

		let start = Instant::now();
		let response = match self.run_script {
			RunScript::AlwaysSuccess => ActivationResponse::Success(json!({ "ok": true })),
			RunScript::OddApplicationError => {
				if n % 2 == 1 {
					ActivationResponse::ApplicationError(json!({ "error": "odd invocation failed" }))
				} else {
					ActivationResponse::Success(json!({ "ok": true }))
				}
			}
		};

		self.current_concurrent.fetch_sub(1, Ordering::SeqCst);
		Ok((Interval::new(start, start + Duration::from_millis(5)), response))
	}

	async fn logs(&self, _limit: u64, _wait_for_sentinel: bool) -> Result<ActivationLogs, LogCollectError> {
		Ok(ActivationLogs::default())
	}

	async fn suspend(&self) -> Result<(), ContainerOpsError> {
		self.suspend_count.fetch_add(1, Ordering::SeqCst);
		if self.suspend_ok.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(ContainerOpsError::Transport("suspend failed".into()))
		}
	}

	async fn resume(&self) -> Result<(), ContainerOpsError> {
		self.resume_count.fetch_add(1, Ordering::SeqCst);
		if self.resume_ok.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(ContainerOpsError::Transport("resume failed".into()))
		}
	}

	async fn destroy(&self) -> Result<(), ContainerOpsError> {
		self.destroy_count.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

pub struct FakeFactory {
	pub ops: Arc<FakeOps>,
	pub should_fail: AtomicBool,
}

impl FakeFactory {
	pub fn new(ops: Arc<FakeOps>) -> Arc<Self> {
		Arc::new(FakeFactory { ops, should_fail: AtomicBool::new(false) })
	}
}

#[async_trait]
impl ContainerFactory for FakeFactory {
	async fn create(&self, _exec: &Exec, _memory_mb: u32) -> Result<Arc<dyn ContainerOps>, ContainerOpsError> {
		if self.should_fail.load(Ordering::SeqCst) {
			Err(ContainerOpsError::Transport("create failed".into()))
		} else {
			Ok(self.ops.clone() as Arc<dyn ContainerOps>)
		}
	}
}

#[derive(Default)]
pub struct FakeAcker {
	pub records: Mutex<Vec<ActivationRecord>>,
}

#[async_trait]
impl Acker for FakeAcker {
	async fn ack(
		&self,
		_transaction_id: &str,
		activation: &ActivationRecord,
		_blocking: bool,
		_controller_id: &str,
		_user_id: &str,
		_acknowledgment: Value,
	) -> anyhow::Result<()> {
		self.records.lock().await.push(activation.clone());
		Ok(())
	}
}

#[derive(Default)]
pub struct FakeStore {
	pub count: AtomicU64,
}

#[async_trait]
impl Store for FakeStore {
	async fn store(&self, _transaction_id: &str, _activation: &ActivationRecord, _user_context: &str) -> anyhow::Result<()> {
		self.count.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

pub struct FakeLogCollector;

#[async_trait]
impl LogCollector for FakeLogCollector {
	async fn collect(
		&self,
		_transaction_id: &str,
		_user_id: &str,
		_activation_id: &str,
		_ops: &dyn ContainerOps,
		_action: &ActionMetadata,
	) -> Result<ActivationLogs, LogCollectError> {
		Ok(ActivationLogs::default())
	}
}

/// A `TimerSource` every `sleep()` call registers into a FIFO queue instead of actually
/// waiting; the test fires entries explicitly to drive `StateTimeout` deterministically.
pub struct FakeTimerSource {
	pending: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl FakeTimerSource {
	pub fn new() -> Arc<Self> {
		Arc::new(FakeTimerSource { pending: Mutex::new(VecDeque::new()) })
	}

	pub async fn pending_count(&self) -> usize {
		self.pending.lock().await.len()
	}

	/// Polls (on real wall time, briefly) until at least `n` timers are registered. The proxy
	/// arms its idle timer from a spawned task, so there's a short window between the causing
	/// transition and the timer actually registering.
	pub async fn wait_for_pending(&self, n: usize) {
		for _ in 0..200 {
			if self.pending_count().await >= n {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("timed out waiting for {n} pending timer(s)");
	}

	pub async fn fire_next(&self) -> bool {
		let tx = self.pending.lock().await.pop_front();
		match tx {
			Some(tx) => {
				let _ = tx.send(());
				true
			}
			None => false,
		}
	}
}

#[async_trait]
impl TimerSource for FakeTimerSource {
	async fn sleep(&self, _duration: Duration) {
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.push_back(tx);
		let _ = rx.await;
	}
}

pub async fn recv_outbound(rx: &mut tokio::sync::mpsc::Receiver<PoolOutbound>) -> PoolOutbound {
	tokio::time::timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("timed out waiting for an outbound message")
		.expect("outbound channel closed unexpectedly")
}
