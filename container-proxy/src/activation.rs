use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A start/end timing window for an `initialize` or `run` call.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
	pub start: Instant,
	pub end: Instant,
}

impl Interval {
	pub fn new(start: Instant, end: Instant) -> Self {
		Interval { start, end }
	}

	pub fn duration(&self) -> Duration {
		self.end.saturating_duration_since(self.start)
	}
}

/// The outcome kind of a `run` call. `ApplicationError`/`DeveloperError` arrive inside `Ok` (the
/// sandbox ran fine; user code failed) and keep the sandbox reusable; a container-fatal failure
/// instead surfaces as `Err(ContainerOpsError)` from [`ContainerOps::run`](crate::container_ops::ContainerOps::run)
/// and always destroys it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum ActivationResponse {
	Success(Value),
	ApplicationError(Value),
	DeveloperError(Value),
	WhiskError(Value),
}

impl ActivationResponse {
	pub fn is_success(&self) -> bool {
		matches!(self, ActivationResponse::Success(_))
	}
}

/// Resource limits carried on an action, echoed into the activation's annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLimits {
	pub memory_mb: u32,
	pub timeout: Duration,
	pub log_limit_bytes: u64,
	/// `0` means the action did not declare one; callers should use
	/// [`effective_concurrency_limit`](ActionLimits::effective_concurrency_limit) rather than
	/// this field directly.
	pub concurrency_limit: u32,
}

impl ActionLimits {
	/// The concurrency limit to actually use: the action's own declaration, or
	/// `config.default_concurrency_limit` when the action left it at `0` (§2's `ProxyConfig`
	/// knob for "Default `concurrencyLimit` used when an action does not declare one").
	pub fn effective_concurrency_limit(&self, config: &crate::config::ProxyConfig) -> u32 {
		if self.concurrency_limit == 0 {
			config.default_concurrency_limit.max(1)
		} else {
			self.concurrency_limit
		}
	}
}

/// Identifies the action a `Run` targets, plus the metadata the proxy needs to attach
/// annotations and decide concurrency/log behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMetadata {
	pub namespace: String,
	pub name: String,
	pub path: String,
	pub kind: String,
	pub limits: ActionLimits,
	/// Gates whether API-key fields are included in the environment boundary (§6).
	pub provide_api_key: bool,
}

/// Annotations attached to every activation per §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotations {
	pub init_time: Option<Duration>,
	pub wait_time: Duration,
	pub duration: Duration,
	pub limits: ActionLimits,
	pub path: String,
	pub kind: String,
}

impl Annotations {
	/// Builds annotations for a cold run (init interval present).
	pub fn cold(
		init_interval: Interval,
		run_interval: Interval,
		message_arrival: Instant,
		action: &ActionMetadata,
	) -> Self {
		Annotations {
			init_time: Some(init_interval.duration()),
			wait_time: init_interval
				.start
				.saturating_duration_since(message_arrival),
			duration: init_interval.duration() + run_interval.duration(),
			limits: action.limits.clone(),
			path: action.path.clone(),
			kind: action.kind.clone(),
		}
	}

	/// Builds annotations for a warm run (no init interval).
	pub fn warm(run_interval: Interval, message_arrival: Instant, action: &ActionMetadata) -> Self {
		Annotations {
			init_time: None,
			wait_time: run_interval.start.saturating_duration_since(message_arrival),
			duration: run_interval.duration(),
			limits: action.limits.clone(),
			path: action.path.clone(),
			kind: action.kind.clone(),
		}
	}
}

/// Fully assembled record of one invocation, as handed to the [`Acker`](crate::container_ops::Acker)
/// and [`Store`](crate::container_ops::Store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
	pub transaction_id: String,
	pub activation_id: String,
	pub namespace: String,
	pub action_name: String,
	pub response: ActivationResponse,
	pub annotations: Annotations,
}

/// Collected log output for an activation. `partial` is set when collection was cut short by
/// a [`LogCollectError::Partial`](crate::error::LogCollectError::Partial).
#[derive(Debug, Clone, Default)]
pub struct ActivationLogs {
	pub lines: Vec<String>,
	pub partial: bool,
}

/// Splits declared arguments into environment variables and main-parameter fields per the
/// partitioning rule of §6: a key whose first character is upper-case becomes an environment
/// variable, every other key is a main-parameter field. Stable and testable independent of any
/// sandbox.
pub fn partition(args: &BTreeMap<String, Value>) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
	let mut env = BTreeMap::new();
	let mut params = BTreeMap::new();

	for (key, value) in args {
		let is_env = key.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
		if is_env {
			env.insert(key.clone(), value.clone());
		} else {
			params.insert(key.clone(), value.clone());
		}
	}

	(env, params)
}

/// Builds the `(params, env)` pair passed to [`ContainerOps::run`](crate::container_ops::ContainerOps::run)
/// for one invocation: `message.params` is partitioned per the rule above, then the system
/// fields of §6's environment boundary (`namespace`, `action_name`, `activation_id`,
/// `transaction_id`, `deadline`) are layered into the env half, followed by the API key if the
/// action opts in. System fields always win over a same-named declared argument.
pub fn environment_boundary(
	namespace: &str,
	action: &ActionMetadata,
	message: &crate::proxy::messages::RunMessage,
) -> (Value, Value) {
	let declared: BTreeMap<String, Value> = message
		.params
		.as_object()
		.map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
		.unwrap_or_default();
	let (mut env, params) = partition(&declared);

	if let Some(obj) = message.env.as_object() {
		for (k, v) in obj {
			env.entry(k.clone()).or_insert_with(|| v.clone());
		}
	}

	env.insert("namespace".to_string(), Value::String(namespace.to_string()));
	env.insert("action_name".to_string(), Value::String(action.name.clone()));
	env.insert("activation_id".to_string(), Value::String(message.activation_id.clone()));
	env.insert("transaction_id".to_string(), Value::String(message.transaction_id.clone()));
	env.insert("deadline".to_string(), Value::String(message.deadline_epoch_millis.to_string()));

	if action.provide_api_key {
		if let Some(api_key) = &message.api_key {
			env.insert("api_key".to_string(), api_key.clone());
		}
	}

	let env_value = Value::Object(env.into_iter().collect());
	let params_value = Value::Object(params.into_iter().collect());
	(params_value, env_value)
}
