//! The `initialize -> run -> logs -> ack -> store` chain (§4.2) and the failure classification
//! that decides whether the sandbox the chain ran against is still reusable.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::activation::{ActionMetadata, ActivationRecord, ActivationResponse, Annotations, Interval};
use crate::container_ops::{Acker, ContainerOps, LogCollector, Store};
use crate::error::InitFailureKind;

use super::messages::RunMessage;
use super::ProxyDeps;

/// What the actor loop needs back once a spawned pipeline task completes.
pub(super) struct PipelineOutcome {
	pub action: Arc<ActionMetadata>,
	pub message: RunMessage,
	pub namespace: String,
	/// `None` once the sandbox is no longer usable (destroy already underway/needed).
	pub ops: Option<Arc<dyn ContainerOps>>,
	pub container_fatal: bool,
}

/// Runs one invocation end to end. `ops` must already be a live sandbox; `needs_init` says
/// whether it must be initialized for `action` first (cold) or is already warmed for it (warm).
pub(super) async fn run_pipeline(
	deps: Arc<ProxyDeps>,
	ops: Arc<dyn ContainerOps>,
	namespace: String,
	action: Arc<ActionMetadata>,
	message: RunMessage,
	needs_init: bool,
) -> PipelineOutcome {
	let message_arrival = message.arrived_at;
	let concurrency = action.limits.effective_concurrency_limit(&deps.config);

	let init_interval = if needs_init {
		let init_payload = json!({
			"namespace": namespace,
			"action": action.name,
			"path": action.path,
		});
		match ops
			.initialize(init_payload, action.limits.timeout, concurrency)
			.await
		{
			Ok(interval) => Some(interval),
			Err(err) => {
				let (kind_log, response) = match err.kind {
					InitFailureKind::Developer => (
						"developer",
						ActivationResponse::DeveloperError(json!({ "error": err.message })),
					),
					InitFailureKind::System => {
						tracing::error!(error = %err.message, "initialize failed with a system error");
						("system", ActivationResponse::WhiskError(json!({ "error": "internal error" })))
					}
				};
				tracing::warn!(kind = kind_log, namespace = %namespace, action = %action.name, "initialize failed, destroying sandbox");

				let annotations = Annotations {
					init_time: Some(err.interval.duration()),
					wait_time: err.interval.start.saturating_duration_since(message_arrival),
					duration: err.interval.duration(),
					limits: action.limits.clone(),
					path: action.path.clone(),
					kind: action.kind.clone(),
				};
				let record = activation_record(&namespace, &action, &message, response, annotations);
				ack_and_store(&deps, &message, &record).await;

				return PipelineOutcome {
					action,
					message,
					namespace,
					ops: None,
					container_fatal: true,
				};
			}
		}
	} else {
		None
	};

	let (run_params, run_env) = crate::activation::environment_boundary(&namespace, &action, &message);
	let run_result = ops
		.run(run_params, run_env, action.limits.timeout, concurrency)
		.await;

	let (run_interval, response) = match run_result {
		Ok(pair) => pair,
		Err(err) => {
			tracing::warn!(error = %err, namespace = %namespace, action = %action.name, "run failed, destroying sandbox");
			let now = deps.clock.now();
			let run_interval = Interval::new(now, now);
			let annotations = annotations_for(init_interval, run_interval, message_arrival, &action);
			let response = ActivationResponse::WhiskError(json!({ "error": err.to_string() }));
			let record = activation_record(&namespace, &action, &message, response, annotations);
			ack_and_store(&deps, &message, &record).await;

			return PipelineOutcome {
				action,
				message,
				namespace,
				ops: None,
				container_fatal: true,
			};
		}
	};

	let logs_result = deps
		.log_collector
		.collect(&message.transaction_id, &message.user_id, &message.activation_id, ops.as_ref(), &action)
		.await;

	let (container_fatal, partial_note) = match logs_result {
		Ok(_logs) => (false, None),
		Err(err) => {
			tracing::warn!(error = %err, namespace = %namespace, action = %action.name, "log collection failed, destroying sandbox");
			(true, Some(err.to_string()))
		}
	};

	let mut response = response;
	if let Some(note) = partial_note {
		if let ActivationResponse::Success(ref mut body) = response {
			if let Some(obj) = body.as_object_mut() {
				obj.insert("logCollectionError".to_string(), json!(note));
			}
		}
	}

	let annotations = annotations_for(init_interval, run_interval, message_arrival, &action);
	let record = activation_record(&namespace, &action, &message, response, annotations);
	ack_and_store(&deps, &message, &record).await;

	PipelineOutcome {
		action,
		message,
		namespace,
		ops: if container_fatal { None } else { Some(ops) },
		container_fatal,
	}
}

fn annotations_for(
	init_interval: Option<Interval>,
	run_interval: Interval,
	message_arrival: Instant,
	action: &ActionMetadata,
) -> Annotations {
	match init_interval {
		Some(init) => Annotations::cold(init, run_interval, message_arrival, action),
		None => Annotations::warm(run_interval, message_arrival, action),
	}
}

fn activation_record(
	namespace: &str,
	action: &ActionMetadata,
	message: &RunMessage,
	response: ActivationResponse,
	annotations: Annotations,
) -> ActivationRecord {
	ActivationRecord {
		transaction_id: message.transaction_id.clone(),
		activation_id: message.activation_id.clone(),
		namespace: namespace.to_string(),
		action_name: action.name.clone(),
		response,
		annotations,
	}
}

/// Publishes the activation result and, unless the action declared a zero log limit, persists
/// the record. Both calls are bounded so a wedged controller/store never blocks shutdown (§9).
pub(super) async fn ack_and_store(deps: &ProxyDeps, message: &RunMessage, record: &ActivationRecord) {
	let ack = tokio::time::timeout(
		deps.config.ack_timeout,
		deps.acker.ack(
			&message.transaction_id,
			record,
			message.blocking,
			&message.controller_id,
			&message.user_id,
			json!({ "activationId": record.activation_id }),
		),
	)
	.await;
	match ack {
		Ok(Ok(())) => {}
		Ok(Err(err)) => tracing::warn!(error = %err, activation = %record.activation_id, "ack failed"),
		Err(_) => tracing::warn!(activation = %record.activation_id, "ack timed out"),
	}

	if action_log_limit_is_zero(record) {
		return;
	}

	let store = tokio::time::timeout(
		deps.config.store_timeout,
		deps.store.store(&message.transaction_id, record, &message.user_context),
	)
	.await;
	match store {
		Ok(Ok(())) => {}
		Ok(Err(err)) => tracing::warn!(error = %err, activation = %record.activation_id, "store failed"),
		Err(_) => tracing::warn!(activation = %record.activation_id, "store timed out"),
	}
}

fn action_log_limit_is_zero(record: &ActivationRecord) -> bool {
	record.annotations.limits.log_limit_bytes == 0
}

/// Builds the synthetic activation emitted when a sandbox could never be created (§4.2's
/// "Creation failure" case): no `initTime`, a `whiskError` response, annotations otherwise empty.
pub(super) fn creation_failure_record(
	namespace: &str,
	action: &ActionMetadata,
	message: &RunMessage,
	now: Instant,
) -> ActivationRecord {
	let annotations = Annotations {
		init_time: None,
		wait_time: now.saturating_duration_since(message.arrived_at),
		duration: std::time::Duration::ZERO,
		limits: action.limits.clone(),
		path: action.path.clone(),
		kind: action.kind.clone(),
	};
	activation_record(
		namespace,
		action,
		message,
		ActivationResponse::WhiskError(json!({ "error": "failed to create sandbox" })),
		annotations,
	)
}
