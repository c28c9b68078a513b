//! The `MRSWCache` properties and scenario 6 of §8.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rivet_container_proxy::cache::spawn_sweeper;
use rivet_container_proxy::{CacheConfig, LookupOutcome, MrswCache};

#[tokio::test]
async fn update_then_lookup_round_trips() {
	let cache = MrswCache::<String, i32>::new(CacheConfig::default());

	let written = cache.update("k".to_string(), || async { Ok::<_, anyhow::Error>(7) }).await.unwrap();
	assert_eq!(written, 7);

	let (value, outcome) = cache
		.lookup("k".to_string(), || async { panic!("loader must not run on a cache hit") })
		.await
		.unwrap();
	assert_eq!(value, 7);
	assert_eq!(outcome, LookupOutcome::Hit);
}

#[tokio::test]
async fn invalidate_then_lookup_does_not_return_stale_value() {
	let cache = MrswCache::<String, i32>::new(CacheConfig::default());
	cache.update("k".to_string(), || async { Ok::<_, anyhow::Error>(1) }).await.unwrap();
	cache.invalidate("k".to_string(), || async { Ok(()) }).await.unwrap();

	let load_calls = Arc::new(AtomicU64::new(0));
	let calls = load_calls.clone();
	let (value, outcome) = cache
		.lookup("k".to_string(), move || {
			let calls = calls.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok::<_, anyhow::Error>(2)
			}
		})
		.await
		.unwrap();

	assert_eq!(value, 2);
	assert_eq!(outcome, LookupOutcome::Miss);
	assert_eq!(load_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_lookups_coalesce_onto_one_load() {
	let cache = Arc::new(MrswCache::<String, i32>::new(CacheConfig::default()));
	let load_calls = Arc::new(AtomicU64::new(0));
	let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

	let cache1 = cache.clone();
	let calls1 = load_calls.clone();
	let first = tokio::spawn(async move {
		cache1
			.lookup("k".to_string(), move || {
				let calls = calls1.clone();
				async move {
					calls.fetch_add(1, Ordering::SeqCst);
					gate_rx.await.ok();
					Ok::<_, anyhow::Error>(5)
				}
			})
			.await
	});

	// Give the first lookup time to install ReadInProgress before the second rides in.
	tokio::time::sleep(Duration::from_millis(20)).await;

	let cache2 = cache.clone();
	let second = tokio::spawn(async move {
		cache2
			.lookup("k".to_string(), || async { panic!("coalesced caller must not run its own loader") })
			.await
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	gate_tx.send(()).unwrap();

	let (v1, o1) = first.await.unwrap().unwrap();
	let (v2, o2) = second.await.unwrap().unwrap();

	assert_eq!(v1, 5);
	assert_eq!(v2, 5);
	assert_eq!(o1, LookupOutcome::Miss);
	assert_eq!(o2, LookupOutcome::CoalescedHit);
	assert_eq!(load_calls.load(Ordering::SeqCst), 1);
}

/// Scenario 6: an invalidation racing a slow in-flight read marks `InvalidateWhenDone`; the
/// original caller still sees the loaded value, but the entry is evicted rather than promoted,
/// so the next lookup re-reads (per §9's resolved ambiguity).
#[tokio::test]
async fn invalidate_during_inflight_read_evicts_without_promoting() {
	let cache = Arc::new(MrswCache::<String, i32>::new(CacheConfig::default()));
	let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
	let load_calls = Arc::new(AtomicU64::new(0));

	let cache2 = cache.clone();
	let calls2 = load_calls.clone();
	let lookup_task = tokio::spawn(async move {
		cache2
			.lookup("k".to_string(), move || {
				let calls = calls2.clone();
				async move {
					calls.fetch_add(1, Ordering::SeqCst);
					gate_rx.await.ok();
					Ok::<_, anyhow::Error>(42)
				}
			})
			.await
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	cache.invalidate("k".to_string(), || async { Ok(()) }).await.unwrap();
	gate_tx.send(()).unwrap();

	let (value, outcome) = lookup_task.await.unwrap().unwrap();
	assert_eq!(value, 42, "the caller that started the read still sees the loaded value");
	assert_eq!(outcome, LookupOutcome::Miss);

	let calls = load_calls.clone();
	let (value2, outcome2) = cache
		.lookup("k".to_string(), move || {
			let calls = calls.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok::<_, anyhow::Error>(99)
			}
		})
		.await
		.unwrap();

	assert_eq!(value2, 99, "a later lookup re-reads rather than seeing the invalidated value");
	assert_eq!(outcome2, LookupOutcome::Miss);
	assert_eq!(load_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ttl_sweep_never_evicts_a_write_in_progress_entry() {
	let config = CacheConfig { max_capacity: 10, time_to_live: Duration::from_millis(1) };
	let cache = Arc::new(MrswCache::<String, i32>::new(config));
	let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

	let cache2 = cache.clone();
	let writer = tokio::spawn(async move {
		cache2
			.update("k".to_string(), move || async move {
				gate_rx.await.ok();
				Ok::<_, anyhow::Error>(11)
			})
			.await
	});

	// The sweep interval is far shorter than the write; several ticks land while the entry is
	// still WriteInProgress, which the sweep must never evict on TTL grounds.
	let sweeper = spawn_sweeper(cache.clone(), Duration::from_millis(5));
	tokio::time::sleep(Duration::from_millis(40)).await;
	sweeper.abort();

	gate_tx.send(()).unwrap();
	let value = writer.await.unwrap().unwrap();
	assert_eq!(value, 11);

	let (value, outcome) = cache
		.lookup("k".to_string(), || async { panic!("the write should have promoted this to Cached") })
		.await
		.unwrap();
	assert_eq!(value, 11);
	assert_eq!(outcome, LookupOutcome::Hit);
}
