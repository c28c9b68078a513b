//! The multi-reader/single-writer metadata cache (§4.3). Guards backing-store reads/writes
//! behind a per-key state machine so concurrent lookups for the same key coalesce onto one
//! backing read, writes hold exclusive access, and invalidations always win a race against an
//! in-flight read or write.

mod entry;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::CacheError;
use entry::{SlotEntry, SlotKind};

pub(crate) type LoadFuture<V> = BoxFuture<'static, Result<V, Arc<anyhow::Error>>>;

/// A boxed, 'static, one-shot async loader/writer/invalidator. Built from any `Future` via
/// [`IntoLoadFuture`].
pub type LoadFn<V> = Pin<Box<dyn FnOnce() -> LoadFuture<V> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
	#[error(transparent)]
	Loader(#[from] Arc<anyhow::Error>),
	#[error(transparent)]
	Cache(#[from] CacheError),
}

/// Outcome of a single lookup, distinguishing a hit from the two miss shapes telemetry must
/// record separately (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
	Hit,
	CoalescedHit,
	Miss,
}

struct Slot<V> {
	inner: Mutex<SlotEntry<V>>,
}

impl<V> Slot<V> {
	fn new() -> Arc<Self> {
		Arc::new(Slot {
			inner: Mutex::new(SlotEntry::initial()),
		})
	}
}

/// The cache itself. `K` must be cheap to clone (it is hashed for telemetry and used as the
/// backing map key); `V` must be `Clone` so coalesced readers and cache hits can each get an
/// owned copy without holding the entry lock.
pub struct MrswCache<K, V>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	map: scc::HashMap<K, Arc<Slot<V>>>,
	config: CacheConfig,
}

impl<K, V> MrswCache<K, V>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	pub fn new(config: CacheConfig) -> Self {
		MrswCache {
			map: scc::HashMap::new(),
			config,
		}
	}

	fn key_hash(key: &K) -> u64 {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		hasher.finish()
	}

	async fn slot_for(&self, key: &K) -> Arc<Slot<V>> {
		if let Some(entry) = self.map.get_async(key).await {
			return entry.get().clone();
		}

		let slot = Slot::new();
		match self.map.entry_async(key.clone()).await {
			scc::hash_map::Entry::Occupied(o) => o.get().clone(),
			scc::hash_map::Entry::Vacant(v) => {
				v.insert_entry(slot.clone());
				slot
			}
		}
	}

	/// `lookup(key, loader)` per §4.3: cache hit returns immediately, a coalesced hit joins the
	/// single in-flight backing read for this key, and a read-around bypasses the cache
	/// entirely when a write or invalidation already owns the slot.
	#[tracing::instrument(skip_all)]
	pub async fn lookup<F, Fut>(&self, key: K, loader: F) -> Result<(V, LookupOutcome), LookupError>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: std::future::Future<Output = Result<V, anyhow::Error>> + Send + 'static,
	{
		let key_hash = Self::key_hash(&key);
		let slot = self.slot_for(&key).await;

		enum Decision<V, F> {
			Hit(V),
			Join { fut: Shared<LoadFuture<V>>, gen: u64, started: bool },
			Bypass(F),
		}

		let decision = {
			let mut guard = slot.inner.lock().await;
			match &guard.kind {
				SlotKind::Cached { value, .. } => Decision::Hit(value.clone()),
				SlotKind::ReadInProgress(fut) => Decision::Join {
					fut: fut.clone(),
					gen: guard.gen,
					started: false,
				},
				SlotKind::WriteInProgress(_)
				| SlotKind::InvalidateInProgress
				| SlotKind::InvalidateWhenDone => Decision::Bypass(loader),
				SlotKind::Initial => {
					let fut: LoadFuture<V> = Box::pin(async move { loader().await.map_err(Arc::new) });
					let shared = fut.shared();
					guard.gen = guard.gen.wrapping_add(1);
					guard.kind = SlotKind::ReadInProgress(shared.clone());
					Decision::Join {
						fut: shared,
						gen: guard.gen,
						started: true,
					}
				}
			}
		};

		match decision {
			Decision::Hit(value) => {
				tracing::debug!(key_hash = format_args!("{key_hash:x}"), "cache hit");
				touch_last_access(&slot).await;
				Ok((value, LookupOutcome::Hit))
			}
			Decision::Bypass(loader) => {
				tracing::debug!(key_hash = format_args!("{key_hash:x}"), "cache read-around (miss)");
				loader()
					.await
					.map(|value| (value, LookupOutcome::Miss))
					.map_err(|err| LookupError::Loader(Arc::new(err)))
			}
			Decision::Join { fut, gen, started } => {
				let outcome = if started {
					tracing::debug!(key_hash = format_args!("{key_hash:x}"), "cache miss");
					LookupOutcome::Miss
				} else {
					tracing::debug!(key_hash = format_args!("{key_hash:x}"), "cache coalesced hit");
					LookupOutcome::CoalescedHit
				};

				let result = fut.await;
				self.finalize_read(&slot, gen, key_hash, result.clone()).await?;

				match result {
					Ok(value) => Ok((value, outcome)),
					Err(err) => Err(LookupError::Loader(err)),
				}
			}
		}
	}

	async fn finalize_read(
		&self,
		slot: &Arc<Slot<V>>,
		gen: u64,
		key_hash: u64,
		result: Result<V, Arc<anyhow::Error>>,
	) -> Result<(), CacheError> {
		let mut guard = slot.inner.lock().await;
		if guard.gen != gen {
			// Someone else already finalized this generation (e.g. a concurrent writer raced
			// ahead and replaced the slot). Nothing left for us to do.
			return Ok(());
		}

		match &guard.kind {
			SlotKind::ReadInProgress(_) => match result {
				Ok(value) => {
					let now = Instant::now();
					guard.kind = SlotKind::Cached {
						value,
						inserted_at: now,
						last_access: now,
					};
					Ok(())
				}
				Err(_) => {
					guard.kind = SlotKind::Initial;
					Ok(())
				}
			},
			SlotKind::InvalidateWhenDone => {
				guard.kind = SlotKind::Initial;
				Ok(())
			}
			// Every coalesced reader joins the same `gen` and calls finalize_read once the
			// shared future resolves; whichever wins the lock first does the transition above,
			// the rest see it already done (Cached or, on loader failure, Initial) and no-op.
			SlotKind::Cached { .. } | SlotKind::Initial => Ok(()),
			// A write or invalidation is in progress under this same unbumped `gen` — every
			// transition bumps `gen`, so this can't happen without a CAS bug elsewhere.
			SlotKind::WriteInProgress(_) | SlotKind::InvalidateInProgress => {
				tracing::error!(key_hash = %format_args!("{key_hash:x}"), "cache concurrent-op invariant violated");
				Err(CacheError::ConcurrentOp { key_hash })
			}
		}
	}

	/// `update(key, value, writer)` per §4.3: install a write lock, run `writer`, and promote
	/// to `Cached` on success unless an invalidation raced in underneath, in which case evict.
	#[tracing::instrument(skip_all)]
	pub async fn update<F, Fut>(&self, key: K, writer: F) -> Result<V, LookupError>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: std::future::Future<Output = Result<V, anyhow::Error>> + Send + 'static,
	{
		let key_hash = Self::key_hash(&key);
		let slot = self.slot_for(&key).await;

		let (shared, gen) = {
			let mut guard = slot.inner.lock().await;
			let fut: LoadFuture<V> = Box::pin(async move { writer().await.map_err(Arc::new) });
			let shared = fut.shared();
			guard.gen = guard.gen.wrapping_add(1);
			guard.kind = SlotKind::WriteInProgress(shared.clone());
			(shared, guard.gen)
		};

		tracing::debug!(key_hash = format_args!("{key_hash:x}"), "cache write started");

		let result = shared.await;

		{
			let mut guard = slot.inner.lock().await;
			if guard.gen == gen {
				match &result {
					Ok(value) => {
						if matches!(guard.kind, SlotKind::InvalidateWhenDone) {
							guard.kind = SlotKind::Initial;
						} else {
							let now = Instant::now();
							guard.kind = SlotKind::Cached {
								value: value.clone(),
								inserted_at: now,
								last_access: now,
							};
						}
					}
					Err(_) => {
						guard.kind = SlotKind::Initial;
					}
				}
			}
		}

		result.map_err(LookupError::Loader)
	}

	/// `invalidate(key, invalidator)` per §4.3.
	#[tracing::instrument(skip_all)]
	pub async fn invalidate<F, Fut>(&self, key: K, invalidator: F) -> Result<(), anyhow::Error>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
	{
		let key_hash = Self::key_hash(&key);
		let slot = self.slot_for(&key).await;

		enum Action {
			Done,
			RunThenEvict,
			Piggyback,
		}

		// Outcome of "RunThenEvict" is executed outside the lock below.
		let action = {
			let mut guard = slot.inner.lock().await;
			match &guard.kind {
				SlotKind::Initial => Action::Done,
				SlotKind::Cached { .. } => {
					guard.gen = guard.gen.wrapping_add(1);
					guard.kind = SlotKind::InvalidateInProgress;
					Action::RunThenEvict
				}
				SlotKind::ReadInProgress(_) | SlotKind::WriteInProgress(_) => {
					guard.kind = SlotKind::InvalidateWhenDone;
					// No invalidator runs here — there is no cached value yet to invalidate
					// from the backing store. The owning read/write evicts on completion.
					Action::Piggyback
				}
				SlotKind::InvalidateInProgress | SlotKind::InvalidateWhenDone => Action::Piggyback,
			}
		};

		match action {
			Action::Done | Action::Piggyback => {
				tracing::debug!(key_hash = format_args!("{key_hash:x}"), "invalidate piggybacked");
				Ok(())
			}
			Action::RunThenEvict => {
				tracing::debug!(key_hash = format_args!("{key_hash:x}"), "invalidate running");
				let outcome = invalidator().await;
				self.map.remove_async(&key).await;
				outcome
			}
		}
	}

	pub async fn len(&self) -> usize {
		self.map.len()
	}
}

async fn touch_last_access<V>(slot: &Arc<Slot<V>>) {
	let mut guard = slot.inner.lock().await;
	if let SlotKind::Cached { last_access, .. } = &mut guard.kind {
		*last_access = Instant::now();
	}
}

/// Periodic sweep removing TTL-expired `Cached` entries and, if the map is still over
/// capacity, the least-recently-accessed `Cached` entries beyond it. Never removes an entry in
/// any non-`Cached` state (§4.3: "entries in non-Cached state must not be TTL-evicted").
pub(crate) async fn sweep_expired<K, V>(cache: &MrswCache<K, V>)
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	let ttl = cache.config.time_to_live;
	let max_capacity = cache.config.max_capacity as usize;
	let now = Instant::now();

	let mut stale_keys = Vec::new();
	let mut live: Vec<(K, Instant)> = Vec::new();

	cache.map.scan_async(|k, slot| {
		if let Ok(guard) = slot.inner.try_lock() {
			if let SlotKind::Cached { inserted_at, last_access, .. } = &guard.kind {
				if now.saturating_duration_since(*inserted_at) >= ttl {
					stale_keys.push(k.clone());
				} else {
					live.push((k.clone(), *last_access));
				}
			}
		}
	}).await;

	for key in stale_keys {
		evict_if_still_cached(cache, &key).await;
	}

	if live.len() > max_capacity {
		live.sort_by_key(|(_, last_access)| *last_access);
		let overflow = live.len() - max_capacity;
		for (key, _) in live.into_iter().take(overflow) {
			evict_if_still_cached(cache, &key).await;
		}
	}
}

async fn evict_if_still_cached<K, V>(cache: &MrswCache<K, V>, key: &K)
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	if let Some(entry) = cache.map.get_async(key).await {
		let mut guard = entry.get().inner.lock().await;
		if matches!(guard.kind, SlotKind::Cached { .. }) {
			guard.kind = SlotKind::Initial;
			drop(guard);
			drop(entry);
			cache.map.remove_async(key).await;
		}
	}
}

/// Spawns the background TTL/capacity sweep on the current tokio runtime. The returned handle
/// aborts the sweep when dropped.
pub fn spawn_sweeper<K, V>(cache: Arc<MrswCache<K, V>>, interval: Duration) -> tokio::task::JoinHandle<()>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		loop {
			ticker.tick().await;
			sweep_expired(&cache).await;
		}
	})
}
