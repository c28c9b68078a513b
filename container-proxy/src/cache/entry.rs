use std::time::Instant;

use futures_util::future::Shared;

use super::LoadFuture;

/// One cache entry's state machine (§3 "Cache entry"). Absence of a key from the backing map
/// is the implicit `Initial` state, modeled here too so a freshly-inserted slot has something
/// to hold before its owner installs `ReadInProgress`/`WriteInProgress`.
pub(super) enum SlotKind<V> {
	Initial,
	/// A read is in flight; coalesced lookups join `fut`.
	ReadInProgress(Shared<LoadFuture<V>>),
	/// A write is in flight.
	WriteInProgress(Shared<LoadFuture<V>>),
	/// An invalidation is running against a `Cached` value.
	InvalidateInProgress,
	/// An invalidation was requested while a read or write was in flight. Whoever finalizes
	/// that read/write must evict instead of promoting to `Cached`, regardless of outcome.
	InvalidateWhenDone,
	Cached { value: V, inserted_at: Instant, last_access: Instant },
}

/// `gen` lets a finalizer confirm the slot it is about to mutate is still the one it started —
/// the compare half of the entry's compare-and-set, since Rust has no atomic CAS over an enum
/// this shaped. The critical sections that inspect/mutate `SlotEntry` are always held only long
/// enough to decide the next state, never across an awaited loader/writer/invalidator.
pub(super) struct SlotEntry<V> {
	pub(super) gen: u64,
	pub(super) kind: SlotKind<V>,
}

impl<V> SlotEntry<V> {
	pub(super) fn initial() -> Self {
		SlotEntry {
			gen: 0,
			kind: SlotKind::Initial,
		}
	}
}
