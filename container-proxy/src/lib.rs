//! Per-sandbox lifecycle state machine (the "container proxy") and the read-coalescing
//! metadata cache backing it. The sandbox/container runtime, activation transport, and
//! controller-facing wire formats are out of scope; this crate owns only the state machine and
//! the cache (§1, §2).

pub mod activation;
pub mod cache;
pub mod clock;
pub mod config;
pub mod container_ops;
pub mod error;
pub mod proxy;
pub mod shared_counter;
pub mod shutdown;

pub use activation::{ActionLimits, ActionMetadata, ActivationLogs, ActivationRecord, ActivationResponse, Annotations, Interval};
pub use cache::{LookupError, LookupOutcome, MrswCache};
pub use clock::{system_clock, system_timer_source, Clock, SharedClock, SharedTimerSource, TimerSource};
pub use config::{CacheConfig, ProxyConfig};
pub use container_ops::{Acker, ContainerFactory, ContainerOps, Exec, LogCollector, Store};
pub use error::{CacheError, ContainerOpsError, InitError, InitFailureKind, LogCollectError};
pub use proxy::{spawn_proxy, ProxyDeps};
pub use proxy::messages::{PoolInbound, PoolOutbound, ProxyDataSnapshot, ProxyHandle, ProxyPhase, RunMessage};
pub use shared_counter::{LocalSharedCounter, SharedCounter};
pub use shutdown::{ShutdownGroup, ShutdownGuard, ShutdownOutcome};
