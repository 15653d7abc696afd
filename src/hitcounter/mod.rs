//! Hit tracking and sliding-window rate decisions.

mod audit;
mod clock;
mod direction;
mod engine;
mod rolling;
mod store;
mod value;

pub use audit::{AuditEntry, AuditLog, FileAuditLog, FlagReason, MemoryAuditLog, TracingAuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use direction::{Direction, DirectionSettings, DirectionStats, DEFAULT_CLEAN_UP_INTERVAL};
pub use engine::{EngineStats, HitCounter};
pub use rolling::RollingCount;
pub use store::{ShardedStore, Verdict, DEFAULT_SHARDS};
pub use value::{TrackedValue, ValueKind};
