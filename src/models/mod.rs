pub mod cache_entry;
pub mod progress;
pub mod records;
pub mod work_unit;

pub use cache_entry::{CacheEntry, CacheTier};
pub use progress::{BatchResult, ProgressSnapshot};
pub use records::{DedupRecord, RateLimitState};
pub use work_unit::{SkipReason, UnitStatus, WorkUnit};
