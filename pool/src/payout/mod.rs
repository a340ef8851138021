pub mod maturity;
pub mod sink;

pub use maturity::{BlockTracker, MaturitySettings, TrackedBlock};
pub use sink::{MemoryPayoutSink, PayoutSink, RedisPayoutSink};
