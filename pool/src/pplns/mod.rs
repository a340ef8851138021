/// PPLNS accounting
///
/// Windows are delimited by found blocks: every accepted share belongs to the
/// window that is open when it is stamped, and a block closes that window.
/// The window is paid once its block is confirmed.

pub mod accounting;
pub mod calculator;
pub mod ledger;
pub mod store;
pub mod window;

pub use accounting::{
    Accounting, LedgerConsumer, LedgerStats, MinerPayout, MinerView, PayoutEstimate, SharedAccounting,
};
pub use calculator::{PayoutCalculator, PayoutRecord};
pub use ledger::{
    ApplyOutcome, ApplyStatus, ClosedWindow, LedgerSnapshot, PayoutWindow, ShareLedger, WindowState,
};
pub use store::{LedgerCheckpoint, LedgerStore, MemoryLedgerStore, RedisLedgerStore, RestoredLedger};
pub use window::WindowClock;
