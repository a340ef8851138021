pub mod api;
pub mod blockchain;
pub mod bus;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics {
    pub mod prometheus;
}
pub mod payout;
pub mod pow;
pub mod pplns;
pub mod shares;
pub mod stratum;
