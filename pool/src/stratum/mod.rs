pub mod connection;
pub mod protocol;
pub mod server;

use crate::config::TierConfig;
use crate::pow::Target;

pub use connection::{Connection, ConnectionState, JobLookup, ShareCounters};
pub use protocol::{ClientMessage, StratumError, StratumRequest, StratumResponse, SubmitParams};
pub use server::{ServerSettings, StratumServer};

/// A listening port bound to one fixed share target
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub name: String,
    pub port: u16,
    /// Value sent in `mining.set_difficulty`
    pub difficulty: f64,
    pub share_target: Target,
}

impl Tier {
    pub fn from_config(cfg: &TierConfig) -> Self {
        let share_target = Target::from_difficulty(cfg.difficulty);
        Self {
            name: cfg.name.clone(),
            port: cfg.port,
            difficulty: cfg.difficulty as f64,
            share_target,
        }
    }

    pub fn with_target(name: &str, port: u16, share_target: Target) -> Self {
        Self {
            name: name.to_string(),
            port,
            difficulty: share_target.difficulty(),
            share_target,
        }
    }
}
