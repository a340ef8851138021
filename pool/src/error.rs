use rust_decimal::Decimal;
use thiserror::Error;

use crate::stratum::connection::ConnectionState;

/// Top-level pool error taxonomy
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Node peer unavailable: {0}")]
    NodePeerUnavailable(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Payout computation error: {0}")]
    Payout(#[from] PayoutError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol violations. The connection is closed after replying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: &'static str, reason: String },

    #[error("{method} not allowed in state {state:?}")]
    OutOfOrder {
        method: &'static str,
        state: ConnectionState,
    },

    #[error("invalid worker name: {0}")]
    InvalidWorkerName(String),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

impl ProtocolError {
    pub fn invalid_params(method: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            method,
            reason: reason.into(),
        }
    }
}

/// Share rejection reasons; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareRejection {
    #[error("Stale share")]
    Stale,

    #[error("Duplicate share")]
    Duplicate,

    #[error("Share difficulty too low")]
    LowDifficulty,

    #[error("Invalid share: {0}")]
    Invalid(String),
}

impl ShareRejection {
    /// Stratum reason code sent back in the submit error triple
    pub fn code(&self) -> i32 {
        use crate::stratum::protocol::StratumError;
        match self {
            Self::Stale => StratumError::JOB_NOT_FOUND,
            Self::Duplicate => StratumError::DUPLICATE_SHARE,
            Self::LowDifficulty => StratumError::LOW_DIFFICULTY,
            Self::Invalid(_) => StratumError::OTHER,
        }
    }
}

/// Message bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Bus closed")]
    Closed,
}

/// Payout calculation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("pool fee {0} outside [0, 1)")]
    InvalidFee(Decimal),

    #[error("window has zero total score")]
    ZeroTotalScore,

    #[error("arithmetic overflow while distributing {0}")]
    Overflow(u64),

    #[error("distribution unbalanced: paid {paid} + fee {fee} + carried {carried} != {expected}")]
    Unbalanced {
        paid: u64,
        fee: u64,
        carried: u64,
        expected: u64,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;
