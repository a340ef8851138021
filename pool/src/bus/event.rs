use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shares::ShareStatus;

/// One message on the pool bus. Serialized as JSON tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Share(ShareEvent),
    Job(JobEvent),
    BlockFound(BlockFoundEvent),
    BlockStatus(BlockStatusEvent),
}

impl PoolEvent {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Share(e) => e.id,
            Self::Job(e) => e.id,
            Self::BlockFound(e) => e.id,
            Self::BlockStatus(e) => e.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Share(_) => "share",
            Self::Job(_) => "job",
            Self::BlockFound(_) => "block_found",
            Self::BlockStatus(_) => "block_status",
        }
    }
}

/// Every classified share, accepted or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareEvent {
    pub id: Uuid,
    pub window_id: u64,
    pub miner: String,
    pub worker: String,
    pub tier: String,
    pub job_id: String,
    pub height: u64,
    pub status: ShareStatus,
    /// Zero unless accepted
    pub score: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: String,
    pub height: u64,
    pub prev_hash: String,
    pub clean_jobs: bool,
    pub timestamp: DateTime<Utc>,
}

/// Closes `window_id`; the reward is split over that window's scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFoundEvent {
    pub id: Uuid,
    pub window_id: u64,
    pub height: u64,
    pub hash: String,
    pub miner: String,
    pub worker: String,
    pub reward: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Buried under the required confirmations on the best chain
    Confirmed,
    /// Refused by the node at submission
    Rejected,
    /// Accepted, then replaced at its height
    Orphaned,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Orphaned => "orphaned",
        }
    }
}

/// Fate of the block that closed `window_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStatusEvent {
    pub id: Uuid,
    pub window_id: u64,
    pub height: u64,
    pub hash: String,
    pub state: BlockState,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_share_event_json_is_tagged() {
        let event = PoolEvent::Share(ShareEvent {
            id: Uuid::new_v4(),
            window_id: 3,
            miner: "alice".into(),
            worker: "alice.rig1".into(),
            tier: "low".into(),
            job_id: "1f".into(),
            height: 800_000,
            status: ShareStatus::LowDifficulty,
            score: dec!(0),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "share");
        assert_eq!(json["status"], "low_difficulty");

        let back: PoolEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_block_status_json() {
        let event = PoolEvent::BlockStatus(BlockStatusEvent {
            id: Uuid::new_v4(),
            window_id: 7,
            height: 812,
            hash: "ab".repeat(32),
            state: BlockState::Orphaned,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "block_status");
        assert_eq!(json["state"], "orphaned");
        assert_eq!(event.kind(), "block_status");
    }
}
