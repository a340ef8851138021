/// Share Validator
///
/// Classifies one `mining.submit` against the connection's issued jobs, its
/// duplicate filter and the tier/network targets. Checks run in a fixed order
/// and stop at the first failure:
/// 1. job is one of the connection's recent jobs (stale / invalid), and the
///    extranonce2/ntime/nonce fields are well-formed (invalid)
/// 2. (job, extranonce2, ntime, nonce) not seen in the current window (duplicate)
/// 3. header rebuilt from job + extranonces + ntime + nonce, double-SHA256
/// 4. hash against the tier target (low difficulty) and the network target (block)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ProtocolError, ShareRejection};
use crate::jobs::MiningJob;
use crate::pow::{hash_to_hex, sha256d, share_score};
use crate::stratum::connection::{Connection, ConnectionState, JobLookup};
use crate::stratum::protocol::SubmitParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Accepted,
    Stale,
    Duplicate,
    LowDifficulty,
    Invalid,
}

impl ShareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
            Self::LowDifficulty => "low_difficulty",
            Self::Invalid => "invalid",
        }
    }
}

/// A share that also meets the network target
#[derive(Debug, Clone)]
pub struct BlockCandidate {
    pub height: u64,
    /// Display-order block hash
    pub hash: String,
    pub block_hex: String,
    pub reward: u64,
}

#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub status: ShareStatus,
    pub rejection: Option<ShareRejection>,
    pub job: Option<Arc<MiningJob>>,
    /// Zero unless accepted
    pub score: Decimal,
    pub block: Option<BlockCandidate>,
}

impl ShareOutcome {
    fn rejected(rejection: ShareRejection, job: Option<Arc<MiningJob>>) -> Self {
        let status = match rejection {
            ShareRejection::Stale => ShareStatus::Stale,
            ShareRejection::Duplicate => ShareStatus::Duplicate,
            ShareRejection::LowDifficulty => ShareStatus::LowDifficulty,
            ShareRejection::Invalid(_) => ShareStatus::Invalid,
        };
        Self {
            status,
            rejection: Some(rejection),
            job,
            score: Decimal::ZERO,
            block: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ShareStatus::Accepted
    }
}

fn parse_u32_hex(field: &str, value: &str) -> Result<u32, ShareRejection> {
    if value.len() != 8 {
        return Err(ShareRejection::Invalid(format!("{} must be 8 hex chars", field)));
    }
    u32::from_str_radix(value, 16)
        .map_err(|_| ShareRejection::Invalid(format!("{} is not hex", field)))
}

#[derive(Debug, Clone)]
pub struct ShareValidator {
    /// How far past the job time a submitted ntime may be
    pub ntime_tolerance: u32,
}

impl ShareValidator {
    pub fn new(ntime_tolerance: u32) -> Self {
        Self { ntime_tolerance }
    }

    pub fn validate(
        &self,
        conn: &mut Connection,
        submit: &SubmitParams,
        window_id: u64,
    ) -> Result<ShareOutcome, ProtocolError> {
        if conn.state() != ConnectionState::Mining {
            return Err(ProtocolError::OutOfOrder {
                method: "mining.submit",
                state: conn.state(),
            });
        }
        conn.touch();

        let outcome = self.classify(conn, submit, window_id);
        let counters = &mut conn.counters;
        match outcome.status {
            ShareStatus::Accepted => counters.accepted += 1,
            ShareStatus::Stale => counters.stale += 1,
            ShareStatus::Duplicate => counters.duplicate += 1,
            ShareStatus::LowDifficulty => counters.low_difficulty += 1,
            ShareStatus::Invalid => counters.invalid += 1,
        }
        if outcome.block.is_some() {
            counters.blocks += 1;
        }
        Ok(outcome)
    }

    fn classify(&self, conn: &mut Connection, submit: &SubmitParams, window_id: u64) -> ShareOutcome {
        if conn.worker_id().as_deref() != Some(submit.worker.as_str())
            && conn.miner() != Some(submit.worker.as_str())
        {
            return ShareOutcome::rejected(
                ShareRejection::Invalid(format!("worker {} not authorized", submit.worker)),
                None,
            );
        }

        let job = match conn.lookup_job(&submit.job_id) {
            JobLookup::Current(job) => job,
            JobLookup::Stale => return ShareOutcome::rejected(ShareRejection::Stale, None),
            JobLookup::Unknown => {
                return ShareOutcome::rejected(
                    ShareRejection::Invalid(format!("unknown job {}", submit.job_id)),
                    None,
                )
            }
        };

        let (extranonce2, ntime, nonce) = match self.parse_fields(&job, submit) {
            Ok(fields) => fields,
            Err(rejection) => return ShareOutcome::rejected(rejection, Some(job)),
        };

        if !conn.remember_share(window_id, &job.id, &extranonce2, ntime, nonce) {
            return ShareOutcome::rejected(ShareRejection::Duplicate, Some(job));
        }

        let (header, coinbase) = job.header(conn.extranonce1(), &extranonce2, ntime, nonce);
        let hash = sha256d(&header);

        let meets_network = job.network_target.is_met_by(&hash);
        if !meets_network && !conn.tier.share_target.is_met_by(&hash) {
            return ShareOutcome::rejected(ShareRejection::LowDifficulty, Some(job));
        }

        let block = meets_network.then(|| BlockCandidate {
            height: job.height,
            hash: hash_to_hex(&hash),
            block_hex: job.block_hex(&header, &coinbase),
            reward: job.block_reward,
        });

        ShareOutcome {
            status: ShareStatus::Accepted,
            rejection: None,
            score: share_score(&conn.tier.share_target, &job.network_target),
            job: Some(job),
            block,
        }
    }

    fn parse_fields(
        &self,
        job: &MiningJob,
        submit: &SubmitParams,
    ) -> Result<(Vec<u8>, u32, u32), ShareRejection> {
        let extranonce2 = hex::decode(&submit.extranonce2)
            .map_err(|_| ShareRejection::Invalid("extranonce2 is not hex".to_string()))?;
        if extranonce2.len() != job.extranonce2_size {
            return Err(ShareRejection::Invalid(format!(
                "extranonce2 must be {} bytes",
                job.extranonce2_size
            )));
        }

        let ntime = parse_u32_hex("ntime", &submit.ntime)?;
        if ntime < job.ntime || ntime - job.ntime > self.ntime_tolerance {
            return Err(ShareRejection::Invalid("ntime out of range".to_string()));
        }

        let nonce = parse_u32_hex("nonce", &submit.nonce)?;
        Ok((extranonce2, ntime, nonce))
    }
}
