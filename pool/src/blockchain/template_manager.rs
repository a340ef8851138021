/// Block template polling and job distribution
///
/// `JobDistributor` polls the node, turns every changed template into a
/// `MiningJob` and publishes it on the `JobBoard`. While the node is
/// unreachable it backs off exponentially and keeps serving the last job
/// until the stale-job timeout, then flags the board degraded so
/// connections stop receiving notifications.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time;
use uuid::Uuid;

use super::rpc_client::NodePeer;
use crate::bus::{EventPublisher, JobEvent, PoolEvent};
use crate::jobs::{CoinbaseParams, JobBoard, MiningJob};
use crate::metrics::prometheus as metrics;
use crate::pow::{hash_to_hex, sha256d};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub prev_hash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    pub bits: String,
    #[serde(rename = "curtime")]
    pub cur_time: u64,
    pub height: u64,
}

impl BlockTemplate {
    /// Parse from RPC response
    pub fn from_rpc_response(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Identity of the template content. `curtime` is left out so a
    /// template that only ticked its clock is not a new job.
    pub fn fingerprint(&self) -> String {
        let mut buf = Vec::with_capacity(128 + self.transactions.len() * 64);
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.bits.as_bytes());
        buf.extend_from_slice(&self.coinbase_value.to_le_bytes());
        for tx in &self.transactions {
            buf.extend_from_slice(tx.txid.as_bytes());
        }
        hash_to_hex(&sha256d(&buf))
    }
}

#[derive(Debug, Clone)]
pub struct DistributorSettings {
    pub poll_interval: Duration,
    pub stale_job_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    NewJob(Arc<MiningJob>),
    Unchanged,
    Failed,
}

pub struct JobDistributor {
    node: Arc<dyn NodePeer>,
    board: Arc<JobBoard>,
    publisher: EventPublisher,
    params: CoinbaseParams,
    settings: DistributorSettings,
    refresh: Arc<Notify>,
    next_seq: u64,
    fingerprint: Option<String>,
    prev_hash: Option<String>,
    last_success: Option<Instant>,
    started: Instant,
    failures: u32,
}

impl JobDistributor {
    pub fn new(
        node: Arc<dyn NodePeer>,
        board: Arc<JobBoard>,
        publisher: EventPublisher,
        params: CoinbaseParams,
        settings: DistributorSettings,
        refresh: Arc<Notify>,
    ) -> Self {
        tracing::info!(
            "JobDistributor: poll every {}ms, stale after {}s",
            settings.poll_interval.as_millis(),
            settings.stale_job_timeout.as_secs()
        );
        Self {
            node,
            board,
            publisher,
            params,
            settings,
            refresh,
            next_seq: 1,
            fingerprint: None,
            prev_hash: None,
            last_success: None,
            started: Instant::now(),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next poll after `failures` consecutive errors
    pub fn backoff(&self) -> Duration {
        if self.failures == 0 {
            return self.settings.poll_interval;
        }
        let shift = (self.failures - 1).min(16);
        self.settings
            .backoff_initial
            .saturating_mul(1u32 << shift)
            .min(self.settings.backoff_max)
    }

    /// Fetch one template and publish a job if it changed
    pub async fn poll_once(&mut self) -> PollOutcome {
        let template = match self.node.get_block_template().await {
            Ok(t) => t,
            Err(e) => {
                self.failures += 1;
                metrics::inc_template_fetch_errors();
                tracing::warn!("Failed to fetch block template (attempt {}): {}", self.failures, e);
                self.check_staleness();
                return PollOutcome::Failed;
            }
        };

        if self.failures > 0 {
            tracing::info!("Node reachable again after {} failed polls", self.failures);
        }
        self.failures = 0;
        self.last_success = Some(Instant::now());
        if self.board.set_degraded(false) {
            metrics::set_distributor_degraded(false);
        }

        let fingerprint = template.fingerprint();
        if self.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return PollOutcome::Unchanged;
        }

        let clean_jobs = self.prev_hash.as_deref() != Some(template.prev_hash.as_str());
        let seq = self.next_seq;
        let job = match MiningJob::from_template(seq, &template, &self.params, clean_jobs) {
            Ok(job) => job,
            Err(e) => {
                metrics::inc_template_fetch_errors();
                tracing::error!("Unusable block template at height {}: {:#}", template.height, e);
                return PollOutcome::Failed;
            }
        };
        self.next_seq += 1;
        self.fingerprint = Some(fingerprint);
        self.prev_hash = Some(template.prev_hash.clone());

        let job = self.board.publish(job);
        metrics::set_template_height(job.height);
        metrics::inc_template_updates();
        metrics::set_distributor_degraded(false);
        tracing::info!(
            "New job {}: height={}, clean={}, txs={}, prev={}",
            job.id,
            job.height,
            job.clean_jobs,
            job.transactions.len(),
            &template.prev_hash[..template.prev_hash.len().min(16)]
        );

        self.publisher.publish(PoolEvent::Job(JobEvent {
            id: Uuid::new_v4(),
            job_id: job.id.clone(),
            height: job.height,
            prev_hash: template.prev_hash,
            clean_jobs: job.clean_jobs,
            timestamp: Utc::now(),
        }));

        PollOutcome::NewJob(job)
    }

    fn check_staleness(&self) {
        let since = self.last_success.unwrap_or(self.started);
        if since.elapsed() >= self.settings.stale_job_timeout && self.board.set_degraded(true) {
            metrics::set_distributor_degraded(true);
            tracing::error!(
                "No template for {}s, job distribution degraded",
                since.elapsed().as_secs()
            );
        }
    }

    /// Poll until `shutdown` flips. A block found elsewhere in the pool
    /// wakes the loop through `refresh`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.poll_once().await;
            let delay = self.backoff();

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = self.refresh.notified() => {
                    tracing::debug!("Template refresh requested");
                }
                _ = shutdown.changed() => {
                    tracing::info!("JobDistributor stopping");
                    return;
                }
            }
        }
    }
}
