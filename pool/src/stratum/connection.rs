/// Per-connection protocol state machine
///
/// Pure state: no sockets, no clocks beyond activity stamps. The server task
/// owns one `Connection` and drives it with parsed client messages and job
/// snapshots:
/// - `Connected → Subscribed` on `mining.subscribe`
/// - `Subscribed → Authorized` on a well-formed `mining.authorize`
/// - `Authorized → Mining` on the first job issued
/// - any state `→ Closed` on teardown

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::jobs::MiningJob;
use crate::stratum::Tier;

/// Jobs a connection may still submit against
pub const RECENT_JOBS: usize = 2;

const MAX_ACCOUNT_LEN: usize = 64;
const MAX_WORKER_LEN: usize = 32;
const DEFAULT_WORKER: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Authorized,
    Mining,
    Closed,
}

/// Where a submitted job id falls for this connection
#[derive(Debug, Clone)]
pub enum JobLookup {
    Current(Arc<MiningJob>),
    /// Issued here, but no longer among the most recent jobs
    Stale,
    /// Never issued to this connection
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareCounters {
    pub accepted: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub low_difficulty: u64,
    pub invalid: u64,
    pub blocks: u64,
}

/// Identity of a submitted header within one job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    job_id: String,
    extranonce2: Vec<u8>,
    ntime: u32,
    nonce: u32,
}

pub struct Connection {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    pub tier: Arc<Tier>,
    state: ConnectionState,
    extranonce1: [u8; 4],
    user_agent: Option<String>,
    miner: Option<String>,
    worker: Option<String>,

    recent_jobs: VecDeque<Arc<MiningJob>>,
    first_issued_seq: Option<u64>,

    seen: HashSet<ShareKey>,
    seen_window: u64,

    pub counters: ShareCounters,
    connected_at: Instant,
    last_activity: Instant,
}

fn valid_name(s: &str, max: usize) -> bool {
    !s.is_empty()
        && s.len() <= max
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split `account.worker`; a bare account mines as the default worker
pub fn parse_worker_name(username: &str) -> Result<(String, String), ProtocolError> {
    let (account, worker) = match username.split_once('.') {
        Some((a, w)) => (a, w),
        None => (username, DEFAULT_WORKER),
    };
    if !valid_name(account, MAX_ACCOUNT_LEN) || !valid_name(worker, MAX_WORKER_LEN) {
        return Err(ProtocolError::InvalidWorkerName(username.to_string()));
    }
    Ok((account.to_string(), worker.to_string()))
}

impl Connection {
    pub fn new(session_id: u64, peer_addr: SocketAddr, tier: Arc<Tier>) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            peer_addr,
            tier,
            state: ConnectionState::Connected,
            // Unique per session for the first 2^32 sessions
            extranonce1: (session_id as u32).to_be_bytes(),
            user_agent: None,
            miner: None,
            worker: None,
            recent_jobs: VecDeque::with_capacity(RECENT_JOBS + 1),
            first_issued_seq: None,
            seen: HashSet::new(),
            seen_window: 0,
            counters: ShareCounters::default(),
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn extranonce1(&self) -> &[u8] {
        &self.extranonce1
    }

    /// Miner account credited by the ledger
    pub fn miner(&self) -> Option<&str> {
        self.miner.as_deref()
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// `account.worker` as authorized
    pub fn worker_id(&self) -> Option<String> {
        match (&self.miner, &self.worker) {
            (Some(m), Some(w)) => Some(format!("{}.{}", m, w)),
            _ => None,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// `mining.subscribe`: returns the subscribe result array
    pub fn subscribe(
        &mut self,
        user_agent: Option<String>,
        extranonce2_size: usize,
    ) -> Result<Value, ProtocolError> {
        if self.state != ConnectionState::Connected {
            return Err(ProtocolError::OutOfOrder {
                method: "mining.subscribe",
                state: self.state,
            });
        }
        self.user_agent = user_agent;
        self.state = ConnectionState::Subscribed;

        let sub_id = format!("{:016x}", self.session_id);
        Ok(json!([
            [["mining.set_difficulty", sub_id], ["mining.notify", sub_id]],
            hex::encode(self.extranonce1),
            extranonce2_size,
        ]))
    }

    /// `mining.authorize`
    pub fn authorize(&mut self, username: &str) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Subscribed {
            return Err(ProtocolError::OutOfOrder {
                method: "mining.authorize",
                state: self.state,
            });
        }
        let (miner, worker) = parse_worker_name(username)?;
        self.miner = Some(miner);
        self.worker = Some(worker);
        self.state = ConnectionState::Authorized;
        Ok(())
    }

    /// Record a job about to be notified. Returns false when nothing should
    /// be sent: not authorized yet, or the job is already the newest one.
    pub fn issue_job(&mut self, job: Arc<MiningJob>) -> bool {
        match self.state {
            ConnectionState::Authorized | ConnectionState::Mining => {}
            _ => return false,
        }
        if self.recent_jobs.back().map_or(false, |j| j.seq >= job.seq) {
            return false;
        }
        if job.clean_jobs {
            self.recent_jobs.clear();
        }
        self.first_issued_seq.get_or_insert(job.seq);
        self.recent_jobs.push_back(job);
        while self.recent_jobs.len() > RECENT_JOBS {
            self.recent_jobs.pop_front();
        }
        // Shares for jobs that left the window classify as stale before
        // the duplicate check, so their keys are dead weight
        let recent = &self.recent_jobs;
        self.seen.retain(|key| recent.iter().any(|j| j.id == key.job_id));
        self.state = ConnectionState::Mining;
        true
    }

    pub fn latest_job(&self) -> Option<&Arc<MiningJob>> {
        self.recent_jobs.back()
    }

    pub fn lookup_job(&self, job_id: &str) -> JobLookup {
        if let Some(job) = self.recent_jobs.iter().find(|j| j.id == job_id) {
            return JobLookup::Current(job.clone());
        }
        let (Some(first), Some(newest)) = (self.first_issued_seq, self.recent_jobs.back()) else {
            return JobLookup::Unknown;
        };
        match u64::from_str_radix(job_id, 16) {
            Ok(seq) if seq >= first && seq < newest.seq => JobLookup::Stale,
            _ => JobLookup::Unknown,
        }
    }

    /// Returns false when the same header was already submitted in this
    /// window. Takes decoded fields so hex case cannot dodge the filter.
    /// The filter is dropped whenever the window id changes.
    pub fn remember_share(
        &mut self,
        window_id: u64,
        job_id: &str,
        extranonce2: &[u8],
        ntime: u32,
        nonce: u32,
    ) -> bool {
        if window_id != self.seen_window {
            self.seen.clear();
            self.seen_window = window_id;
        }
        self.seen.insert(ShareKey {
            job_id: job_id.to_string(),
            extranonce2: extranonce2.to_vec(),
            ntime,
            nonce,
        })
    }

    /// Entries held by the duplicate filter
    pub fn seen_shares(&self) -> usize {
        self.seen.len()
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.recent_jobs.clear();
        self.seen.clear();
    }
}
