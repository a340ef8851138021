/// Mining jobs
///
/// A `MiningJob` is built once from a node block template and never mutated.
/// The current job is published through `JobBoard`, a `watch` channel that
/// every connection task reads from.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;

use crate::blockchain::template_manager::BlockTemplate;
use crate::pow::{sha256d, Target};

/// Pool-side coinbase settings
#[derive(Debug, Clone)]
pub struct CoinbaseParams {
    /// Output script receiving the block reward
    pub payout_script: Vec<u8>,
    /// Free-form bytes pushed into the coinbase script after the extranonces
    pub pool_tag: Vec<u8>,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,
}

#[derive(Debug, Clone)]
pub struct MiningJob {
    pub id: String,
    pub seq: u64,
    pub height: u64,
    /// Previous block hash, internal byte order
    pub prev_hash: [u8; 32],
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub bits: u32,
    pub ntime: u32,
    pub network_target: Target,
    pub block_reward: u64,
    pub clean_jobs: bool,
    pub extranonce2_size: usize,
    /// Raw non-coinbase transactions, in template order
    pub transactions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MiningJob {
    pub fn from_template(
        seq: u64,
        template: &BlockTemplate,
        params: &CoinbaseParams,
        clean_jobs: bool,
    ) -> Result<Self> {
        let prev_hash = decode_display_hash(&template.prev_hash)
            .context("invalid previousblockhash")?;
        let bits = u32::from_str_radix(&template.bits, 16)
            .map_err(|e| anyhow!("invalid bits {:?}: {}", template.bits, e))?;

        let mut txids = Vec::with_capacity(template.transactions.len());
        for tx in &template.transactions {
            txids.push(decode_display_hash(&tx.txid).context("invalid txid")?);
        }

        let (coinb1, coinb2) = build_coinbase(template.height, template.coinbase_value, params);

        Ok(Self {
            id: format!("{:x}", seq),
            seq,
            height: template.height,
            prev_hash,
            coinb1,
            coinb2,
            merkle_branch: merkle_branch(&txids),
            version: template.version,
            bits,
            ntime: template.cur_time as u32,
            network_target: Target::from_compact(bits),
            block_reward: template.coinbase_value,
            clean_jobs,
            extranonce2_size: params.extranonce2_size,
            transactions: template.transactions.iter().map(|t| t.data.clone()).collect(),
            created_at: Utc::now(),
        })
    }

    /// Same job content with a different network target. Used where the
    /// compact bits of a test network are too hard to hit.
    pub fn with_network_target(mut self, target: Target) -> Self {
        self.network_target = target;
        self
    }

    pub fn coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut tx = Vec::with_capacity(
            self.coinb1.len() + extranonce1.len() + extranonce2.len() + self.coinb2.len(),
        );
        tx.extend_from_slice(&self.coinb1);
        tx.extend_from_slice(extranonce1);
        tx.extend_from_slice(extranonce2);
        tx.extend_from_slice(&self.coinb2);
        tx
    }

    pub fn merkle_root(&self, coinbase_hash: [u8; 32]) -> [u8; 32] {
        let mut root = coinbase_hash;
        let mut buf = [0u8; 64];
        for step in &self.merkle_branch {
            buf[..32].copy_from_slice(&root);
            buf[32..].copy_from_slice(step);
            root = sha256d(&buf);
        }
        root
    }

    /// 80-byte block header plus the coinbase it commits to
    pub fn header(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
        ntime: u32,
        nonce: u32,
    ) -> ([u8; 80], Vec<u8>) {
        let coinbase = self.coinbase(extranonce1, extranonce2);
        let root = self.merkle_root(sha256d(&coinbase));

        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&root);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        (header, coinbase)
    }

    /// Serialized block for `submitblock`
    pub fn block_hex(&self, header: &[u8; 80], coinbase: &[u8]) -> String {
        let mut block = Vec::with_capacity(80 + coinbase.len() + 9);
        block.extend_from_slice(header);
        write_varint(&mut block, 1 + self.transactions.len() as u64);
        block.extend_from_slice(coinbase);

        let mut out = hex::encode(block);
        for tx in &self.transactions {
            out.push_str(tx);
        }
        out
    }

    /// Previous hash in stratum word order
    pub fn prev_hash_stratum(&self) -> String {
        let mut out = String::with_capacity(64);
        for chunk in self.prev_hash.chunks(4) {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            word.reverse();
            out.push_str(&hex::encode(word));
        }
        out
    }

    /// Params array for `mining.notify`
    pub fn notify_params(&self) -> Value {
        let branch: Vec<String> = self.merkle_branch.iter().map(hex::encode).collect();
        json!([
            self.id,
            self.prev_hash_stratum(),
            hex::encode(&self.coinb1),
            hex::encode(&self.coinb2),
            branch,
            format!("{:08x}", self.version),
            format!("{:08x}", self.bits),
            format!("{:08x}", self.ntime),
            self.clean_jobs,
        ])
    }
}

/// Hex hash in display order to internal byte order
fn decode_display_hash(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(anyhow!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out.reverse();
    Ok(out)
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// BIP34 height push: minimal little-endian script number
fn height_push(height: u64) -> Vec<u8> {
    let mut num = Vec::new();
    let mut h = height;
    while h > 0 {
        num.push((h & 0xff) as u8);
        h >>= 8;
    }
    if num.last().map_or(true, |b| b & 0x80 != 0) {
        num.push(0);
    }
    let mut push = Vec::with_capacity(num.len() + 1);
    push.push(num.len() as u8);
    push.extend_from_slice(&num);
    push
}

/// Split the coinbase around the extranonce slot
fn build_coinbase(height: u64, value: u64, params: &CoinbaseParams) -> (Vec<u8>, Vec<u8>) {
    let height = height_push(height);
    let tag: Vec<u8> = if params.pool_tag.is_empty() {
        Vec::new()
    } else {
        let mut t = Vec::with_capacity(params.pool_tag.len() + 1);
        t.push(params.pool_tag.len() as u8);
        t.extend_from_slice(&params.pool_tag);
        t
    };
    let script_len =
        height.len() + params.extranonce1_size + params.extranonce2_size + tag.len();

    let mut coinb1 = Vec::with_capacity(42 + height.len());
    coinb1.extend_from_slice(&1u32.to_le_bytes());
    coinb1.push(1);
    coinb1.extend_from_slice(&[0u8; 32]);
    coinb1.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    write_varint(&mut coinb1, script_len as u64);
    coinb1.extend_from_slice(&height);

    let mut coinb2 = Vec::with_capacity(tag.len() + 18 + params.payout_script.len());
    coinb2.extend_from_slice(&tag);
    coinb2.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    coinb2.push(1);
    coinb2.extend_from_slice(&value.to_le_bytes());
    write_varint(&mut coinb2, params.payout_script.len() as u64);
    coinb2.extend_from_slice(&params.payout_script);
    coinb2.extend_from_slice(&0u32.to_le_bytes());

    (coinb1, coinb2)
}

/// Stratum merkle branch for a coinbase at index 0 followed by `txids`
fn merkle_branch(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branch = Vec::new();
    // Slot 0 stands for the not-yet-known coinbase hash
    let mut level: Vec<[u8; 32]> = Vec::with_capacity(txids.len() + 1);
    level.push([0u8; 32]);
    level.extend_from_slice(txids);

    let mut buf = [0u8; 64];
    while level.len() > 1 {
        branch.push(level[1]);
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        next.push([0u8; 32]);
        for pair in level[2..].chunks(2) {
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(&pair[1]);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    branch
}

/// Read-mostly view of the job a connection should be mining
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub job: Option<Arc<MiningJob>>,
    /// Node unreachable past the stale-job timeout; notifications stop
    pub degraded: bool,
}

impl JobSnapshot {
    /// The job to notify, or `None` while degraded
    pub fn live_job(&self) -> Option<&Arc<MiningJob>> {
        if self.degraded {
            None
        } else {
            self.job.as_ref()
        }
    }
}

/// Publishes job snapshots to all connection tasks
pub struct JobBoard {
    tx: watch::Sender<JobSnapshot>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(JobSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.tx.borrow().clone()
    }

    /// Replace the current job and clear the degraded flag
    pub fn publish(&self, job: MiningJob) -> Arc<MiningJob> {
        let job = Arc::new(job);
        self.tx.send_replace(JobSnapshot {
            job: Some(job.clone()),
            degraded: false,
        });
        job
    }

    /// Returns true when the flag actually changed
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.degraded == degraded {
                false
            } else {
                snap.degraded = degraded;
                true
            }
        })
    }
}
