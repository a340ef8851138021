use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_STATUS: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_AWAITING: OnceLock<IntGauge> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static CONNECTIONS_REFUSED: OnceLock<IntCounterVec> = OnceLock::new();
static PROTOCOL_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static DISTRIBUTOR_DEGRADED: OnceLock<IntGauge> = OnceLock::new();

static BUS_PUBLISHED: OnceLock<IntCounter> = OnceLock::new();
static BUS_PUBLISH_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static BUS_BUFFERED: OnceLock<IntGauge> = OnceLock::new();

static LEDGER_APPLIED: OnceLock<IntCounter> = OnceLock::new();
static LEDGER_SKIPPED: OnceLock<IntCounterVec> = OnceLock::new();
static WINDOW_ID: OnceLock<IntGauge> = OnceLock::new();
static PAYOUTS_EMITTED: OnceLock<IntCounter> = OnceLock::new();
static PAYOUT_SINK_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static CHECKPOINT_ERRORS: OnceLock<IntCounter> = OnceLock::new();

fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    cell.get_or_init(|| IntCounter::new(name, help).expect("valid counter"))
}

fn gauge(cell: &'static OnceLock<IntGauge>, name: &str, help: &str) -> &'static IntGauge {
    cell.get_or_init(|| IntGauge::new(name, help).expect("valid gauge"))
}

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_total", "Shares by classification"),
            &["tier", "status"],
        )
        .expect("valid counter vec")
    })
}

fn connections_refused() -> &'static IntCounterVec {
    CONNECTIONS_REFUSED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("connections_refused_total", "Connections refused at accept"),
            &["reason"],
        )
        .expect("valid counter vec")
    })
}

fn ledger_skipped() -> &'static IntCounterVec {
    LEDGER_SKIPPED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("ledger_events_skipped_total", "Ledger events not applied"),
            &["reason"],
        )
        .expect("valid counter vec")
    })
}

fn block_status() -> &'static IntCounterVec {
    BLOCK_STATUS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("block_status_total", "Found blocks by final state"),
            &["state"],
        )
        .expect("valid counter vec")
    })
}

fn blocks_awaiting() -> &'static IntGauge {
    gauge(&BLOCKS_AWAITING, "blocks_awaiting_confirmation", "Closed windows waiting on their block")
}

fn blocks_found() -> &'static IntCounter {
    counter(&BLOCKS_FOUND, "blocks_found_total", "Shares meeting the network target")
}

fn block_submit_attempts() -> &'static IntCounter {
    counter(&BLOCK_SUBMIT_ATTEMPTS, "block_submit_attempts_total", "submitblock calls")
}

fn block_submit_rejected() -> &'static IntCounter {
    counter(&BLOCK_SUBMIT_REJECTED, "block_submit_rejected_total", "Blocks rejected by the node")
}

fn active_connections() -> &'static IntGauge {
    gauge(&ACTIVE_CONNECTIONS, "active_connections", "Open stratum connections")
}

fn protocol_errors() -> &'static IntCounter {
    counter(&PROTOCOL_ERRORS, "protocol_errors_total", "Connections closed for protocol errors")
}

fn job_broadcasts() -> &'static IntCounter {
    counter(&JOB_BROADCASTS, "job_broadcasts_total", "Total mining.notify messages sent")
}

fn rpc_requests() -> &'static IntCounter {
    counter(&RPC_REQUESTS, "rpc_requests_total", "Total RPC requests to the node")
}

fn rpc_errors() -> &'static IntCounter {
    counter(&RPC_ERRORS, "rpc_errors_total", "Failed RPC requests to the node")
}

fn template_updates() -> &'static IntCounter {
    counter(&TEMPLATE_UPDATES, "template_updates_total", "New jobs built from templates")
}

fn template_fetch_errors() -> &'static IntCounter {
    counter(&TEMPLATE_FETCH_ERRORS, "template_fetch_errors_total", "Failed template polls")
}

fn template_height() -> &'static IntGauge {
    gauge(&TEMPLATE_HEIGHT, "template_height", "Height of the current job")
}

fn distributor_degraded() -> &'static IntGauge {
    gauge(&DISTRIBUTOR_DEGRADED, "job_distributor_degraded", "1 while jobs are stale")
}

fn bus_published() -> &'static IntCounter {
    counter(&BUS_PUBLISHED, "bus_events_published_total", "Events delivered to the bus")
}

fn bus_publish_failures() -> &'static IntCounter {
    counter(&BUS_PUBLISH_FAILURES, "bus_publish_failures_total", "Failed bus publish attempts")
}

fn bus_buffered() -> &'static IntGauge {
    gauge(&BUS_BUFFERED, "bus_buffered_events", "Events held locally after publish failure")
}

fn ledger_applied() -> &'static IntCounter {
    counter(&LEDGER_APPLIED, "ledger_events_applied_total", "Events applied to the ledger")
}

fn window_id() -> &'static IntGauge {
    gauge(&WINDOW_ID, "payout_window_id", "Id of the open payout window")
}

fn payouts_emitted() -> &'static IntCounter {
    counter(&PAYOUTS_EMITTED, "payout_records_total", "Payout records emitted")
}

fn payout_sink_errors() -> &'static IntCounter {
    counter(&PAYOUT_SINK_ERRORS, "payout_sink_errors_total", "Failed payout sink appends")
}

fn checkpoint_errors() -> &'static IntCounter {
    counter(&CHECKPOINT_ERRORS, "ledger_checkpoint_errors_total", "Failed ledger checkpoint commits")
}

pub fn inc_share(tier: &str, status: &str) {
    shares().with_label_values(&[tier, status]).inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_attempts() {
    block_submit_attempts().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_block_status(state: &str) {
    block_status().with_label_values(&[state]).inc();
}

pub fn set_blocks_awaiting(count: usize) {
    blocks_awaiting().set(count as i64);
}

pub fn inc_active_connections() {
    active_connections().inc();
}

pub fn dec_active_connections() {
    active_connections().dec();
}

pub fn inc_connections_refused(reason: &str) {
    connections_refused().with_label_values(&[reason]).inc();
}

pub fn inc_protocol_errors() {
    protocol_errors().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn set_distributor_degraded(degraded: bool) {
    distributor_degraded().set(if degraded { 1 } else { 0 });
}

pub fn inc_bus_published() {
    bus_published().inc();
}

pub fn inc_bus_publish_failures() {
    bus_publish_failures().inc();
}

pub fn set_bus_buffered(len: usize) {
    bus_buffered().set(len as i64);
}

pub fn bus_buffered_events() -> i64 {
    bus_buffered().get()
}

pub fn inc_ledger_applied() {
    ledger_applied().inc();
}

pub fn inc_ledger_skipped(reason: &str) {
    ledger_skipped().with_label_values(&[reason]).inc();
}

pub fn set_window_id(id: u64) {
    window_id().set(id as i64);
}

pub fn inc_payouts_emitted() {
    payouts_emitted().inc();
}

pub fn inc_payout_sink_errors() {
    payout_sink_errors().inc();
}

pub fn inc_checkpoint_errors() {
    checkpoint_errors().inc();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_attempts().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(block_status().collect());
    mfs.extend(blocks_awaiting().collect());

    mfs.extend(active_connections().collect());
    mfs.extend(connections_refused().collect());
    mfs.extend(protocol_errors().collect());
    mfs.extend(job_broadcasts().collect());

    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(template_height().collect());
    mfs.extend(distributor_degraded().collect());

    mfs.extend(bus_published().collect());
    mfs.extend(bus_publish_failures().collect());
    mfs.extend(bus_buffered().collect());

    mfs.extend(ledger_applied().collect());
    mfs.extend(ledger_skipped().collect());
    mfs.extend(window_id().collect());
    mfs.extend(payouts_emitted().collect());
    mfs.extend(payout_sink_errors().collect());
    mfs.extend(checkpoint_errors().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
