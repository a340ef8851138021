/// HTTP read API
///
/// Read-only views over the accounting state, the job board and the
/// listeners. Handlers take short read locks and never block on I/O.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

use crate::jobs::JobBoard;
use crate::metrics::prometheus as metrics;
use crate::pplns::SharedAccounting;
use crate::stratum::StratumServer;

const RECENT_PAYOUTS_DEFAULT: usize = 20;
const RECENT_PAYOUTS_MAX: usize = 200;

#[derive(Clone)]
pub struct ApiState {
    pub accounting: SharedAccounting,
    pub board: Arc<JobBoard>,
    pub server: Option<Arc<StratumServer>>,
    pub tiers: Vec<Value>,
    pub start_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

async fn api_health(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.board.snapshot();
    Json(json!({
        "status": if snapshot.degraded { "degraded" } else { "ok" },
        "has_job": snapshot.job.is_some(),
    }))
}

async fn api_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn api_stats(State(state): State<ApiState>) -> Json<Value> {
    let ledger = state.accounting.read().stats();
    let snapshot = state.board.snapshot();
    let connections = state.server.as_ref().map(|s| s.connection_count()).unwrap_or(0);
    Json(json!({
        "window": ledger,
        "degraded": snapshot.degraded,
        "current_height": snapshot.job.as_ref().map(|j| j.height),
        "current_job": snapshot.job.as_ref().map(|j| j.id.clone()),
        "connections": connections,
        "tiers": state.tiers,
        "uptime_secs": Utc::now().timestamp() - state.start_time,
    }))
}

async fn api_miner_score(Path(miner): Path<String>, State(state): State<ApiState>) -> Json<Value> {
    let view = state.accounting.read().miner_view(&miner);
    Json(json!({"ok": true, "miner": view}))
}

async fn api_miner_estimate(
    Path(miner): Path<String>,
    State(state): State<ApiState>,
) -> Json<Value> {
    let current_reward = state.board.snapshot().job.map(|j| j.block_reward);
    let estimate = state.accounting.read().estimate(&miner, current_reward);
    Json(json!({"ok": true, "estimate": estimate}))
}

async fn api_miner_payouts(
    Path(miner): Path<String>,
    State(state): State<ApiState>,
) -> Json<Value> {
    let payouts = state.accounting.read().miner_payouts(&miner);
    Json(json!({"ok": true, "miner": miner, "payouts": payouts}))
}

async fn api_recent_payouts(
    Query(query): Query<RecentQuery>,
    State(state): State<ApiState>,
) -> Json<Value> {
    let limit = query
        .limit
        .unwrap_or(RECENT_PAYOUTS_DEFAULT)
        .clamp(1, RECENT_PAYOUTS_MAX);
    let payouts = state.accounting.read().recent_payouts(limit);
    Json(json!({"ok": true, "payouts": payouts}))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/stats", get(api_stats))
        .route("/api/v1/miner/:id/score", get(api_miner_score))
        .route("/api/v1/miner/:id/estimate", get(api_miner_estimate))
        .route("/api/v1/miner/:id/payouts", get(api_miner_payouts))
        .route("/api/v1/payouts/recent", get(api_recent_payouts))
        .with_state(state)
}

pub async fn serve(
    listen: &str,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("HTTP API listening on {}", listen);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BlockFoundEvent, BlockState, BlockStatusEvent, Delivery, PoolEvent, ShareEvent};
    use crate::jobs::test_support::job;
    use crate::pplns::{Accounting, PayoutCalculator};
    use crate::shares::ShareStatus;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn delivery(event: PoolEvent) -> Delivery {
        Delivery {
            payload: serde_json::to_string(&event).unwrap(),
        }
    }

    fn share(miner: &str, score: Decimal) -> PoolEvent {
        PoolEvent::Share(ShareEvent {
            id: Uuid::new_v4(),
            window_id: 0,
            miner: miner.into(),
            worker: format!("{}.a", miner),
            tier: "low".into(),
            job_id: "1".into(),
            height: 101,
            status: ShareStatus::Accepted,
            score,
            timestamp: Utc::now(),
        })
    }

    fn state() -> ApiState {
        let accounting = Accounting::new(0, PayoutCalculator::new(dec!(0.02)).unwrap(), 8).shared();
        ApiState {
            accounting,
            board: Arc::new(JobBoard::new()),
            server: None,
            tiers: vec![json!({"name": "low", "port": 3333, "difficulty": 16})],
            start_time: Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn test_health_reports_degraded() {
        let state = state();
        let Json(body) = api_health(State(state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["has_job"], false);

        state.board.set_degraded(true);
        let Json(body) = api_health(State(state)).await;
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_score_and_estimate_views() {
        let state = state();
        state.board.publish(job(1, true, 24));
        {
            let mut acc = state.accounting.write();
            acc.handle(&delivery(share("alice", dec!(1))));
            acc.handle(&delivery(share("bob", dec!(3))));
        }

        let Json(body) = api_miner_score(Path("alice".into()), State(state.clone())).await;
        assert_eq!(body["miner"]["score"], json!(dec!(1)));
        assert_eq!(body["miner"]["share_of_window"], json!(dec!(0.25)));

        let Json(body) = api_miner_estimate(Path("alice".into()), State(state.clone())).await;
        // 5_000_000_000 * 0.98 / 4
        assert_eq!(body["estimate"]["estimated"], 1_225_000_000u64);

        let Json(stats) = api_stats(State(state)).await;
        assert_eq!(stats["window"]["active_miners"], 2);
        assert_eq!(stats["current_height"], 101);
    }

    #[tokio::test]
    async fn test_payout_history_views() {
        let state = state();
        {
            let mut acc = state.accounting.write();
            acc.handle(&delivery(share("alice", dec!(300))));
            acc.handle(&delivery(share("bob", dec!(700))));
            acc.handle(&delivery(PoolEvent::BlockFound(BlockFoundEvent {
                id: Uuid::new_v4(),
                window_id: 0,
                height: 101,
                hash: "ee".repeat(32),
                miner: "bob".into(),
                worker: "bob.a".into(),
                reward: 60,
                timestamp: Utc::now(),
            })));
            assert!(acc.recent_payouts(1).is_empty());
            acc.handle(&delivery(PoolEvent::BlockStatus(BlockStatusEvent {
                id: Uuid::new_v4(),
                window_id: 0,
                height: 101,
                hash: "ee".repeat(32),
                state: BlockState::Confirmed,
                timestamp: Utc::now(),
            })));
        }

        let Json(body) = api_miner_payouts(Path("bob".into()), State(state.clone())).await;
        assert_eq!(body["payouts"][0]["amount"], 41);

        let Json(body) = api_recent_payouts(Query(RecentQuery { limit: Some(0) }), State(state)).await;
        assert_eq!(body["payouts"].as_array().unwrap().len(), 1);
        assert_eq!(body["payouts"][0]["fee"], 1);
    }

    #[test]
    fn test_router_builds() {
        let _ = router(state());
    }
}
