//! Runtime statistics endpoint, served on its own listener.

use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RuntimeStat {
    pub flavor: String,
    pub workers: usize,
    pub alive_tasks: usize,
    pub global_queue_depth: usize,
    pub uptime_secs: u64,
    pub pid: u32,
}

impl RuntimeStat {
    /// Snapshot of the current tokio runtime.
    pub fn capture(started: Instant) -> Self {
        let handle = tokio::runtime::Handle::current();
        let metrics = handle.metrics();
        Self {
            flavor: format!("{:?}", handle.runtime_flavor()),
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
            global_queue_depth: metrics.global_queue_depth(),
            uptime_secs: started.elapsed().as_secs(),
            pid: std::process::id(),
        }
    }
}

/// `GET /debug/runtime`.
pub fn build_router(started: Instant) -> Router {
    Router::new()
        .route("/debug/runtime", get(runtime_stat))
        .with_state(started)
}

async fn runtime_stat(State(started): State<Instant>) -> Json<RuntimeStat> {
    Json(RuntimeStat::capture(started))
}
