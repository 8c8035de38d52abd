use std::collections::HashMap;

use axum::{Json, extract::State};
use serde::Serialize;

use crate::{auth::User, state::AppState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub project: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        project: "wordex",
    })
}

#[derive(Serialize)]
pub struct ValidatorStats {
    pub total_calls: u64,
    pub cache_hits: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub active_games: usize,
    pub players_waiting: HashMap<String, usize>,
    pub validator: ValidatorStats,
}

pub async fn stats(State(state): State<AppState>, _user: User) -> Json<StatsResponse> {
    Json(StatsResponse {
        active_games: state.games.len(),
        players_waiting: state.matchmaking.queue_depths(),
        validator: ValidatorStats {
            total_calls: state.oracle.total_calls(),
            cache_hits: state.oracle.cache_hits(),
        },
    })
}
