//! HTTP surface tests: matchmaking polling, cancel, health and the stats
//! counters, all against the real router with a stub judge.

use std::sync::Arc;

use axum_test::TestServer;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use serde_json::Value;

use crate::{
    MIGRATIONS,
    config::{build_state, create_app},
    settings::Settings,
    state::{AppState, DbPool},
    test_support::{StubJudge, insert_prompt, insert_user},
};

/// A state over a single-connection in-memory database (the pool is capped
/// at one so every request sees the same database).
fn test_state() -> AppState {
    let pool: DbPool = Pool::builder()
        .max_size(1)
        .build(ConnectionManager::new(":memory:"))
        .unwrap();
    {
        let mut conn = pool.get().unwrap();
        conn.run_pending_migrations(MIGRATIONS).unwrap();
        insert_user(&mut conn, "alice", 3);
        insert_user(&mut conn, "bob", 7);
        insert_prompt(&mut conn, "en", "The fire was warm.", "warm", "More extreme!");
    }
    build_state(
        pool,
        Arc::new(Settings::default()),
        Arc::new(StubJudge::valid_with_score(2)),
    )
}

fn server(state: AppState) -> TestServer {
    TestServer::new(create_app(state)).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let server = server(test_state());
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn matchmaking_requires_a_valid_token() {
    let server = server(test_state());

    let response = server.get("/matchmaking/find").await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let response = server
        .get("/matchmaking/find")
        .add_query_param("token", "not-a-token")
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn two_polls_in_the_same_language_get_matched() {
    let state = test_state();
    let server = server(state.clone());

    // First player waits.
    let response = server
        .get("/matchmaking/find")
        .add_query_param("token", "token-alice")
        .add_query_param("requested_language", "en")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["language"], "en");

    // Second player completes the pair.
    let response = server
        .get("/matchmaking/find")
        .add_query_param("token", "token-bob")
        .add_query_param("requested_language", "en")
        .await;
    let matched: Value = response.json();
    assert_eq!(matched["status"], "matched");
    assert_eq!(matched["opponent_name"], "alice");
    assert_eq!(matched["opponent_level"], 3);
    let game_id = matched["game_id"].as_str().unwrap().to_string();
    assert!(state.games.get(&game_id).is_some());

    // The first player's next poll sees the same match from cache.
    let response = server
        .get("/matchmaking/find")
        .add_query_param("token", "token-alice")
        .await;
    let body: Value = response.json();
    assert_eq!(body["status"], "matched");
    assert_eq!(body["game_id"].as_str().unwrap(), game_id);
    assert_eq!(body["opponent_name"], "bob");
    assert_eq!(body["opponent_level"], 7);
    assert_ne!(
        body["your_player_id_in_game"],
        matched["your_player_id_in_game"]
    );
}

#[tokio::test]
async fn different_languages_do_not_match() {
    let state = test_state();
    let server = server(state.clone());

    for (token, language) in [("token-alice", "en"), ("token-bob", "es")] {
        let response = server
            .get("/matchmaking/find")
            .add_query_param("token", token)
            .add_query_param("requested_language", language)
            .await;
        let body: Value = response.json();
        assert_eq!(body["status"], "waiting");
    }
    assert_eq!(state.games.len(), 0);
    assert_eq!(state.matchmaking.queue_depths().len(), 2);
}

#[tokio::test]
async fn cancel_leaves_the_pool() {
    let state = test_state();
    let server = server(state.clone());

    server
        .get("/matchmaking/find")
        .add_query_param("token", "token-alice")
        .await
        .assert_status_ok();
    assert!(state.matchmaking.is_waiting(1));

    server
        .post("/matchmaking/cancel")
        .add_query_param("token", "token-alice")
        .await
        .assert_status_ok();
    assert!(!state.matchmaking.is_waiting(1));
    assert!(state.matchmaking.status(1).is_none());
}

#[tokio::test]
async fn stats_reports_queue_depth_and_needs_auth() {
    let state = test_state();
    let server = server(state.clone());

    server
        .get("/monitoring/stats")
        .await
        .assert_status(axum::http::StatusCode::UNAUTHORIZED);

    server
        .get("/matchmaking/find")
        .add_query_param("token", "token-alice")
        .add_query_param("requested_language", "es")
        .await
        .assert_status_ok();

    let response = server
        .get("/monitoring/stats")
        .add_query_param("token", "token-bob")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["active_games"], 0);
    assert_eq!(body["players_waiting"]["es"], 1);
    assert_eq!(body["validator"]["total_calls"], 0);
}
