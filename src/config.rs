use std::sync::Arc;

use axum::{
    Router,
    extract::MatchedPath,
    routing::{get, post},
};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    MIGRATIONS,
    settings::Settings,
    state::{AppState, DbPool},
    validator::{ValidationOracle, WordJudge, gemini::GeminiJudge},
};

pub fn build_state(
    pool: DbPool,
    settings: Arc<Settings>,
    judge: Arc<dyn WordJudge>,
) -> AppState {
    AppState {
        pool,
        settings,
        games: Arc::new(crate::game::ActiveGames::default()),
        matchmaking: Arc::new(crate::matchmaking::MatchPool::default()),
        connections: Arc::new(crate::connection::ConnectionRegistry::default()),
        oracle: Arc::new(ValidationOracle::new(judge)),
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(crate::monitoring::health))
        .route("/monitoring/stats", get(crate::monitoring::stats))
        .route("/matchmaking/find", get(crate::matchmaking::find_match))
        .route("/matchmaking/cancel", post(crate::matchmaking::cancel_matchmaking))
        .route("/ws/game/:game_id", get(crate::connection::game_websocket))
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http().make_span_with(
                    |request: &axum::extract::Request<_>| {
                        let matched_path = request
                            .extensions()
                            .get::<MatchedPath>()
                            .map(MatchedPath::as_str);

                        tracing::info_span!(
                            "http_request",
                            method = ?request.method(),
                            matched_path,
                        )
                    },
                ),
            ),
        )
}

pub async fn run(listen_addr: &str) {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let settings = Arc::new(Settings::load());

    let db_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| ":memory:".to_string());
    let pool: DbPool = Pool::builder()
        .max_size(if db_url == ":memory:" { 1 } else { 10 })
        .build(ConnectionManager::new(db_url))
        .unwrap();

    {
        let mut conn = pool.get().unwrap();
        conn.run_pending_migrations(MIGRATIONS).unwrap();
    }

    if settings.gemini_api_key.is_none() {
        tracing::warn!(
            "GEMINI_API_KEY is not configured; word validation will degrade to mistakes"
        );
    }
    let judge = Arc::new(GeminiJudge::new(
        settings.gemini_api_key.clone(),
        settings.gemini_models.clone(),
    ));

    let state = build_state(pool, settings, judge);

    tokio::spawn(crate::matchmaking::run_sweep(state.clone()));

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await.unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}
