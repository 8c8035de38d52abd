use std::sync::Arc;

use axum::extract::FromRef;
use diesel::{
    SqliteConnection,
    r2d2::{ConnectionManager, Pool, PoolError, PooledConnection},
};

use crate::{
    connection::ConnectionRegistry, game::ActiveGames, matchmaking::MatchPool,
    settings::Settings, validator::ValidationOracle,
};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Shared server state. Everything in here is cheap to clone; the registries
/// are `Arc`s around their own locks.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub settings: Arc<Settings>,
    pub games: Arc<ActiveGames>,
    pub matchmaking: Arc<MatchPool>,
    pub connections: Arc<ConnectionRegistry>,
    pub oracle: Arc<ValidationOracle>,
}

impl AppState {
    pub fn db(&self) -> Result<DbConn, PoolError> {
        self.pool.get()
    }
}

impl FromRef<AppState> for DbPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<Settings> {
    fn from_ref(state: &AppState) -> Self {
        state.settings.clone()
    }
}
