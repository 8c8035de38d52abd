use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use diesel::{SqliteConnection, prelude::*};
use serde::Serialize;

use crate::{schema::users, state::DbPool};

/// A row from the `users` table. Doubles as the player handle the session
/// layer carries around: id, display name, level, bot flag.
#[derive(Debug, Queryable, Serialize, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub level: i64,
    pub experience: i64,
    pub words_count: i64,
    pub is_bot: bool,
    pub created_at: chrono::NaiveDateTime,
    pub last_login_at: Option<chrono::NaiveDateTime>,
}

#[derive(Debug)]
pub enum AuthError {
    TokenMissing,
    NoDatabase,
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AuthError::TokenMissing => {
                (StatusCode::UNAUTHORIZED, "Bearer token missing")
            }
            AuthError::NoDatabase => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
            AuthError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Unauthorized")
            }
        };
        (status, body).into_response()
    }
}

/// Pulls the bearer token out of the `Authorization` header, falling back to
/// a `token` query parameter. The query fallback exists for the websocket
/// handshake, where clients cannot set headers.
pub fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=").map(|t| t.to_string())
        })
    })
}

/// Resolves a bearer token to a player. This is the whole identity contract:
/// tokens are opaque credentials held on the user row.
pub fn authenticate(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<User, AuthError> {
    if token.is_empty() {
        return Err(AuthError::TokenMissing);
    }

    users::table
        .filter(users::api_token.eq(token))
        .first::<User>(conn)
        .optional()
        .map_err(|_| AuthError::NoDatabase)?
        .ok_or(AuthError::Unauthorized)
}

#[async_trait]
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
    DbPool: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).ok_or(AuthError::TokenMissing)?;

        let pool = DbPool::from_ref(state);
        let mut conn = pool.get().map_err(|_| AuthError::NoDatabase)?;

        authenticate(&mut conn, &token)
    }
}
