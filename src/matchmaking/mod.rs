//! Matchmaking: language-bucketed FIFO waiting queues, pairing, and the
//! bot-fallback sweep that rescues players nobody shows up for. Clients poll
//! `GET /matchmaking/find` until it reports `matched`, then open the game
//! socket.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use axum::{Json, extract::State};
use indexmap::IndexMap;
use rand::{
    Rng,
    seq::{IndexedRandom, SliceRandom},
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::User,
    game::{GameHandle, GameSession, PlayerState},
    state::AppState,
    users,
};

/// The slice of a user the pool needs while they wait.
#[derive(Debug, Clone)]
pub struct PoolPlayer {
    pub id: i64,
    pub username: String,
    pub level: i64,
}

impl From<&User> for PoolPlayer {
    fn from(user: &User) -> PoolPlayer {
        PoolPlayer {
            id: user.id,
            username: user.username.clone(),
            level: user.level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent_level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player1_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player2_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_player_id_in_game: Option<i64>,
}

impl MatchmakingStatusResponse {
    fn waiting(player_id: i64, language: &str) -> MatchmakingStatusResponse {
        MatchmakingStatusResponse {
            status: "waiting".to_string(),
            game_id: None,
            language: Some(language.to_string()),
            opponent_name: None,
            opponent_level: None,
            player1_id: None,
            player2_id: None,
            your_player_id_in_game: Some(player_id),
        }
    }
}

/// Waiting players per language plus the per-player poll status cache.
/// Both maps sit behind their own mutex; operations are O(bucket).
#[derive(Default)]
pub struct MatchPool {
    waiting: std::sync::Mutex<IndexMap<String, Vec<(PoolPlayer, Instant)>>>,
    statuses: std::sync::Mutex<HashMap<i64, MatchmakingStatusResponse>>,
}

impl MatchPool {
    pub fn is_waiting(&self, player_id: i64) -> bool {
        self.waiting
            .lock()
            .unwrap()
            .values()
            .any(|bucket| bucket.iter().any(|(p, _)| p.id == player_id))
    }

    /// Adds a player to a language bucket. Idempotent over the player id
    /// across *all* buckets: a player can wait in one place only.
    pub fn enqueue(&self, player: PoolPlayer, language: &str) {
        if self.is_waiting(player.id) {
            tracing::warn!(player_id = player.id, "already queued, not adding again");
            return;
        }
        let mut waiting = self.waiting.lock().unwrap();
        let bucket = waiting.entry(language.to_string()).or_default();
        tracing::info!(
            player_id = player.id,
            username = %player.username,
            language,
            depth = bucket.len() + 1,
            "player queued"
        );
        bucket.push((player, Instant::now()));
    }

    pub fn dequeue(&self, player_id: i64) -> bool {
        let mut waiting = self.waiting.lock().unwrap();
        let mut removed = false;
        waiting.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|(p, _)| p.id != player_id);
            removed |= bucket.len() < before;
            !bucket.is_empty()
        });
        removed
    }

    /// Pops the two oldest entries of the first bucket with at least two
    /// waiters. FIFO within a bucket, bucket order is insertion order, so
    /// the result is deterministic for a given pool state.
    pub fn try_match(&self) -> Option<(PoolPlayer, PoolPlayer, String)> {
        let mut waiting = self.waiting.lock().unwrap();
        let language = waiting
            .iter()
            .find(|(_, bucket)| bucket.len() >= 2)
            .map(|(lang, _)| lang.clone())?;
        let bucket = waiting.get_mut(&language)?;
        let (p1, _) = bucket.remove(0);
        let (p2, _) = bucket.remove(0);
        if bucket.is_empty() {
            waiting.shift_remove(&language);
        }
        Some((p1, p2, language))
    }

    /// Pops, from every bucket holding exactly one sufficiently old entry,
    /// that lone waiter, to be paired with a bot.
    pub fn age_out(&self, grace: Duration) -> Vec<(PoolPlayer, String)> {
        let mut waiting = self.waiting.lock().unwrap();
        let mut aged = Vec::new();
        waiting.retain(|language, bucket| {
            if bucket.len() == 1 && bucket[0].1.elapsed() >= grace {
                let (player, _) = bucket.remove(0);
                aged.push((player, language.clone()));
                false
            } else {
                true
            }
        });
        aged
    }

    pub fn queue_depths(&self) -> HashMap<String, usize> {
        self.waiting
            .lock()
            .unwrap()
            .iter()
            .map(|(lang, bucket)| (lang.clone(), bucket.len()))
            .collect()
    }

    pub fn status(&self, player_id: i64) -> Option<MatchmakingStatusResponse> {
        self.statuses.lock().unwrap().get(&player_id).cloned()
    }

    pub fn set_status(&self, player_id: i64, status: MatchmakingStatusResponse) {
        self.statuses.lock().unwrap().insert(player_id, status);
    }

    pub fn clear_status(&self, player_id: i64) {
        self.statuses.lock().unwrap().remove(&player_id);
    }
}

pub fn new_game_id() -> String {
    format!("game_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Creates the session for two matched humans and caches a `matched` poll
/// status for both.
fn create_human_match(
    state: &AppState,
    player1: PoolPlayer,
    player2: PoolPlayer,
    language: &str,
) -> String {
    let game_id = new_game_id();
    tracing::info!(
        %game_id,
        language,
        p1 = %player1.username,
        p2 = %player2.username,
        "matched two players"
    );

    let session = GameSession::new(
        game_id.clone(),
        language.to_string(),
        PlayerState::new(player1.id, player1.username.clone(), player1.level, false),
        PlayerState::new(player2.id, player2.username.clone(), player2.level, false),
        false,
        &state.settings,
    );
    state.games.insert(GameHandle::new(session));

    for (me, other) in [(&player1, &player2), (&player2, &player1)] {
        state.matchmaking.set_status(
            me.id,
            MatchmakingStatusResponse {
                status: "matched".to_string(),
                game_id: Some(game_id.clone()),
                language: Some(language.to_string()),
                opponent_name: Some(other.username.clone()),
                opponent_level: Some(other.level),
                player1_id: Some(player1.id),
                player2_id: Some(player2.id),
                your_player_id_in_game: Some(me.id),
            },
        );
    }
    game_id
}

/// Pairs a lone waiter with the bot: the singleton bot user is cloned in
/// memory, renamed from the per-language list, levelled near the human, and
/// may even go first.
fn create_bot_match(
    state: &AppState,
    human: PoolPlayer,
    language: &str,
) -> Result<String, String> {
    let mut conn = state.db().map_err(|e| e.to_string())?;
    let bot_template =
        users::get_or_create_bot_user(&mut conn).map_err(|e| e.to_string())?;

    let mut rng = rand::rng();
    let bot_name = state
        .settings
        .bot_names_for(language)
        .choose(&mut rng)
        .cloned()
        .unwrap_or_else(|| "Bot".to_string());
    let bot_level = (human.level + rng.random_range(-5..=5)).max(1);

    let game_id = new_game_id();
    let human_state =
        PlayerState::new(human.id, human.username.clone(), human.level, false);
    let bot_state =
        PlayerState::new(bot_template.id, bot_name.clone(), bot_level, true);

    let mut order = [human_state, bot_state];
    order.shuffle(&mut rng);
    let [first, second] = order;

    tracing::info!(
        %game_id,
        language,
        human = %human.username,
        bot = %bot_name,
        bot_level,
        starter = first.id,
        "created bot match"
    );

    let session = GameSession::new(
        game_id.clone(),
        language.to_string(),
        first,
        second,
        true,
        &state.settings,
    );
    let (p1_id, p2_id) = (session.player_order[0], session.player_order[1]);
    state.games.insert(GameHandle::new(session));

    state.matchmaking.set_status(
        human.id,
        MatchmakingStatusResponse {
            status: "matched".to_string(),
            game_id: Some(game_id.clone()),
            language: Some(language.to_string()),
            opponent_name: Some(bot_name),
            opponent_level: Some(bot_level),
            player1_id: Some(p1_id),
            player2_id: Some(p2_id),
            your_player_id_in_game: Some(human.id),
        },
    );
    Ok(game_id)
}

/// Periodic sweep pairing long-waiting players with bots. Runs for the life
/// of the process.
pub async fn run_sweep(state: AppState) {
    let grace = Duration::from_secs(state.settings.matchmaking_bot_threshold_seconds);
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.settings.matchmaking_sweep_interval_seconds.max(1),
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        for (player, language) in state.matchmaking.age_out(grace) {
            if let Err(e) = create_bot_match(&state, player, &language) {
                tracing::error!(error = %e, "bot match creation failed");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FindQuery {
    pub requested_language: Option<String>,
}

/// `GET /matchmaking/find` — poll for a match, joining the pool on the first
/// call.
pub async fn find_match(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<FindQuery>,
    user: User,
) -> Json<MatchmakingStatusResponse> {
    let language = query
        .requested_language
        .unwrap_or_else(|| state.settings.default_language.clone())
        .to_lowercase();

    // A cached `matched` status stays valid only while the game itself is
    // alive.
    if let Some(cached) = state.matchmaking.status(user.id) {
        if cached.status == "matched" {
            let alive = cached
                .game_id
                .as_deref()
                .map(|gid| state.games.get(gid).is_some())
                .unwrap_or(false);
            if alive {
                return Json(cached);
            }
            tracing::warn!(user_id = user.id, "stale match status, clearing");
            state.matchmaking.clear_status(user.id);
        }
    }

    if !state.matchmaking.is_waiting(user.id) {
        state.matchmaking.enqueue(PoolPlayer::from(&user), &language);
        state
            .matchmaking
            .set_status(user.id, MatchmakingStatusResponse::waiting(user.id, &language));
    }

    if let Some((p1, p2, matched_language)) = state.matchmaking.try_match() {
        create_human_match(&state, p1, p2, &matched_language);
    }

    if state.matchmaking.is_waiting(user.id) {
        let waiting = MatchmakingStatusResponse::waiting(user.id, &language);
        state.matchmaking.set_status(user.id, waiting.clone());
        return Json(waiting);
    }

    match state.matchmaking.status(user.id) {
        Some(status) => Json(status),
        None => {
            tracing::error!(user_id = user.id, "no matchmaking status after find");
            Json(MatchmakingStatusResponse {
                status: "error".to_string(),
                game_id: None,
                language: None,
                opponent_name: None,
                opponent_level: None,
                player1_id: None,
                player2_id: None,
                your_player_id_in_game: None,
            })
        }
    }
}

/// `POST /matchmaking/cancel` — leave the pool.
pub async fn cancel_matchmaking(
    State(state): State<AppState>,
    user: User,
) -> Json<serde_json::Value> {
    state.matchmaking.dequeue(user.id);
    state.matchmaking.clear_status(user.id);
    tracing::info!(user_id = user.id, "matchmaking cancelled");
    Json(serde_json::json!({ "message": "Matchmaking cancelled" }))
}
