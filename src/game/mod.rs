pub mod bot;
pub mod engine;
pub mod scheduler;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::{Value, json};

use crate::{content::SentencePrompt, settings::Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Matched,
    WaitingForReady,
    InProgress,
    Finished,
    AbandonedByPlayer,
    ErrorContentLoad,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GameStatus::Finished
                | GameStatus::AbandonedByPlayer
                | GameStatus::ErrorContentLoad
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Matched => "matched",
            GameStatus::WaitingForReady => "waiting_for_ready",
            GameStatus::InProgress => "in_progress",
            GameStatus::Finished => "finished",
            GameStatus::AbandonedByPlayer => "abandoned_by_player",
            GameStatus::ErrorContentLoad => "error_content_load",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEndReason {
    RepeatedWordMaxMistakes,
    InvalidWordMaxMistakes,
    TimeoutMaxMistakes,
    DoubleTimeout,
    OpponentDisconnected,
    MaxRoundsReachedOrScoreLimit,
}

impl RoundEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundEndReason::RepeatedWordMaxMistakes => "repeated_word_max_mistakes",
            RoundEndReason::InvalidWordMaxMistakes => "invalid_word_max_mistakes",
            RoundEndReason::TimeoutMaxMistakes => "timeout_max_mistakes",
            RoundEndReason::DoubleTimeout => "double_timeout",
            RoundEndReason::OpponentDisconnected => "opponent_disconnected",
            RoundEndReason::MaxRoundsReachedOrScoreLimit => {
                "max_rounds_reached_or_score_limit"
            }
        }
    }
}

/// The closed set of things a client (or an injected timer / bot tick) can
/// do to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ClientReady,
    SubmitWord { word: String },
    Timeout,
    SendEmoji { emoji: String },
}

impl Action {
    /// Parses the wire form `{"action_type": ..., "payload": {...}}`.
    pub fn from_message(action_type: &str, payload: &Value) -> Result<Action, String> {
        match action_type {
            "client_ready" => Ok(Action::ClientReady),
            "submit_word" => {
                let word = payload
                    .get("word")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Action::SubmitWord { word })
            }
            "timeout" => Ok(Action::Timeout),
            "send_emoji" => match payload.get("emoji").and_then(Value::as_str) {
                Some(emoji) if !emoji.is_empty() => Ok(Action::SendEmoji {
                    emoji: emoji.to_string(),
                }),
                _ => Err("Emoji missing from send_emoji payload.".to_string()),
            },
            other => Err(format!("Unknown action type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerState {
    pub id: i64,
    pub name: String,
    pub score: i64,
    pub mistakes_in_current_round: i64,
    pub words_played: Vec<String>,
    pub level: i64,
    pub is_bot: bool,
}

impl PlayerState {
    pub fn new(id: i64, name: String, level: i64, is_bot: bool) -> PlayerState {
        PlayerState {
            id,
            name,
            score: 0,
            mistakes_in_current_round: 0,
            words_played: Vec::new(),
            level: level.max(1),
            is_bot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Player(i64),
    Broadcast,
    BroadcastExcept(i64),
}

/// One outbound message produced by a transition. The connection manager
/// owns routing; the engine only says who should see it.
#[derive(Debug, Clone)]
pub struct GameEvent {
    pub event_type: &'static str,
    pub payload: Value,
    pub target: EventTarget,
}

impl GameEvent {
    pub fn to_player(event_type: &'static str, player_id: i64, payload: Value) -> GameEvent {
        GameEvent {
            event_type,
            payload,
            target: EventTarget::Player(player_id),
        }
    }

    pub fn broadcast(event_type: &'static str, payload: Value) -> GameEvent {
        GameEvent {
            event_type,
            payload,
            target: EventTarget::Broadcast,
        }
    }

    pub fn error_to(player_id: i64, message: impl Into<String>) -> GameEvent {
        GameEvent::to_player(
            "error_message_to_player",
            player_id,
            json!({ "message": message.into() }),
        )
    }

    pub fn error_broadcast(message: impl Into<String>) -> GameEvent {
        GameEvent::broadcast(
            "error_message_broadcast",
            json!({ "message": message.into() }),
        )
    }

    /// The wire shape: `{"type": ..., "payload": {...}}`.
    pub fn to_wire(&self) -> Value {
        json!({ "type": self.event_type, "payload": self.payload })
    }
}

/// Authoritative state of one session. All mutation happens under the
/// session lock in [`GameHandle`].
#[derive(Debug)]
pub struct GameSession {
    pub game_id: String,
    pub db_game_id: Option<i64>,
    pub language: String,
    pub players: HashMap<i64, PlayerState>,
    pub player_order: [i64; 2],
    pub current_player_id: Option<i64>,
    pub current_round: i64,
    pub max_rounds: i64,
    pub max_mistakes: i64,
    pub prompt: Option<SentencePrompt>,
    /// Lowercased words accepted or burned this round; insertion-ordered and
    /// duplicate-free. Membership here makes any resubmission a mistake.
    pub words_played_this_round_all: Vec<String>,
    pub consecutive_timeouts: i64,
    pub ready_player_ids: std::collections::HashSet<i64>,
    pub turn_duration: Duration,
    pub turn_started_at: Option<Instant>,
    pub turn_deadline_at: Option<Instant>,
    pub last_action_timestamp: f64,
    pub winner_user_id: Option<i64>,
    pub status: GameStatus,
    pub is_bot_game: bool,
}

pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl GameSession {
    pub fn new(
        game_id: String,
        language: String,
        player1: PlayerState,
        player2: PlayerState,
        is_bot_game: bool,
        settings: &Settings,
    ) -> GameSession {
        let player_order = [player1.id, player2.id];
        let players =
            HashMap::from([(player1.id, player1), (player2.id, player2)]);
        GameSession {
            game_id,
            db_game_id: None,
            language,
            players,
            player_order,
            current_player_id: None,
            current_round: 1,
            max_rounds: settings.game_max_rounds,
            max_mistakes: settings.max_mistakes,
            prompt: None,
            words_played_this_round_all: Vec::new(),
            consecutive_timeouts: 0,
            ready_player_ids: std::collections::HashSet::new(),
            turn_duration: settings.turn_duration(),
            turn_started_at: None,
            turn_deadline_at: None,
            last_action_timestamp: unix_now(),
            winner_user_id: None,
            status: GameStatus::Matched,
            is_bot_game,
        }
    }

    pub fn opponent_of(&self, player_id: i64) -> i64 {
        if player_id == self.player_order[0] {
            self.player_order[1]
        } else {
            self.player_order[0]
        }
    }

    pub fn is_participant(&self, player_id: i64) -> bool {
        self.player_order.contains(&player_id)
    }

    /// Odd rounds start with the first player from the matchmaking order,
    /// even rounds with the second.
    pub fn starter_for_round(&self, round: i64) -> i64 {
        if round % 2 == 1 {
            self.player_order[0]
        } else {
            self.player_order[1]
        }
    }

    pub fn required_ready_count(&self) -> usize {
        if self.is_bot_game { 1 } else { 2 }
    }

    pub fn current_player_is_bot(&self) -> bool {
        self.current_player_id
            .and_then(|id| self.players.get(&id))
            .map(|p| p.is_bot)
            .unwrap_or(false)
    }

    fn player_json(&self, player_id: i64) -> Value {
        self.players
            .get(&player_id)
            .map(|p| serde_json::to_value(p).unwrap_or(Value::Null))
            .unwrap_or(Value::Null)
    }

    /// Full-state payload, shared between `game_setup_ready` and
    /// `game_state_reconnect`.
    pub fn snapshot_payload(&self) -> Value {
        let [p1, p2] = self.player_order;
        let (sentence, prompt_text, target_word) = match &self.prompt {
            Some(p) => (
                p.sentence_text.as_str(),
                p.prompt_text.as_str(),
                p.target_word.as_str(),
            ),
            None => ("N/A", "N/A", "N/A"),
        };

        json!({
            "game_id": self.game_id,
            "game_language": self.language,
            "current_sentence": sentence,
            "prompt": prompt_text,
            "word_to_replace": target_word,
            "round": self.current_round,
            "player1_server_id": p1.to_string(),
            "player2_server_id": p2.to_string(),
            "player1_state": self.player_json(p1),
            "player2_state": self.player_json(p2),
            "current_player_id": self.current_player_id.map(|id| id.to_string()),
            "game_active": self.status == GameStatus::InProgress,
            "game_status": self.status.as_str(),
            "max_rounds": self.max_rounds,
            "turn_duration_seconds": self.turn_duration.as_secs(),
            "last_action_timestamp": self.last_action_timestamp,
        })
    }
}

/// One live session plus its timer slot. The `session` mutex is the
/// single-writer discipline: socket actions, timer callbacks, bot moves and
/// disconnects all serialize on it, and it is held across oracle/DB awaits
/// so event order per session is total.
pub struct GameHandle {
    pub game_id: String,
    pub session: tokio::sync::Mutex<GameSession>,
    pub timer: std::sync::Mutex<TimerSlot>,
}

/// At most one armed turn timer per game. The epoch lets a fired callback
/// detect that it was superseded while it slept.
#[derive(Default)]
pub struct TimerSlot {
    pub epoch: u64,
    pub abort: Option<tokio::task::AbortHandle>,
}

impl GameHandle {
    pub fn new(session: GameSession) -> Arc<GameHandle> {
        Arc::new(GameHandle {
            game_id: session.game_id.clone(),
            session: tokio::sync::Mutex::new(session),
            timer: std::sync::Mutex::new(TimerSlot::default()),
        })
    }
}

/// Process-wide registry of live sessions.
#[derive(Default)]
pub struct ActiveGames {
    inner: std::sync::Mutex<HashMap<String, Arc<GameHandle>>>,
}

impl ActiveGames {
    pub fn insert(&self, handle: Arc<GameHandle>) {
        self.inner
            .lock()
            .unwrap()
            .insert(handle.game_id.clone(), handle);
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<GameHandle>> {
        self.inner.lock().unwrap().get(game_id).cloned()
    }

    pub fn remove(&self, game_id: &str) -> Option<Arc<GameHandle>> {
        self.inner.lock().unwrap().remove(game_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
