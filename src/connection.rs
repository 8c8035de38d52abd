//! Websocket connection manager: one registry entry per (game, player),
//! authentication at handshake, routing of inbound actions into the session
//! engine and fanout of the resulting events.

use std::collections::HashMap;

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::{
    auth::User,
    game::{
        Action, EventTarget, GameEvent, GameHandle, engine, engine::EngineCtx,
        scheduler,
    },
    state::AppState,
};

struct Outbound {
    serial: u64,
    tx: UnboundedSender<Message>,
}

/// Registry of open sockets by (game, player). Each socket owns an unbounded
/// channel drained by its writer task, so fanout never blocks and can run
/// while the session lock is held.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: std::sync::Mutex<HashMap<String, HashMap<i64, Outbound>>>,
    next_serial: std::sync::atomic::AtomicU64,
}

impl ConnectionRegistry {
    /// Registers a socket, closing any previous one for the same player.
    /// Returns the serial used to guard deregistration.
    pub fn register(
        &self,
        game_id: &str,
        player_id: i64,
        tx: UnboundedSender<Message>,
    ) -> u64 {
        let serial = self
            .next_serial
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        let per_game = inner.entry(game_id.to_string()).or_default();
        if let Some(old) = per_game.insert(player_id, Outbound { serial, tx }) {
            tracing::info!(game_id, player_id, "replacing existing connection");
            let _ = old.tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1001,
                reason: "Replaced by newer connection".into(),
            })));
        }
        serial
    }

    /// Removes the socket, but only if it is still the one identified by
    /// `serial` (a replacement connection must not be dropped by the loser's
    /// cleanup).
    pub fn deregister(&self, game_id: &str, player_id: i64, serial: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(per_game) = inner.get_mut(game_id) else {
            return false;
        };
        let removed = match per_game.get(&player_id) {
            Some(outbound) if outbound.serial == serial => {
                per_game.remove(&player_id);
                true
            }
            _ => false,
        };
        if per_game.is_empty() {
            inner.remove(game_id);
        }
        removed
    }

    pub fn connected_count(&self, game_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(game_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn send_to(&self, game_id: &str, player_id: i64, message: &Value) {
        let mut inner = self.inner.lock().unwrap();
        let Some(per_game) = inner.get_mut(game_id) else {
            return;
        };
        if let Some(outbound) = per_game.get(&player_id) {
            if outbound
                .tx
                .send(Message::Text(message.to_string()))
                .is_err()
            {
                tracing::warn!(game_id, player_id, "send failed, dropping socket");
                per_game.remove(&player_id);
            }
        }
    }

    /// Routes one transition's events. Events are delivered in the order
    /// produced.
    pub fn fan_out(&self, game_id: &str, events: &[GameEvent]) {
        for event in events {
            let wire = event.to_wire();
            match event.target {
                EventTarget::Player(player_id) => {
                    self.send_to(game_id, player_id, &wire)
                }
                EventTarget::Broadcast => {
                    for player_id in self.players_of(game_id) {
                        self.send_to(game_id, player_id, &wire);
                    }
                }
                EventTarget::BroadcastExcept(excluded) => {
                    for player_id in self.players_of(game_id) {
                        if player_id != excluded {
                            self.send_to(game_id, player_id, &wire);
                        }
                    }
                }
            }
        }
    }

    fn players_of(&self, game_id: &str) -> Vec<i64> {
        self.inner
            .lock()
            .unwrap()
            .get(game_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// `GET /ws/game/:game_id?token=...` — the game socket. Authentication and
/// membership are checked before the upgrade, so a bad handshake is refused
/// outright instead of accepted-then-closed.
pub async fn game_websocket(
    ws: WebSocketUpgrade,
    Path(game_id): Path<String>,
    State(state): State<AppState>,
    user: User,
) -> Response {
    let Some(handle) = state.games.get(&game_id) else {
        tracing::warn!(%game_id, user_id = user.id, "socket for unknown game");
        return (StatusCode::NOT_FOUND, "Game not found").into_response();
    };

    {
        let session = handle.session.lock().await;
        if !session.is_participant(user.id) {
            tracing::warn!(%game_id, user_id = user.id, "socket from non-participant");
            return (StatusCode::FORBIDDEN, "Player not in game").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(state, handle, user, socket))
}

async fn handle_socket(
    state: AppState,
    handle: std::sync::Arc<GameHandle>,
    user: User,
    socket: WebSocket,
) {
    let game_id = handle.game_id.clone();
    let player_id = user.id;
    tracing::info!(%game_id, player_id, "player connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if ws_sink.send(message).await.is_err() || is_close {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let serial = state.connections.register(&game_id, player_id, tx.clone());

    on_connected(&state, &handle, player_id, &tx).await;

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text_frame(&state, &handle, player_id, &text, &tx).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(%game_id, player_id, "player socket closed");
    let was_current = state.connections.deregister(&game_id, player_id, serial);
    writer.abort();

    // A socket replaced by a newer connection must not forfeit the game.
    if !was_current {
        return;
    }

    let mut session = handle.session.lock().await;
    if !session.status.is_terminal() {
        scheduler::cancel(&handle);
        match state.db() {
            Ok(mut conn) => {
                let mut ctx = EngineCtx {
                    conn: &mut conn,
                    oracle: &state.oracle,
                    settings: &state.settings,
                };
                let events = engine::handle_disconnect(&mut session, player_id, &mut ctx);
                state.connections.fan_out(&game_id, &events);
            }
            Err(e) => {
                tracing::error!(%game_id, error = %e, "no DB connection for disconnect");
            }
        }
    } else {
        scheduler::cancel(&handle);
    }

    if session.status.is_terminal() && state.connections.connected_count(&game_id) == 0 {
        let player_order = session.player_order;
        drop(session);
        if state.games.remove(&game_id).is_some() {
            for pid in player_order {
                state.matchmaking.clear_status(pid);
            }
            tracing::info!(%game_id, "session removed");
        }
    }
}

/// The connection-entry transition: initialize a `matched` session once all
/// required players are present, or catch a late/reconnecting socket up with
/// a full snapshot.
async fn on_connected(
    state: &AppState,
    handle: &std::sync::Arc<GameHandle>,
    player_id: i64,
    tx: &UnboundedSender<Message>,
) {
    use crate::game::GameStatus;

    let mut session = handle.session.lock().await;
    let game_id = session.game_id.clone();

    match session.status {
        GameStatus::Matched => {
            let required = if session.is_bot_game { 1 } else { 2 };
            if state.connections.connected_count(&game_id) >= required {
                match state.db() {
                    Ok(mut conn) => {
                        let mut ctx = EngineCtx {
                            conn: &mut conn,
                            oracle: &state.oracle,
                            settings: &state.settings,
                        };
                        let events = engine::initialize_game(&mut session, &mut ctx);
                        state.connections.fan_out(&game_id, &events);
                    }
                    Err(e) => {
                        tracing::error!(%game_id, error = %e, "no DB connection for init");
                    }
                }
            } else {
                let info = json!({
                    "type": "info_message_to_player",
                    "payload": { "message": "Waiting for opponent to connect..." },
                });
                let _ = tx.send(Message::Text(info.to_string()));
            }
        }
        GameStatus::WaitingForReady | GameStatus::InProgress => {
            tracing::debug!(%game_id, player_id, "sending reconnect snapshot");
            let snapshot = json!({
                "type": "game_state_reconnect",
                "payload": session.snapshot_payload(),
            });
            let _ = tx.send(Message::Text(snapshot.to_string()));
        }
        _ => {
            // Terminal: a late joiner still gets a final snapshot; the read
            // loop ends when the client hangs up.
            let snapshot = json!({
                "type": "game_state_reconnect",
                "payload": session.snapshot_payload(),
            });
            let _ = tx.send(Message::Text(snapshot.to_string()));
        }
    }
}

async fn handle_text_frame(
    state: &AppState,
    handle: &std::sync::Arc<GameHandle>,
    player_id: i64,
    text: &str,
    tx: &UnboundedSender<Message>,
) {
    let send_error = |message: String| {
        let error = json!({
            "type": "error_message_to_player",
            "payload": { "message": message },
        });
        let _ = tx.send(Message::Text(error.to_string()));
    };

    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            send_error("Invalid message: not a JSON object.".to_string());
            return;
        }
    };
    let Some(action_type) = parsed.get("action_type").and_then(Value::as_str) else {
        send_error("Invalid action format: 'action_type' missing.".to_string());
        return;
    };
    let payload = parsed.get("payload").cloned().unwrap_or(json!({}));

    let action = match Action::from_message(action_type, &payload) {
        Ok(action) => action,
        Err(message) => {
            send_error(message);
            return;
        }
    };

    let mut session = handle.session.lock().await;
    scheduler::cancel(handle);

    let mut conn = match state.db() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(game_id = %handle.game_id, error = %e, "no DB connection");
            send_error("Server error.".to_string());
            return;
        }
    };
    let mut ctx = EngineCtx {
        conn: &mut conn,
        oracle: &state.oracle,
        settings: &state.settings,
    };
    let events = engine::handle_action(&mut session, player_id, action, &mut ctx).await;
    state.connections.fan_out(&handle.game_id, &events);
    scheduler::reschedule(state, handle, &session);
}
