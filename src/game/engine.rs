//! Session state machine. Every function here runs under the session lock;
//! each takes the authoritative [`GameSession`], mutates it, and returns the
//! events the connection manager should fan out.
//!
//! Persistence is best-effort throughout: a failed write is logged and the
//! in-memory game carries on.

use diesel::{QueryResult, SqliteConnection};
use serde_json::json;

use crate::{
    content::{self, NewWordSubmission},
    game::{
        Action, EventTarget, GameEvent, GameSession, GameStatus, RoundEndReason,
        unix_now,
    },
    settings::Settings,
    users,
    validator::{JudgeRequest, ValidationOracle},
};

pub struct EngineCtx<'a> {
    pub conn: &'a mut SqliteConnection,
    pub oracle: &'a ValidationOracle,
    pub settings: &'a Settings,
}

fn best_effort(what: &str, game_id: &str, result: QueryResult<()>) {
    if let Err(e) = result {
        tracing::error!(game_id, error = %e, "persistence failed ({what}); game continues");
    }
}

fn grant_xp(ctx: &mut EngineCtx, game_id: &str, user_id: i64, amount: i64) {
    best_effort(
        "xp grant",
        game_id,
        users::add_experience(ctx.conn, ctx.settings, user_id, amount),
    );
}

/// First entry once the connection manager has seen every required player:
/// loads the round-1 prompt, creates the persisted game record, and gates
/// the session on `client_ready`.
pub fn initialize_game(session: &mut GameSession, ctx: &mut EngineCtx) -> Vec<GameEvent> {
    let mut events = Vec::new();
    if session.status != GameStatus::Matched {
        return events;
    }

    let prompt = match content::random_prompt(ctx.conn, &session.language) {
        Ok(Some(prompt)) => prompt,
        Ok(None) => {
            tracing::error!(
                game_id = %session.game_id,
                language = %session.language,
                "no prompts available; game cannot start"
            );
            session.status = GameStatus::ErrorContentLoad;
            events.push(GameEvent::error_broadcast(format!(
                "Failed to load game content for language '{}'. Game cannot start.",
                session.language
            )));
            return events;
        }
        Err(e) => {
            tracing::error!(game_id = %session.game_id, error = %e, "prompt fetch failed");
            session.status = GameStatus::ErrorContentLoad;
            events.push(GameEvent::error_broadcast(
                "Failed to load game content. Game cannot start.".to_string(),
            ));
            return events;
        }
    };

    let [p1, p2] = session.player_order;
    match content::create_game(ctx.conn, &session.game_id, p1, p2, &session.language) {
        Ok(db_id) => session.db_game_id = Some(db_id),
        Err(e) => {
            // The session stays playable; it just will not be logged.
            tracing::error!(game_id = %session.game_id, error = %e, "creating game record failed");
        }
    }

    session.prompt = Some(prompt);
    session.current_round = 1;
    session.current_player_id = Some(p1);
    session.words_played_this_round_all.clear();
    session.consecutive_timeouts = 0;
    session.ready_player_ids.clear();
    session.last_action_timestamp = unix_now();
    session.status = GameStatus::WaitingForReady;

    events.push(GameEvent::broadcast(
        "game_setup_ready",
        session.snapshot_payload(),
    ));
    events
}

pub async fn handle_action(
    session: &mut GameSession,
    acting_player_id: i64,
    action: Action,
    ctx: &mut EngineCtx<'_>,
) -> Vec<GameEvent> {
    match action {
        Action::ClientReady => handle_client_ready(session, acting_player_id),
        Action::SubmitWord { word } => {
            handle_submit_word(session, acting_player_id, &word, ctx).await
        }
        Action::Timeout => handle_timeout(session, acting_player_id, ctx),
        Action::SendEmoji { emoji } => {
            handle_send_emoji(session, acting_player_id, &emoji, ctx)
        }
    }
}

fn handle_client_ready(session: &mut GameSession, acting_player_id: i64) -> Vec<GameEvent> {
    let mut events = Vec::new();

    if session.status != GameStatus::WaitingForReady {
        events.push(GameEvent::error_to(
            acting_player_id,
            format!("Cannot ready up while game is {}.", session.status.as_str()),
        ));
        return events;
    }

    session.ready_player_ids.insert(acting_player_id);
    if session.ready_player_ids.len() < session.required_ready_count() {
        return events;
    }

    let starter = session.starter_for_round(session.current_round);
    session.current_player_id = Some(starter);
    session.status = GameStatus::InProgress;
    session.last_action_timestamp = unix_now();
    session.turn_started_at = Some(std::time::Instant::now());
    session.turn_deadline_at =
        Some(std::time::Instant::now() + session.turn_duration);

    tracing::info!(
        game_id = %session.game_id,
        round = session.current_round,
        starter,
        "round started"
    );
    events.push(GameEvent::broadcast(
        "round_started",
        json!({
            "round": session.current_round,
            "current_player_id": starter.to_string(),
            "last_action_timestamp": session.last_action_timestamp,
            "turn_duration_seconds": session.turn_duration.as_secs(),
        }),
    ));
    events
}

async fn handle_submit_word(
    session: &mut GameSession,
    acting_player_id: i64,
    raw_word: &str,
    ctx: &mut EngineCtx<'_>,
) -> Vec<GameEvent> {
    let mut events = Vec::new();

    if session.status != GameStatus::InProgress {
        events.push(GameEvent::error_to(acting_player_id, "Game not active."));
        return events;
    }
    if session.current_player_id != Some(acting_player_id) {
        events.push(GameEvent::error_to(acting_player_id, "Not your turn."));
        return events;
    }

    let word_original = raw_word.trim().to_string();
    let word = word_original.to_lowercase();
    let time_taken_ms = session
        .turn_started_at
        .map(|t| t.elapsed().as_millis() as i64);
    session.last_action_timestamp = unix_now();

    if word.is_empty() {
        log_submission(session, ctx, acting_player_id, &word, time_taken_ms, false, None, None);
        events.push(GameEvent::to_player(
            "validation_result",
            acting_player_id,
            json!({ "word": word, "is_valid": false, "message": "Word cannot be empty." }),
        ));
        return events;
    }

    // Repeats are mistakes, not no-ops (and remain so on every retry).
    if session.words_played_this_round_all.contains(&word) {
        let mistakes = add_mistake(session, acting_player_id);
        session.consecutive_timeouts = 0;
        log_submission(session, ctx, acting_player_id, &word, time_taken_ms, false, None, None);
        tracing::warn!(
            game_id = %session.game_id,
            player = acting_player_id,
            %word,
            mistakes,
            "repeated word"
        );
        events.push(GameEvent::to_player(
            "validation_result",
            acting_player_id,
            json!({ "word": word, "is_valid": false, "message": "Word already played. Mistake!" }),
        ));
        if mistakes >= session.max_mistakes {
            events.extend(end_round(
                session,
                ctx,
                Some(acting_player_id),
                RoundEndReason::RepeatedWordMaxMistakes,
            ));
        }
        return events;
    }

    let prompt = match &session.prompt {
        Some(p) => p.clone(),
        None => {
            events.push(GameEvent::error_to(acting_player_id, "No active prompt."));
            return events;
        }
    };

    let validation = match ctx
        .oracle
        .validate(
            ctx.conn,
            prompt.id,
            JudgeRequest {
                word: &word,
                target_word: &prompt.target_word,
                prompt_text: &prompt.prompt_text,
                sentence_text: &prompt.sentence_text,
                language: &session.language,
            },
        )
        .await
    {
        Ok(validation) => validation,
        Err(e) => {
            // Oracle trouble degrades to an ordinary invalid submission so
            // the turn ends the same way as any other mistake.
            tracing::error!(game_id = %session.game_id, error = %e, "oracle unavailable");
            crate::validator::Validation {
                is_valid: false,
                creativity_score: 0,
                reason: "Validator unavailable".to_string(),
                from_cache: false,
                latency_ms: 0,
            }
        }
    };

    if !validation.from_cache {
        log_submission(
            session,
            ctx,
            acting_player_id,
            &word,
            time_taken_ms,
            validation.is_valid,
            Some(validation.creativity_score),
            Some(validation.latency_ms),
        );
    }

    session.consecutive_timeouts = 0;

    if validation.is_valid {
        if let Some(player) = session.players.get(&acting_player_id) {
            if !player.is_bot {
                best_effort(
                    "words_count",
                    &session.game_id,
                    users::increment_words_count(ctx.conn, acting_player_id),
                );
            }
        }

        if let Some(player) = session.players.get_mut(&acting_player_id) {
            player.words_played.push(word_original.clone());
        }
        session.words_played_this_round_all.push(word.clone());

        events.push(GameEvent::to_player(
            "validation_result",
            acting_player_id,
            json!({
                "word": word_original,
                "is_valid": true,
                "creativity_score": validation.creativity_score,
            }),
        ));

        let next_player_id = session.opponent_of(acting_player_id);
        session.current_player_id = Some(next_player_id);
        session.turn_started_at = Some(std::time::Instant::now());
        session.turn_deadline_at =
            Some(std::time::Instant::now() + session.turn_duration);

        events.push(GameEvent::to_player(
            "opponent_turn_ended",
            next_player_id,
            json!({
                "opponent_player_id": acting_player_id.to_string(),
                "opponent_played_word": word_original,
                "creativity_score": validation.creativity_score,
                "current_player_id": next_player_id.to_string(),
                "game_id": session.game_id,
                "game_active": true,
                "last_action_timestamp": session.last_action_timestamp,
            }),
        ));
        tracing::debug!(
            game_id = %session.game_id,
            player = acting_player_id,
            %word,
            creativity = validation.creativity_score,
            "valid word, turn rotated"
        );
    } else {
        let mistakes = add_mistake(session, acting_player_id);
        let other_player_id = session.opponent_of(acting_player_id);

        events.push(GameEvent::to_player(
            "validation_result",
            acting_player_id,
            json!({
                "word": word,
                "is_valid": false,
                "message": if validation.reason.is_empty() {
                    "Not valid. Mistake!".to_string()
                } else {
                    validation.reason.clone()
                },
            }),
        ));
        events.push(GameEvent::to_player(
            "opponent_mistake",
            other_player_id,
            json!({ "player_id": acting_player_id.to_string(), "mistakes": mistakes }),
        ));
        tracing::debug!(
            game_id = %session.game_id,
            player = acting_player_id,
            %word,
            mistakes,
            "invalid word"
        );

        if mistakes >= session.max_mistakes {
            events.extend(end_round(
                session,
                ctx,
                Some(acting_player_id),
                RoundEndReason::InvalidWordMaxMistakes,
            ));
        }
    }

    events
}

fn handle_timeout(
    session: &mut GameSession,
    acting_player_id: i64,
    ctx: &mut EngineCtx,
) -> Vec<GameEvent> {
    let mut events = Vec::new();

    if session.status != GameStatus::InProgress
        || session.current_player_id != Some(acting_player_id)
    {
        events.push(GameEvent::error_to(acting_player_id, "Not your turn."));
        return events;
    }

    session.consecutive_timeouts += 1;
    let mistakes = add_mistake(session, acting_player_id);
    session.last_action_timestamp = unix_now();
    tracing::info!(
        game_id = %session.game_id,
        player = acting_player_id,
        mistakes,
        consecutive = session.consecutive_timeouts,
        "turn timed out"
    );

    if session.consecutive_timeouts >= 2 {
        // Both players let the clock run out in a row; the one with fewer
        // accepted words this round loses, ties are a draw.
        let [p1, p2] = session.player_order;
        let p1_words = session.players[&p1].words_played.len();
        let p2_words = session.players[&p2].words_played.len();
        let loser = match p1_words.cmp(&p2_words) {
            std::cmp::Ordering::Greater => Some(p2),
            std::cmp::Ordering::Less => Some(p1),
            std::cmp::Ordering::Equal => None,
        };
        events.extend(end_round(session, ctx, loser, RoundEndReason::DoubleTimeout));
        return events;
    }

    if mistakes >= session.max_mistakes {
        events.extend(end_round(
            session,
            ctx,
            Some(acting_player_id),
            RoundEndReason::TimeoutMaxMistakes,
        ));
        return events;
    }

    let next_player_id = session.opponent_of(acting_player_id);
    session.current_player_id = Some(next_player_id);
    session.turn_started_at = Some(std::time::Instant::now());
    session.turn_deadline_at = Some(std::time::Instant::now() + session.turn_duration);

    events.push(GameEvent::broadcast(
        "timeout",
        json!({
            "player_id": acting_player_id.to_string(),
            "current_player_id": next_player_id.to_string(),
            "last_action_timestamp": session.last_action_timestamp,
        }),
    ));
    events
}

fn handle_send_emoji(
    session: &mut GameSession,
    acting_player_id: i64,
    emoji: &str,
    ctx: &mut EngineCtx,
) -> Vec<GameEvent> {
    let mut events = Vec::new();

    if session.status.is_terminal() {
        events.push(GameEvent::error_to(acting_player_id, "Game already over."));
        return events;
    }

    let opponent = session.opponent_of(acting_player_id);
    events.push(GameEvent::to_player(
        "emoji_broadcast",
        opponent,
        json!({ "sender_id": acting_player_id.to_string(), "emoji": emoji }),
    ));

    if let Some(db_game_id) = session.db_game_id {
        best_effort(
            "emoji counter",
            &session.game_id,
            content::increment_emojis(ctx.conn, db_game_id, acting_player_id),
        );
    }
    events
}

fn add_mistake(session: &mut GameSession, player_id: i64) -> i64 {
    match session.players.get_mut(&player_id) {
        Some(player) => {
            player.mistakes_in_current_round += 1;
            player.mistakes_in_current_round
        }
        None => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn log_submission(
    session: &GameSession,
    ctx: &mut EngineCtx,
    user_id: i64,
    word_lower: &str,
    time_taken_ms: Option<i64>,
    is_valid: bool,
    creativity_score: Option<i64>,
    validation_latency_ms: Option<i64>,
) {
    let (Some(db_game_id), Some(prompt)) = (session.db_game_id, &session.prompt) else {
        return;
    };
    best_effort(
        "submission log",
        &session.game_id,
        content::log_submission(
            ctx.conn,
            NewWordSubmission {
                game_id: db_game_id,
                round_number: session.current_round,
                user_id,
                sentence_prompt_id: prompt.id,
                submitted_word: word_lower.to_string(),
                time_taken_ms,
                is_valid,
                creativity_score,
                validation_latency_ms,
                submission_timestamp: chrono::Utc::now().naive_utc(),
            },
        ),
    );
}

/// Closes the current round: scores and XP, then either the game-over
/// transition or the next round's setup.
fn end_round(
    session: &mut GameSession,
    ctx: &mut EngineCtx,
    round_loser_id: Option<i64>,
    reason: RoundEndReason,
) -> Vec<GameEvent> {
    let mut events = Vec::new();
    session.consecutive_timeouts = 0;
    let game_id = session.game_id.clone();

    let [p1, p2] = session.player_order;
    let round_winner_id = round_loser_id.map(|loser| session.opponent_of(loser));

    let (xp_win, xp_loss, xp_draw) = (
        ctx.settings.xp_for_round_win,
        ctx.settings.xp_for_round_loss,
        ctx.settings.xp_for_round_draw,
    );
    match round_winner_id {
        Some(winner) => {
            if let Some(player) = session.players.get_mut(&winner) {
                player.score += 1;
            }
            grant_xp(ctx, &game_id, winner, xp_win);
            if let Some(loser) = round_loser_id {
                grant_xp(ctx, &game_id, loser, xp_loss);
            }
        }
        None => {
            grant_xp(ctx, &game_id, p1, xp_draw);
            grant_xp(ctx, &game_id, p2, xp_draw);
        }
    }

    let p1_score = session.players[&p1].score;
    let p2_score = session.players[&p2].score;
    if let Some(db_game_id) = session.db_game_id {
        best_effort(
            "score update",
            &session.game_id,
            content::update_score(ctx.conn, db_game_id, p1, p1_score),
        );
        best_effort(
            "score update",
            &session.game_id,
            content::update_score(ctx.conn, db_game_id, p2, p2_score),
        );
    }

    tracing::info!(
        game_id = %session.game_id,
        round = session.current_round,
        winner = ?round_winner_id,
        reason = reason.as_str(),
        score = format!("{p1_score}-{p2_score}"),
        "round ended"
    );

    let rounds_needed_to_win = session.max_rounds / 2 + 1;
    let game_is_over = p1_score >= rounds_needed_to_win
        || p2_score >= rounds_needed_to_win
        || session.current_round >= session.max_rounds;

    if game_is_over {
        events.extend(finish_game(session, ctx, reason, p1_score, p2_score));
    } else {
        events.extend(start_next_round(session, ctx, round_winner_id, reason));
    }
    events
}

fn finish_game(
    session: &mut GameSession,
    ctx: &mut EngineCtx,
    reason: RoundEndReason,
    p1_score: i64,
    p2_score: i64,
) -> Vec<GameEvent> {
    let mut events = Vec::new();
    let [p1, p2] = session.player_order;
    let game_id = session.game_id.clone();

    let final_winner_id = match p1_score.cmp(&p2_score) {
        std::cmp::Ordering::Greater => Some(p1),
        std::cmp::Ordering::Less => Some(p2),
        std::cmp::Ordering::Equal => None,
    };

    let (xp_win, xp_loss, xp_draw) = (
        ctx.settings.xp_for_game_win,
        ctx.settings.xp_for_game_loss,
        ctx.settings.xp_for_game_draw,
    );
    match final_winner_id {
        Some(winner) => {
            grant_xp(ctx, &game_id, winner, xp_win);
            let loser = session.opponent_of(winner);
            grant_xp(ctx, &game_id, loser, xp_loss);
        }
        None => {
            grant_xp(ctx, &game_id, p1, xp_draw);
            grant_xp(ctx, &game_id, p2, xp_draw);
        }
    }

    session.status = GameStatus::Finished;
    session.winner_user_id = final_winner_id;
    session.current_player_id = None;
    session.turn_started_at = None;
    session.turn_deadline_at = None;

    let game_over_reason = match reason {
        RoundEndReason::DoubleTimeout | RoundEndReason::OpponentDisconnected => reason,
        _ => RoundEndReason::MaxRoundsReachedOrScoreLimit,
    };

    if let Some(db_game_id) = session.db_game_id {
        best_effort(
            "finalize game",
            &session.game_id,
            content::finalize_game(
                ctx.conn,
                db_game_id,
                final_winner_id,
                "finished",
                game_over_reason.as_str(),
            ),
        );
    }

    tracing::info!(
        game_id = %session.game_id,
        winner = ?final_winner_id,
        score = format!("{p1_score}-{p2_score}"),
        "game over"
    );
    events.push(GameEvent::broadcast(
        "game_over",
        json!({
            "game_winner_id": final_winner_id.map(|id| id.to_string()),
            "player1_server_id": p1.to_string(),
            "player2_server_id": p2.to_string(),
            "player1_final_score": p1_score,
            "player2_final_score": p2_score,
            "reason": game_over_reason.as_str(),
        }),
    ));
    events
}

fn start_next_round(
    session: &mut GameSession,
    ctx: &mut EngineCtx,
    previous_round_winner_id: Option<i64>,
    previous_round_end_reason: RoundEndReason,
) -> Vec<GameEvent> {
    let mut events = Vec::new();
    session.current_round += 1;

    let prompt = match content::random_prompt(ctx.conn, &session.language) {
        Ok(Some(prompt)) => prompt,
        Ok(None) | Err(_) => {
            tracing::error!(
                game_id = %session.game_id,
                language = %session.language,
                "no prompt for new round"
            );
            session.status = GameStatus::ErrorContentLoad;
            events.push(GameEvent::error_broadcast(format!(
                "Failed to load game content for language '{}' for the new round.",
                session.language
            )));
            return events;
        }
    };
    session.prompt = Some(prompt);

    for player in session.players.values_mut() {
        player.mistakes_in_current_round = 0;
        player.words_played.clear();
    }
    session.words_played_this_round_all.clear();
    session.ready_player_ids.clear();

    let starter = session.starter_for_round(session.current_round);
    session.current_player_id = Some(starter);
    session.status = GameStatus::WaitingForReady;
    session.turn_started_at = None;
    session.turn_deadline_at = None;
    session.last_action_timestamp = unix_now();

    let [p1, p2] = session.player_order;
    let prompt = session.prompt.as_ref().expect("prompt just set");
    events.push(GameEvent::broadcast(
        "new_round_started",
        json!({
            "new_round_number": session.current_round,
            "round_winner_id": previous_round_winner_id.map(|id| id.to_string()),
            "previous_round_end_reason": previous_round_end_reason.as_str(),
            "player1_server_id": p1.to_string(),
            "player2_server_id": p2.to_string(),
            "player1_state": session.players.get(&p1),
            "player2_state": session.players.get(&p2),
            "current_sentence": prompt.sentence_text,
            "prompt": prompt.prompt_text,
            "word_to_replace": prompt.target_word,
            "current_player_id": starter.to_string(),
            "game_status": session.status.as_str(),
            "last_action_timestamp": session.last_action_timestamp,
        }),
    ));
    events
}

/// A participant's socket closed while the game was live: the remaining
/// player wins by forfeit. Terminal sessions ignore the close.
pub fn handle_disconnect(
    session: &mut GameSession,
    disconnected_player_id: i64,
    ctx: &mut EngineCtx,
) -> Vec<GameEvent> {
    let mut events = Vec::new();

    if session.status.is_terminal() {
        return events;
    }

    let game_id = session.game_id.clone();
    let forfeit_winner_id = session.opponent_of(disconnected_player_id);
    tracing::info!(
        game_id = %session.game_id,
        disconnected = disconnected_player_id,
        winner = forfeit_winner_id,
        "player disconnected mid-game; forfeit"
    );

    let xp_forfeit = ctx.settings.xp_for_game_win_by_forfeit;
    grant_xp(ctx, &game_id, forfeit_winner_id, xp_forfeit);

    session.status = GameStatus::AbandonedByPlayer;
    session.winner_user_id = Some(forfeit_winner_id);
    session.current_player_id = None;
    session.turn_started_at = None;
    session.turn_deadline_at = None;

    if let Some(db_game_id) = session.db_game_id {
        best_effort(
            "finalize game",
            &session.game_id,
            content::finalize_game(
                ctx.conn,
                db_game_id,
                Some(forfeit_winner_id),
                "abandoned_by_player",
                RoundEndReason::OpponentDisconnected.as_str(),
            ),
        );
    }

    let [p1, p2] = session.player_order;
    events.push(GameEvent::to_player(
        "player_disconnected_inform",
        forfeit_winner_id,
        json!({
            "player_id": disconnected_player_id.to_string(),
            "message": "Opponent disconnected. You win by forfeit.",
            "game_winner_id": forfeit_winner_id.to_string(),
        }),
    ));
    events.push(GameEvent {
        event_type: "game_over",
        payload: json!({
            "game_winner_id": forfeit_winner_id.to_string(),
            "player1_server_id": p1.to_string(),
            "player2_server_id": p2.to_string(),
            "player1_final_score": session.players[&p1].score,
            "player2_final_score": session.players[&p2].score,
            "reason": RoundEndReason::OpponentDisconnected.as_str(),
        }),
        target: EventTarget::Player(forfeit_winner_id),
    });

    events
}
