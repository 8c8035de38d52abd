//! Turn scheduling: one cancellable timer per game (human turns) or one
//! "bot thinking" task (bot turns). Cancellation is epoch-based: arming
//! bumps the epoch and aborts the previous task, and a task that still fires
//! re-checks the epoch under the session lock, so a superseded timer can
//! never act.

use std::{sync::Arc, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    game::{
        Action, GameHandle, GameSession, GameStatus,
        bot::{self, BotContext, BotMove},
        engine::{self, EngineCtx},
    },
    state::AppState,
};

/// Cancels whatever task is armed for this game. Safe to call with the
/// session lock held; cancelling an already-fired task is a no-op.
pub fn cancel(handle: &GameHandle) {
    let mut slot = handle.timer.lock().unwrap();
    slot.epoch += 1;
    if let Some(abort) = slot.abort.take() {
        abort.abort();
    }
}

/// Re-arms scheduling for a session after a transition. Call with the
/// session lock held so the status/turn snapshot cannot race.
pub fn reschedule(state: &AppState, handle: &Arc<GameHandle>, session: &GameSession) {
    if session.status != GameStatus::InProgress {
        cancel(handle);
        return;
    }
    if session.current_player_is_bot() {
        schedule_bot_turn(state, handle);
    } else {
        arm_turn_timer(state, handle, session);
    }
}

fn next_epoch(handle: &GameHandle) -> u64 {
    let mut slot = handle.timer.lock().unwrap();
    slot.epoch += 1;
    if let Some(abort) = slot.abort.take() {
        abort.abort();
    }
    slot.epoch
}

fn store_abort(handle: &GameHandle, epoch: u64, abort: tokio::task::AbortHandle) {
    let mut slot = handle.timer.lock().unwrap();
    // A later arm/cancel may have already moved on; if so this task is dead.
    if slot.epoch == epoch {
        slot.abort = Some(abort);
    } else {
        abort.abort();
    }
}

fn epoch_is_current(handle: &GameHandle, epoch: u64) -> bool {
    handle.timer.lock().unwrap().epoch == epoch
}

fn arm_turn_timer(state: &AppState, handle: &Arc<GameHandle>, session: &GameSession) {
    let Some(deadline) = session.turn_deadline_at else {
        return;
    };
    let epoch = next_epoch(handle);

    let state = state.clone();
    let handle2 = handle.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        fire_timeout(state, handle2, epoch).await;
    });
    store_abort(handle, epoch, task.abort_handle());
}

async fn fire_timeout(state: AppState, handle: Arc<GameHandle>, epoch: u64) {
    let mut session = handle.session.lock().await;
    if !epoch_is_current(&handle, epoch) {
        return;
    }
    if session.status != GameStatus::InProgress {
        return;
    }
    let Some(acting_player_id) = session.current_player_id else {
        return;
    };

    tracing::info!(
        game_id = %session.game_id,
        player = acting_player_id,
        "turn deadline reached, injecting timeout"
    );
    run_action(&state, &handle, &mut session, acting_player_id, Action::Timeout).await;
}

/// The delay before a bot's move lands: longer for more creative words,
/// with a little jitter, clamped so the bot never feels instant or stuck.
pub fn humanization_delay(bot_move: &BotMove, rng: &mut impl Rng) -> Duration {
    let seconds = match bot_move.word {
        Some(_) => {
            let base = 1.0 + ((bot_move.creativity - 1).max(0) as f64) * 0.75;
            (base + rng.random_range(-0.5..0.5)).clamp(0.5, 4.0)
        }
        // A bot that times out sits on its turn for a while first.
        None => rng.random_range(4.0..6.0),
    };
    Duration::from_secs_f64(seconds)
}

/// Arms the "bot thinking" task: pick a move, sleep the humanization delay,
/// then re-enter the engine as if the bot had sent the action itself.
pub fn schedule_bot_turn(state: &AppState, handle: &Arc<GameHandle>) {
    let epoch = next_epoch(handle);
    let state = state.clone();
    let handle2 = handle.clone();

    let task = tokio::spawn(async move {
        let snapshot = {
            let session = handle2.session.lock().await;
            if !epoch_is_current(&handle2, epoch)
                || session.status != GameStatus::InProgress
                || !session.current_player_is_bot()
            {
                None
            } else {
                session.current_player_id.zip(session.prompt.clone()).map(
                    |(bot_id, prompt)| {
                        let opponent = session.opponent_of(bot_id);
                        (
                            bot_id,
                            session.current_round,
                            BotContext {
                                opponent_level: session
                                    .players
                                    .get(&opponent)
                                    .map(|p| p.level)
                                    .unwrap_or(1),
                                language: session.language.clone(),
                                prompt,
                                words_played_this_round_all: session
                                    .words_played_this_round_all
                                    .clone(),
                            },
                        )
                    },
                )
            }
        };
        let Some((bot_id, round, bot_ctx)) = snapshot else {
            return;
        };

        let mut conn = match state.db() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "no DB connection for bot move");
                return;
            }
        };

        let mut rng = StdRng::from_os_rng();
        let bot_move = bot::choose_move(
            &bot_ctx,
            &mut conn,
            state.oracle.judge(),
            &state.settings,
            &mut rng,
        )
        .await;
        let delay = humanization_delay(&bot_move, &mut rng);
        tracing::debug!(
            game_id = %handle2.game_id,
            delay_ms = delay.as_millis() as u64,
            "bot thinking"
        );
        drop(conn);
        tokio::time::sleep(delay).await;

        let mut session = handle2.session.lock().await;
        // The game may have moved on while the bot was thinking.
        if !epoch_is_current(&handle2, epoch)
            || session.status != GameStatus::InProgress
            || session.current_player_id != Some(bot_id)
            || session.current_round != round
        {
            return;
        }

        let action = match bot_move.word {
            Some(word) => Action::SubmitWord { word },
            None => Action::Timeout,
        };
        run_action(&state, &handle2, &mut session, bot_id, action).await;
    });
    store_abort(handle, epoch, task.abort_handle());
}

/// Shared tail for scheduler-injected actions: run the transition, fan the
/// events out, re-arm. The caller holds the session lock.
async fn run_action(
    state: &AppState,
    handle: &Arc<GameHandle>,
    session: &mut GameSession,
    acting_player_id: i64,
    action: Action,
) {
    let mut conn = match state.db() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "no DB connection for scheduled action");
            return;
        }
    };
    let mut ctx = EngineCtx {
        conn: &mut conn,
        oracle: &state.oracle,
        settings: &state.settings,
    };
    let events =
        engine::handle_action(session, acting_player_id, action, &mut ctx).await;
    state.connections.fan_out(&session.game_id, &events);
    reschedule(state, handle, session);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanized_delay_stays_in_band() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        for creativity in 0..=5 {
            for _ in 0..50 {
                let d = humanization_delay(
                    &BotMove {
                        word: Some("hot".to_string()),
                        creativity,
                    },
                    &mut rng,
                );
                assert!(d >= Duration::from_secs_f64(0.5));
                assert!(d <= Duration::from_secs_f64(4.0));
            }
        }
        for _ in 0..50 {
            let d = humanization_delay(
                &BotMove {
                    word: None,
                    creativity: 0,
                },
                &mut rng,
            );
            assert!(d >= Duration::from_secs_f64(4.0));
            assert!(d < Duration::from_secs_f64(6.0));
        }
    }
}
