//! End-to-end exercises of the session state machine: full games, mistake
//! ladders, timeouts, forfeits, and the degradation path when the oracle is
//! down. Everything runs against an in-memory database and a stub judge.

use std::sync::Arc;

use diesel::SqliteConnection;

use crate::{
    auth::User,
    game::{
        Action, GameEvent, GameSession, GameStatus, PlayerState,
        engine::{self, EngineCtx},
    },
    settings::Settings,
    test_support::{StubJudge, insert_prompt, insert_user, test_conn},
    validator::ValidationOracle,
};

struct Rig {
    conn: SqliteConnection,
    oracle: ValidationOracle,
    settings: Settings,
    session: GameSession,
    alice: User,
    bob: User,
}

impl Rig {
    /// Two humans, one language, three prompts, session initialized and
    /// waiting for ready.
    fn new(judge: StubJudge) -> Rig {
        let mut conn = test_conn();
        let alice = insert_user(&mut conn, "alice", 3);
        let bob = insert_user(&mut conn, "bob", 4);
        insert_prompt(&mut conn, "en", "The fire was warm.", "warm", "Make it more extreme!");
        insert_prompt(&mut conn, "en", "The cat is quick.", "quick", "Use synonyms");
        insert_prompt(&mut conn, "en", "The soup was good.", "good", "Exaggerate!");

        let settings = Settings::default();
        let session = GameSession::new(
            "game_test".to_string(),
            "en".to_string(),
            PlayerState::new(alice.id, "alice".to_string(), alice.level, false),
            PlayerState::new(bob.id, "bob".to_string(), bob.level, false),
            false,
            &settings,
        );

        let mut rig = Rig {
            conn,
            oracle: ValidationOracle::new(Arc::new(judge)),
            settings,
            session,
            alice,
            bob,
        };
        let events = rig.initialize();
        assert!(has_event(&events, "game_setup_ready"));
        assert_eq!(rig.session.status, GameStatus::WaitingForReady);
        rig
    }

    fn initialize(&mut self) -> Vec<GameEvent> {
        engine::initialize_game(
            &mut self.session,
            &mut EngineCtx {
                conn: &mut self.conn,
                oracle: &self.oracle,
                settings: &self.settings,
            },
        )
    }

    async fn act(&mut self, player_id: i64, action: Action) -> Vec<GameEvent> {
        engine::handle_action(
            &mut self.session,
            player_id,
            action,
            &mut EngineCtx {
                conn: &mut self.conn,
                oracle: &self.oracle,
                settings: &self.settings,
            },
        )
        .await
    }

    async fn both_ready(&mut self) {
        self.act(self.alice.id, Action::ClientReady).await;
        let events = self.act(self.bob.id, Action::ClientReady).await;
        assert!(has_event(&events, "round_started"));
        assert_eq!(self.session.status, GameStatus::InProgress);
    }

    async fn submit(&mut self, player_id: i64, word: &str) -> Vec<GameEvent> {
        self.act(
            player_id,
            Action::SubmitWord {
                word: word.to_string(),
            },
        )
        .await
    }

    fn score_of(&self, player_id: i64) -> i64 {
        self.session.players[&player_id].score
    }

    fn assert_score_invariant(&self) {
        let total: i64 = self.session.players.values().map(|p| p.score).sum();
        assert!(
            total <= self.session.current_round,
            "scores {total} exceed rounds {}",
            self.session.current_round
        );
    }
}

fn has_event(events: &[GameEvent], event_type: &str) -> bool {
    events.iter().any(|e| e.event_type == event_type)
}

fn find_event<'a>(events: &'a [GameEvent], event_type: &str) -> &'a GameEvent {
    events
        .iter()
        .find(|e| e.event_type == event_type)
        .unwrap_or_else(|| panic!("expected {event_type} in {events:?}"))
}

#[tokio::test]
async fn happy_game_to_score_limit() {
    // Alice's words are valid; everything bob tries is judged invalid.
    let judge = StubJudge::scripted(&[
        ("hot", true, 1),
        ("scorching", true, 3),
        ("blazing", true, 4),
    ]);
    let mut rig = Rig::new(judge);
    rig.both_ready().await;

    let alice = rig.alice.id;
    let bob = rig.bob.id;
    assert_eq!(rig.session.current_player_id, Some(alice));

    // Round 1: alice plays, bob burns three mistakes.
    let events = rig.submit(alice, "hot").await;
    let vr = find_event(&events, "validation_result");
    assert_eq!(vr.payload["is_valid"], serde_json::json!(true));
    assert!(has_event(&events, "opponent_turn_ended"));
    assert_eq!(rig.session.current_player_id, Some(bob));

    for (i, bad) in ["wrong", "nope", "bad"].iter().enumerate() {
        let events = rig.submit(bob, bad).await;
        if i < 2 {
            assert!(has_event(&events, "opponent_mistake"));
        } else {
            let new_round = find_event(&events, "new_round_started");
            assert_eq!(
                new_round.payload["previous_round_end_reason"],
                serde_json::json!("invalid_word_max_mistakes")
            );
            assert_eq!(
                new_round.payload["round_winner_id"],
                serde_json::json!(alice.to_string())
            );
        }
    }
    assert_eq!(rig.score_of(alice), 1);
    assert_eq!(rig.session.current_round, 2);
    assert_eq!(rig.session.status, GameStatus::WaitingForReady);
    rig.assert_score_invariant();

    // Round 2 starts with bob (even round, second in order).
    rig.both_ready().await;
    assert_eq!(rig.session.current_player_id, Some(bob));

    let mut game_over = None;
    for bad in ["wrong2", "nope2", "bad2"] {
        let events = rig.submit(bob, bad).await;
        if has_event(&events, "game_over") {
            game_over = Some(find_event(&events, "game_over").clone());
        }
    }

    // Two round wins out of three ends the game.
    let game_over = game_over.expect("game should be over");
    assert_eq!(
        game_over.payload["game_winner_id"],
        serde_json::json!(alice.to_string())
    );
    assert_eq!(
        game_over.payload["reason"],
        serde_json::json!("max_rounds_reached_or_score_limit")
    );
    assert_eq!(rig.session.status, GameStatus::Finished);
    assert_eq!(rig.session.winner_user_id, Some(alice));
    assert_eq!(rig.score_of(alice), 2);
    rig.assert_score_invariant();

    // A finished session rejects further play.
    let events = rig.submit(alice, "anything").await;
    assert!(has_event(&events, "error_message_to_player"));
    assert_eq!(rig.score_of(alice), 2);
}

#[tokio::test]
async fn repeated_word_is_a_mistake_every_time() {
    let judge = StubJudge::scripted(&[("hot", true, 1)]);
    let mut rig = Rig::new(judge);
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);

    rig.submit(alice, "hot").await;

    // Case-insensitive repeats, three in a row, end the round.
    for (attempt, word) in ["HOT", "Hot", "hot"].iter().enumerate() {
        let events = rig.submit(bob, word).await;
        let vr = find_event(&events, "validation_result");
        assert_eq!(vr.payload["is_valid"], serde_json::json!(false));
        assert_eq!(
            vr.payload["message"],
            serde_json::json!("Word already played. Mistake!")
        );

        if attempt == 2 {
            let new_round = find_event(&events, "new_round_started");
            assert_eq!(
                new_round.payload["previous_round_end_reason"],
                serde_json::json!("repeated_word_max_mistakes")
            );
        } else {
            assert_eq!(
                rig.session.players[&bob].mistakes_in_current_round,
                attempt as i64 + 1
            );
        }
    }

    assert_eq!(rig.score_of(alice), 1);
    assert_eq!(rig.score_of(bob), 0);
    assert_eq!(rig.session.status, GameStatus::WaitingForReady);
    // Round rollover cleared the mistake counters.
    assert_eq!(rig.session.players[&bob].mistakes_in_current_round, 0);
}

#[tokio::test]
async fn double_timeout_loser_has_fewer_words() {
    let judge = StubJudge::scripted(&[
        ("hot", true, 2),
        ("mild", true, 2),
        ("blazing", true, 2),
    ]);
    let mut rig = Rig::new(judge);
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);

    // Alice banks two accepted words, bob one.
    rig.submit(alice, "hot").await;
    rig.submit(bob, "mild").await;
    rig.submit(alice, "blazing").await;

    // Bob times out; the turn rotates with a broadcast.
    let events = rig.act(bob, Action::Timeout).await;
    let timeout = find_event(&events, "timeout");
    assert_eq!(timeout.payload["player_id"], serde_json::json!(bob.to_string()));
    assert_eq!(rig.session.consecutive_timeouts, 1);

    // Alice times out too: double timeout, bob (1 word vs 2) loses.
    let events = rig.act(alice, Action::Timeout).await;
    let new_round = find_event(&events, "new_round_started");
    assert_eq!(
        new_round.payload["previous_round_end_reason"],
        serde_json::json!("double_timeout")
    );
    assert_eq!(
        new_round.payload["round_winner_id"],
        serde_json::json!(alice.to_string())
    );
    assert_eq!(rig.score_of(alice), 1);
    assert_eq!(rig.session.consecutive_timeouts, 0);
    rig.assert_score_invariant();
}

#[tokio::test]
async fn double_timeout_with_equal_words_is_a_draw() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);

    rig.act(alice, Action::Timeout).await;
    let events = rig.act(bob, Action::Timeout).await;

    let new_round = find_event(&events, "new_round_started");
    assert_eq!(new_round.payload["round_winner_id"], serde_json::Value::Null);
    assert_eq!(rig.score_of(alice), 0);
    assert_eq!(rig.score_of(bob), 0);
}

#[tokio::test]
async fn three_timeouts_end_the_round_for_the_slow_player() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);

    // Interleave valid words from bob so the timeouts are never consecutive.
    rig.act(alice, Action::Timeout).await;
    rig.submit(bob, "first").await;
    rig.act(alice, Action::Timeout).await;
    rig.submit(bob, "second").await;
    let events = rig.act(alice, Action::Timeout).await;

    let new_round = find_event(&events, "new_round_started");
    assert_eq!(
        new_round.payload["previous_round_end_reason"],
        serde_json::json!("timeout_max_mistakes")
    );
    assert_eq!(
        new_round.payload["round_winner_id"],
        serde_json::json!(bob.to_string())
    );
}

#[tokio::test]
async fn out_of_turn_and_wrong_status_are_rejected() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));

    // Submitting before the round starts is rejected.
    let events = rig.submit(rig.alice.id, "early").await;
    assert!(has_event(&events, "error_message_to_player"));

    rig.both_ready().await;
    let bob = rig.bob.id;

    // It's alice's turn; bob is told off and nothing changes.
    let events = rig.submit(bob, "sneaky").await;
    let error = find_event(&events, "error_message_to_player");
    assert_eq!(error.payload["message"], serde_json::json!("Not your turn."));
    assert_eq!(rig.session.players[&bob].mistakes_in_current_round, 0);
    assert!(rig.session.words_played_this_round_all.is_empty());

    // Ditto for an out-of-turn timeout.
    let events = rig.act(bob, Action::Timeout).await;
    assert!(has_event(&events, "error_message_to_player"));
    assert_eq!(rig.session.consecutive_timeouts, 0);
}

#[tokio::test]
async fn oracle_outage_degrades_to_a_mistake() {
    let mut rig = Rig::new(StubJudge::rate_limited());
    rig.both_ready().await;
    let alice = rig.alice.id;

    let events = rig.submit(alice, "hot").await;
    let vr = find_event(&events, "validation_result");
    assert_eq!(vr.payload["is_valid"], serde_json::json!(false));
    assert_eq!(
        vr.payload["message"],
        serde_json::json!("Validator unavailable")
    );
    assert!(has_event(&events, "opponent_mistake"));

    // The game is still live and still alice's turn.
    assert_eq!(rig.session.status, GameStatus::InProgress);
    assert_eq!(rig.session.current_player_id, Some(alice));
    assert_eq!(rig.session.players[&alice].mistakes_in_current_round, 1);
}

#[tokio::test]
async fn empty_word_is_rejected_without_a_mistake() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    rig.both_ready().await;
    let alice = rig.alice.id;

    let events = rig.submit(alice, "   ").await;
    let vr = find_event(&events, "validation_result");
    assert_eq!(
        vr.payload["message"],
        serde_json::json!("Word cannot be empty.")
    );
    assert_eq!(rig.session.players[&alice].mistakes_in_current_round, 0);
    assert_eq!(rig.session.current_player_id, Some(alice));
}

#[tokio::test]
async fn emoji_reaches_only_the_opponent() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);

    let events = rig
        .act(
            alice,
            Action::SendEmoji {
                emoji: "THUMBS_UP".to_string(),
            },
        )
        .await;
    let emoji = find_event(&events, "emoji_broadcast");
    assert_eq!(
        emoji.target,
        crate::game::EventTarget::Player(bob),
        "emoji must go to the opponent only"
    );
    assert_eq!(emoji.payload["sender_id"], serde_json::json!(alice.to_string()));
}

#[tokio::test]
async fn disconnect_mid_round_forfeits_to_the_remaining_player() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    rig.both_ready().await;
    let (alice, bob) = (rig.alice.id, rig.bob.id);
    rig.submit(alice, "hot").await;

    let events = engine::handle_disconnect(
        &mut rig.session,
        alice,
        &mut EngineCtx {
            conn: &mut rig.conn,
            oracle: &rig.oracle,
            settings: &rig.settings,
        },
    );

    assert_eq!(rig.session.status, GameStatus::AbandonedByPlayer);
    assert_eq!(rig.session.winner_user_id, Some(bob));

    // Inform first, then the terminal game_over, both to the survivor.
    assert_eq!(events[0].event_type, "player_disconnected_inform");
    assert_eq!(events[0].target, crate::game::EventTarget::Player(bob));
    let game_over = find_event(&events, "game_over");
    assert_eq!(
        game_over.payload["reason"],
        serde_json::json!("opponent_disconnected")
    );
    assert_eq!(
        game_over.payload["game_winner_id"],
        serde_json::json!(bob.to_string())
    );

    // A disconnect on a terminal session emits nothing further.
    let events = engine::handle_disconnect(
        &mut rig.session,
        bob,
        &mut EngineCtx {
            conn: &mut rig.conn,
            oracle: &rig.oracle,
            settings: &rig.settings,
        },
    );
    assert!(events.is_empty());
}

#[tokio::test]
async fn disconnect_before_ready_still_forfeits() {
    let mut rig = Rig::new(StubJudge::valid_with_score(2));
    assert_eq!(rig.session.status, GameStatus::WaitingForReady);
    let bob = rig.bob.id;

    let events = engine::handle_disconnect(
        &mut rig.session,
        rig.alice.id,
        &mut EngineCtx {
            conn: &mut rig.conn,
            oracle: &rig.oracle,
            settings: &rig.settings,
        },
    );
    assert_eq!(rig.session.status, GameStatus::AbandonedByPlayer);
    assert_eq!(rig.session.winner_user_id, Some(bob));
    assert!(has_event(&events, "game_over"));
}

#[tokio::test]
async fn disconnect_while_merely_matched_forfeits_too() {
    let mut conn = test_conn();
    let alice = insert_user(&mut conn, "alice", 3);
    let bob = insert_user(&mut conn, "bob", 4);
    let settings = Settings::default();
    let mut session = GameSession::new(
        "game_m".to_string(),
        "en".to_string(),
        PlayerState::new(alice.id, "alice".to_string(), alice.level, false),
        PlayerState::new(bob.id, "bob".to_string(), bob.level, false),
        false,
        &settings,
    );
    assert_eq!(session.status, GameStatus::Matched);

    let oracle = ValidationOracle::new(Arc::new(StubJudge::valid_with_score(2)));
    let events = engine::handle_disconnect(
        &mut session,
        bob.id,
        &mut EngineCtx {
            conn: &mut conn,
            oracle: &oracle,
            settings: &settings,
        },
    );
    assert_eq!(session.status, GameStatus::AbandonedByPlayer);
    assert_eq!(session.winner_user_id, Some(alice.id));
    assert!(has_event(&events, "player_disconnected_inform"));
}

#[tokio::test]
async fn bot_game_needs_only_the_human_ready() {
    let mut conn = test_conn();
    let human = insert_user(&mut conn, "carol", 2);
    let bot = crate::users::get_or_create_bot_user(&mut conn).unwrap();
    insert_prompt(&mut conn, "en", "The fire was warm.", "warm", "More extreme!");

    let settings = Settings::default();
    let session = GameSession::new(
        "game_bot".to_string(),
        "en".to_string(),
        PlayerState::new(human.id, "carol".to_string(), human.level, false),
        PlayerState::new(bot.id, "WordBot".to_string(), 5, true),
        true,
        &settings,
    );
    let oracle = ValidationOracle::new(Arc::new(StubJudge::valid_with_score(2)));

    let mut session = session;
    engine::initialize_game(
        &mut session,
        &mut EngineCtx {
            conn: &mut conn,
            oracle: &oracle,
            settings: &settings,
        },
    );
    assert_eq!(session.status, GameStatus::WaitingForReady);
    assert_eq!(session.required_ready_count(), 1);

    let events = engine::handle_action(
        &mut session,
        human.id,
        Action::ClientReady,
        &mut EngineCtx {
            conn: &mut conn,
            oracle: &oracle,
            settings: &settings,
        },
    )
    .await;
    assert!(events.iter().any(|e| e.event_type == "round_started"));
    assert_eq!(session.status, GameStatus::InProgress);
}

#[tokio::test]
async fn content_outage_at_init_is_terminal() {
    let mut conn = test_conn();
    let alice = insert_user(&mut conn, "alice", 3);
    let bob = insert_user(&mut conn, "bob", 4);
    // No prompts inserted for "fr".
    let settings = Settings::default();
    let mut session = GameSession::new(
        "game_fr".to_string(),
        "fr".to_string(),
        PlayerState::new(alice.id, "alice".to_string(), alice.level, false),
        PlayerState::new(bob.id, "bob".to_string(), bob.level, false),
        false,
        &settings,
    );
    let oracle = ValidationOracle::new(Arc::new(StubJudge::valid_with_score(2)));

    let events = engine::initialize_game(
        &mut session,
        &mut EngineCtx {
            conn: &mut conn,
            oracle: &oracle,
            settings: &settings,
        },
    );
    assert_eq!(session.status, GameStatus::ErrorContentLoad);
    assert!(events.iter().any(|e| e.event_type == "error_message_broadcast"));
    assert!(session.status.is_terminal());
}
