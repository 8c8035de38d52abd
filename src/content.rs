//! Content provider: prompt selection and the persisted game trail (game
//! records, word submissions, scores). Submission rows double as the
//! validation cache, keyed by `(sentence_prompt_id, submitted_word)`.
//!
//! Persistence failures never stop a live game; callers treat every write
//! here as best-effort and log on error.

use chrono::Utc;
use diesel::{SqliteConnection, prelude::*};
use serde::Serialize;

use crate::schema::{game_players, games, sentence_prompts, word_submissions};

diesel::define_sql_function! { fn random() -> Integer }
diesel::define_sql_function! { fn last_insert_rowid() -> BigInt }

/// One round's immutable content: the sentence, the word to replace and the
/// instruction for replacing it.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct SentencePrompt {
    pub id: i64,
    pub sentence_text: String,
    pub target_word: String,
    pub prompt_text: String,
    pub language: String,
    pub difficulty: i64,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
pub struct WordSubmission {
    pub id: i64,
    pub game_id: i64,
    pub round_number: i64,
    pub user_id: i64,
    pub sentence_prompt_id: i64,
    pub submitted_word: String,
    pub time_taken_ms: Option<i64>,
    pub is_valid: bool,
    pub creativity_score: Option<i64>,
    pub validation_latency_ms: Option<i64>,
    pub submission_timestamp: chrono::NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = word_submissions)]
pub struct NewWordSubmission {
    pub game_id: i64,
    pub round_number: i64,
    pub user_id: i64,
    pub sentence_prompt_id: i64,
    pub submitted_word: String,
    pub time_taken_ms: Option<i64>,
    pub is_valid: bool,
    pub creativity_score: Option<i64>,
    pub validation_latency_ms: Option<i64>,
    pub submission_timestamp: chrono::NaiveDateTime,
}

/// Uniform random prompt for a language; `None` when the language has no
/// content at all.
pub fn random_prompt(
    conn: &mut SqliteConnection,
    language: &str,
) -> QueryResult<Option<SentencePrompt>> {
    sentence_prompts::table
        .filter(sentence_prompts::language.eq(language))
        .order(random())
        .first::<SentencePrompt>(conn)
        .optional()
}

/// Creates the persisted game record plus its two player rows, returning the
/// integer id used for all later logging.
pub fn create_game(
    conn: &mut SqliteConnection,
    matchmaking_game_id: &str,
    player1_id: i64,
    player2_id: i64,
    language: &str,
) -> QueryResult<i64> {
    diesel::insert_into(games::table)
        .values((
            games::matchmaking_game_id.eq(matchmaking_game_id),
            games::language.eq(language),
            games::status.eq("in_progress"),
        ))
        .execute(conn)?;

    let game_db_id: i64 = diesel::select(last_insert_rowid()).get_result(conn)?;

    diesel::insert_into(game_players::table)
        .values(&vec![
            (
                game_players::game_id.eq(game_db_id),
                game_players::user_id.eq(player1_id),
                game_players::player_order.eq(1i64),
            ),
            (
                game_players::game_id.eq(game_db_id),
                game_players::user_id.eq(player2_id),
                game_players::player_order.eq(2i64),
            ),
        ])
        .execute(conn)?;

    Ok(game_db_id)
}

pub fn log_submission(
    conn: &mut SqliteConnection,
    submission: NewWordSubmission,
) -> QueryResult<()> {
    diesel::insert_into(word_submissions::table)
        .values(&submission)
        .execute(conn)?;
    Ok(())
}

/// Latest submission of this word for this prompt, if any. Words are stored
/// lowercased, so an `eq` on the lowercased word is a case-insensitive hit.
pub fn latest_submission_for_word(
    conn: &mut SqliteConnection,
    sentence_prompt_id: i64,
    word_lower: &str,
) -> QueryResult<Option<WordSubmission>> {
    word_submissions::table
        .filter(word_submissions::sentence_prompt_id.eq(sentence_prompt_id))
        .filter(word_submissions::submitted_word.eq(word_lower))
        .order(word_submissions::submission_timestamp.desc())
        .first::<WordSubmission>(conn)
        .optional()
}

/// A random previously-accepted word for this prompt that is reasonably
/// creative and not in the avoid list. Used by the bot policy before it
/// resorts to asking the oracle for a fresh word.
pub fn random_cached_valid_word(
    conn: &mut SqliteConnection,
    sentence_prompt_id: i64,
    avoid: &[String],
) -> QueryResult<Option<WordSubmission>> {
    word_submissions::table
        .filter(word_submissions::sentence_prompt_id.eq(sentence_prompt_id))
        .filter(word_submissions::is_valid.eq(true))
        .filter(word_submissions::creativity_score.gt(1i64))
        .filter(word_submissions::submitted_word.ne_all(avoid))
        .order(random())
        .first::<WordSubmission>(conn)
        .optional()
}

pub fn update_score(
    conn: &mut SqliteConnection,
    game_db_id: i64,
    user_id: i64,
    new_score: i64,
) -> QueryResult<()> {
    diesel::update(
        game_players::table
            .filter(game_players::game_id.eq(game_db_id))
            .filter(game_players::user_id.eq(user_id)),
    )
    .set(game_players::score.eq(new_score))
    .execute(conn)?;
    Ok(())
}

pub fn finalize_game(
    conn: &mut SqliteConnection,
    game_db_id: i64,
    winner_user_id: Option<i64>,
    status: &str,
    end_reason: &str,
) -> QueryResult<()> {
    diesel::update(games::table.filter(games::id.eq(game_db_id)))
        .set((
            games::status.eq(status),
            games::winner_user_id.eq(winner_user_id),
            games::end_reason.eq(end_reason),
            games::end_time.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn increment_emojis(
    conn: &mut SqliteConnection,
    game_db_id: i64,
    user_id: i64,
) -> QueryResult<()> {
    diesel::update(
        game_players::table
            .filter(game_players::game_id.eq(game_db_id))
            .filter(game_players::user_id.eq(user_id)),
    )
    .set(game_players::emojis_sent.eq(game_players::emojis_sent + 1))
    .execute(conn)?;
    Ok(())
}
