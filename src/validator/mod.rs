//! Validation oracle client. Judgments are cached in the submission log:
//! once any player has submitted a word for a given prompt, every later
//! submission of that word gets the stored verdict without an LLM call.

pub mod gemini;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use diesel::SqliteConnection;
use serde_json::Value;

use crate::content;

/// The external LLM collaborator. `judge_word` returns the raw parsed JSON
/// object from the model; sanitation happens in [`ValidationOracle`] so that
/// a misbehaving model can never push an out-of-contract verdict into the
/// game. `invent_word` is the bot-side request for a fresh word.
#[axum::async_trait]
pub trait WordJudge: Send + Sync {
    async fn judge_word(&self, request: &JudgeRequest<'_>) -> Result<Value, JudgeError>;
    async fn invent_word(&self, request: &InventRequest<'_>) -> Result<Value, JudgeError>;
}

pub struct JudgeRequest<'a> {
    pub word: &'a str,
    pub target_word: &'a str,
    pub prompt_text: &'a str,
    pub sentence_text: &'a str,
    pub language: &'a str,
}

pub struct InventRequest<'a> {
    pub target_word: &'a str,
    pub prompt_text: &'a str,
    pub sentence_text: &'a str,
    pub language: &'a str,
    pub words_to_avoid: &'a [String],
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("LLM credentials are not configured")]
    MissingCredentials,
    #[error("all configured models are rate-limited")]
    RateLimited,
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM produced an unusable response: {0}")]
    BadResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("validator unavailable: {0}")]
    Unavailable(JudgeError),
    #[error("validator failed: {0}")]
    Failed(JudgeError),
}

/// Result of validating one `(prompt, word)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub is_valid: bool,
    pub creativity_score: i64,
    pub reason: String,
    pub from_cache: bool,
    pub latency_ms: i64,
}

#[derive(Default)]
pub struct OracleStats {
    total_calls: AtomicU64,
    cache_hits: AtomicU64,
}

pub struct ValidationOracle {
    judge: Arc<dyn WordJudge>,
    stats: OracleStats,
}

impl ValidationOracle {
    pub fn new(judge: Arc<dyn WordJudge>) -> ValidationOracle {
        ValidationOracle {
            judge,
            stats: OracleStats::default(),
        }
    }

    pub fn judge(&self) -> &Arc<dyn WordJudge> {
        &self.judge
    }

    pub fn total_calls(&self) -> u64 {
        self.stats.total_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.stats.cache_hits.load(Ordering::Relaxed)
    }

    /// Validates `word` against the current prompt. Cache first; only a miss
    /// reaches the LLM. The returned latency covers the whole oracle call,
    /// retries included, and is 0 for cache hits.
    pub async fn validate(
        &self,
        conn: &mut SqliteConnection,
        sentence_prompt_id: i64,
        request: JudgeRequest<'_>,
    ) -> Result<Validation, OracleError> {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);

        let word_lower = request.word.trim().to_lowercase();

        match content::latest_submission_for_word(conn, sentence_prompt_id, &word_lower) {
            Ok(Some(previous)) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    word = %word_lower,
                    sentence_prompt_id,
                    is_valid = previous.is_valid,
                    "validation served from submission cache"
                );
                return Ok(Validation {
                    is_valid: previous.is_valid,
                    creativity_score: previous.creativity_score.unwrap_or(0),
                    reason: String::new(),
                    from_cache: true,
                    latency_ms: 0,
                });
            }
            Ok(None) => {}
            Err(e) => {
                // A broken cache lookup is not fatal; fall through to the LLM.
                tracing::error!(error = %e, "validation cache lookup failed");
            }
        }

        let started = std::time::Instant::now();
        let raw = self.judge.judge_word(&request).await.map_err(|e| match e {
            JudgeError::MissingCredentials | JudgeError::RateLimited => {
                OracleError::Unavailable(e)
            }
            other => OracleError::Failed(other),
        })?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let (is_valid, creativity_score, reason) = sanitize_judgment(&raw);
        tracing::debug!(
            word = %word_lower,
            is_valid,
            creativity_score,
            latency_ms,
            "oracle judgment"
        );

        Ok(Validation {
            is_valid,
            creativity_score,
            reason,
            from_cache: false,
            latency_ms,
        })
    }
}

/// Forces a raw model judgment into the game's contract:
/// wrong-typed `is_valid` downgrades the whole verdict to invalid; a valid
/// word's creativity is clamped into [1, 5]; an invalid word's creativity is
/// forced to 0. Type problems are recorded in the reason string.
fn sanitize_judgment(raw: &Value) -> (bool, i64, String) {
    let mut reason = match raw.get("reason") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => "No reason provided.".to_string(),
    };

    let is_valid = match raw.get("is_valid") {
        Some(Value::Bool(b)) => *b,
        other => {
            reason = format!(
                "Validation error: 'is_valid' was missing or not a boolean ({other:?}). {reason}"
            );
            return (false, 0, reason);
        }
    };

    let mut creativity = match raw.get("creativity_score").and_then(Value::as_i64) {
        Some(c) => c,
        None => {
            reason = format!(
                "Validation error: 'creativity_score' was missing or not an integer. {reason}"
            );
            if is_valid { 1 } else { 0 }
        }
    };

    if is_valid {
        if !(1..=5).contains(&creativity) {
            reason = format!(
                "{reason} (creativity_score {creativity} out of range for a valid word, clamped to 1)"
            );
            creativity = 1;
        }
    } else if creativity != 0 {
        creativity = 0;
    }

    (is_valid, creativity, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubJudge, insert_prompt, insert_user, test_conn};
    use crate::{content, content::NewWordSubmission};
    use serde_json::json;

    #[test]
    fn sanitize_clamps_and_downgrades() {
        // Valid word, score above range: forced down to 1.
        let (valid, score, _) = sanitize_judgment(&json!({
            "is_valid": true, "creativity_score": 7, "reason": "great"
        }));
        assert!(valid);
        assert_eq!(score, 1);

        // Valid word, score below range: clamp to 1.
        let (valid, score, _) = sanitize_judgment(&json!({
            "is_valid": true, "creativity_score": 0, "reason": "meh"
        }));
        assert!(valid);
        assert_eq!(score, 1);

        // Invalid word keeps score 0 whatever the model said.
        let (valid, score, _) = sanitize_judgment(&json!({
            "is_valid": false, "creativity_score": 4, "reason": "no"
        }));
        assert!(!valid);
        assert_eq!(score, 0);

        // Wrong-typed is_valid downgrades the verdict.
        let (valid, score, reason) = sanitize_judgment(&json!({
            "is_valid": "yes", "creativity_score": 3, "reason": "?"
        }));
        assert!(!valid);
        assert_eq!(score, 0);
        assert!(reason.contains("is_valid"));

        // Wrong-typed creativity on a valid word becomes 1.
        let (valid, score, _) = sanitize_judgment(&json!({
            "is_valid": true, "creativity_score": "lots", "reason": "?"
        }));
        assert!(valid);
        assert_eq!(score, 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_judge_entirely() {
        let mut conn = test_conn();
        let user = insert_user(&mut conn, "alice", 1);
        let prompt =
            insert_prompt(&mut conn, "en", "The fire was warm.", "warm", "More extreme!");
        let game_db_id =
            content::create_game(&mut conn, "game_x", user.id, user.id, "en").unwrap();

        let judge = Arc::new(StubJudge::valid_with_score(4));
        let oracle = ValidationOracle::new(judge.clone());

        let request = || JudgeRequest {
            word: "Scorching",
            target_word: "warm",
            prompt_text: "More extreme!",
            sentence_text: "The fire was warm.",
            language: "en",
        };

        let first = oracle
            .validate(&mut conn, prompt.id, request())
            .await
            .unwrap();
        assert!(first.is_valid);
        assert!(!first.from_cache);
        assert_eq!(judge.judge_calls(), 1);

        // The engine would log the submission; emulate that here.
        content::log_submission(
            &mut conn,
            NewWordSubmission {
                game_id: game_db_id,
                round_number: 1,
                user_id: user.id,
                sentence_prompt_id: prompt.id,
                submitted_word: "scorching".to_string(),
                time_taken_ms: None,
                is_valid: first.is_valid,
                creativity_score: Some(first.creativity_score),
                validation_latency_ms: Some(first.latency_ms),
                submission_timestamp: chrono::Utc::now().naive_utc(),
            },
        )
        .unwrap();

        let second = oracle
            .validate(&mut conn, prompt.id, request())
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.latency_ms, 0);
        assert_eq!(second.creativity_score, first.creativity_score);
        assert_eq!(judge.judge_calls(), 1, "oracle must be called exactly once");
        assert_eq!(oracle.total_calls(), 2);
        assert_eq!(oracle.cache_hits(), 1);
    }

    #[tokio::test]
    async fn rate_limited_judge_surfaces_as_unavailable() {
        let mut conn = test_conn();
        let prompt =
            insert_prompt(&mut conn, "en", "The fire was warm.", "warm", "More extreme!");

        let oracle = ValidationOracle::new(Arc::new(StubJudge::rate_limited()));
        let result = oracle
            .validate(
                &mut conn,
                prompt.id,
                JudgeRequest {
                    word: "hot",
                    target_word: "warm",
                    prompt_text: "More extreme!",
                    sentence_text: "The fire was warm.",
                    language: "en",
                },
            )
            .await;

        assert!(matches!(result, Err(OracleError::Unavailable(_))));
    }
}
