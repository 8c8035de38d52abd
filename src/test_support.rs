//! Shared helpers for the test suite: an in-memory database with the real
//! migrations applied, row factories, and a scriptable [`WordJudge`] stub so
//! no test ever touches the network.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use diesel::{Connection, SqliteConnection, prelude::*};
use diesel_migrations::MigrationHarness;
use serde_json::{Value, json};

use crate::{
    auth::User,
    content::SentencePrompt,
    schema::{sentence_prompts, users},
    validator::{InventRequest, JudgeError, JudgeRequest, WordJudge},
};

pub fn test_conn() -> SqliteConnection {
    let mut conn = SqliteConnection::establish(":memory:").unwrap();
    conn.run_pending_migrations(crate::MIGRATIONS).unwrap();
    conn
}

pub fn insert_user(conn: &mut SqliteConnection, name: &str, level: i64) -> User {
    let token = format!("token-{name}");
    diesel::insert_into(users::table)
        .values((
            users::username.eq(name),
            users::level.eq(level),
            users::api_token.eq(&token),
        ))
        .execute(conn)
        .unwrap();
    users::table
        .filter(users::api_token.eq(&token))
        .first(conn)
        .unwrap()
}

pub fn insert_prompt(
    conn: &mut SqliteConnection,
    language: &str,
    sentence: &str,
    target: &str,
    prompt_text: &str,
) -> SentencePrompt {
    diesel::insert_into(sentence_prompts::table)
        .values((
            sentence_prompts::sentence_text.eq(sentence),
            sentence_prompts::target_word.eq(target),
            sentence_prompts::prompt_text.eq(prompt_text),
            sentence_prompts::language.eq(language),
        ))
        .execute(conn)
        .unwrap();
    sentence_prompts::table
        .order(sentence_prompts::id.desc())
        .first(conn)
        .unwrap()
}

/// A prompt value without any database row behind it, for policy-level
/// tests.
pub fn test_prompt(sentence: &str, target: &str, prompt_text: &str) -> SentencePrompt {
    SentencePrompt {
        id: 1,
        sentence_text: sentence.to_string(),
        target_word: target.to_string(),
        prompt_text: prompt_text.to_string(),
        language: "en".to_string(),
        difficulty: 1,
        created_at: chrono::Utc::now().naive_utc(),
    }
}

/// Scriptable judge: per-word verdicts with a default, an optional canned
/// invention, or a permanent rate-limit. Counts calls so tests can assert
/// the oracle was (not) consulted.
pub struct StubJudge {
    verdicts: HashMap<String, (bool, i64)>,
    default_verdict: (bool, i64),
    invention: Option<(String, i64)>,
    rate_limited: bool,
    judge_calls: AtomicU64,
    invent_calls: AtomicU64,
}

impl StubJudge {
    pub fn valid_with_score(score: i64) -> StubJudge {
        StubJudge {
            verdicts: HashMap::new(),
            default_verdict: (true, score),
            invention: Some(("glacial".to_string(), score)),
            rate_limited: false,
            judge_calls: AtomicU64::new(0),
            invent_calls: AtomicU64::new(0),
        }
    }

    pub fn invalid() -> StubJudge {
        StubJudge {
            default_verdict: (false, 0),
            invention: None,
            ..StubJudge::valid_with_score(0)
        }
    }

    pub fn rate_limited() -> StubJudge {
        StubJudge {
            rate_limited: true,
            ..StubJudge::valid_with_score(0)
        }
    }

    /// Per-word verdicts; anything not listed is judged invalid.
    pub fn scripted(words: &[(&str, bool, i64)]) -> StubJudge {
        StubJudge {
            verdicts: words
                .iter()
                .map(|(w, v, c)| (w.to_lowercase(), (*v, *c)))
                .collect(),
            default_verdict: (false, 0),
            ..StubJudge::valid_with_score(0)
        }
    }

    pub fn with_invention(mut self, word: &str, creativity: i64) -> StubJudge {
        self.invention = Some((word.to_string(), creativity));
        self
    }

    pub fn judge_calls(&self) -> u64 {
        self.judge_calls.load(Ordering::Relaxed)
    }

    pub fn invent_calls(&self) -> u64 {
        self.invent_calls.load(Ordering::Relaxed)
    }
}

#[axum::async_trait]
impl WordJudge for StubJudge {
    async fn judge_word(&self, request: &JudgeRequest<'_>) -> Result<Value, JudgeError> {
        self.judge_calls.fetch_add(1, Ordering::Relaxed);
        if self.rate_limited {
            return Err(JudgeError::RateLimited);
        }
        let (is_valid, creativity) = self
            .verdicts
            .get(&request.word.to_lowercase())
            .copied()
            .unwrap_or(self.default_verdict);
        Ok(json!({
            "is_valid": is_valid,
            "creativity_score": creativity,
            "reason": if is_valid { "fits the prompt" } else { "does not fit the prompt" },
        }))
    }

    async fn invent_word(
        &self,
        _request: &InventRequest<'_>,
    ) -> Result<Value, JudgeError> {
        self.invent_calls.fetch_add(1, Ordering::Relaxed);
        if self.rate_limited {
            return Err(JudgeError::RateLimited);
        }
        match &self.invention {
            Some((word, creativity)) => Ok(json!({
                "word": word,
                "creativity": creativity,
            })),
            None => Err(JudgeError::BadResponse("no invention scripted".to_string())),
        }
    }
}
