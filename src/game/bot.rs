//! Bot opponent policy: decide one move for a bot whose turn it is. The
//! scheduler snapshots the session into a [`BotContext`], calls
//! [`choose_move`] without holding the session lock through the think-delay,
//! and injects the result as an ordinary `submit_word` or `timeout` action.

use std::sync::Arc;

use diesel::SqliteConnection;
use rand::{Rng, seq::IndexedRandom};
use serde_json::Value;

use crate::{
    content::{self, SentencePrompt},
    settings::Settings,
    validator::{InventRequest, WordJudge},
};

/// What the bot decided to do. `word: None` means the bot lets its turn
/// time out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotMove {
    pub word: Option<String>,
    pub creativity: i64,
}

/// Everything the policy needs, copied out of the session so the decision
/// can run outside the session lock.
#[derive(Debug, Clone)]
pub struct BotContext {
    pub opponent_level: i64,
    pub language: String,
    pub prompt: SentencePrompt,
    pub words_played_this_round_all: Vec<String>,
}

/// Linear scale from `max_prob` (opponent level 1) down to `min_prob` at or
/// above the configured level cap.
pub fn scaled_probability(
    opponent_level: i64,
    max_prob: f64,
    min_prob: f64,
    level_cap: i64,
) -> f64 {
    if opponent_level >= level_cap {
        return min_prob;
    }
    if opponent_level <= 1 {
        return max_prob;
    }
    let progress = (opponent_level - 1) as f64 / (level_cap - 1) as f64;
    (max_prob - progress * (max_prob - min_prob)).max(min_prob)
}

fn deliberate_mistake(ctx: &BotContext, rng: &mut impl Rng) -> String {
    // Repeating an already-played word is the most human-looking mistake;
    // with an empty round the target word itself is the only safe dud.
    match ctx.words_played_this_round_all.choose(rng) {
        Some(word) => word.clone(),
        None => ctx.prompt.target_word.clone(),
    }
}

async fn invent_word(
    ctx: &BotContext,
    judge: &Arc<dyn WordJudge>,
) -> Option<(String, i64)> {
    let request = InventRequest {
        target_word: &ctx.prompt.target_word,
        prompt_text: &ctx.prompt.prompt_text,
        sentence_text: &ctx.prompt.sentence_text,
        language: &ctx.language,
        words_to_avoid: &ctx.words_played_this_round_all,
    };

    // One retry on an empty or repeated suggestion.
    for attempt in 0..2 {
        let raw = match judge.invent_word(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "bot word generation failed");
                return None;
            }
        };

        let word = raw
            .get("word")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let creativity = raw
            .get("creativity")
            .and_then(Value::as_i64)
            .filter(|c| (1..=5).contains(c))
            .unwrap_or(1);

        if !word.is_empty()
            && !ctx
                .words_played_this_round_all
                .contains(&word.to_lowercase())
        {
            return Some((word, creativity));
        }
        tracing::warn!(%word, attempt, "bot generated an empty or repeated word");
    }
    None
}

pub async fn choose_move(
    ctx: &BotContext,
    conn: &mut SqliteConnection,
    judge: &Arc<dyn WordJudge>,
    settings: &Settings,
    rng: &mut (impl Rng + Send),
) -> BotMove {
    let mistake_prob = scaled_probability(
        ctx.opponent_level,
        settings.max_mistake_probability,
        settings.min_mistake_probability,
        settings.level_cap_for_scaling,
    );
    if rng.random::<f64>() < mistake_prob {
        let word = deliberate_mistake(ctx, rng);
        tracing::info!(%word, "bot plays a deliberate mistake");
        return BotMove {
            word: Some(word),
            creativity: 1,
        };
    }

    let timeout_prob = scaled_probability(
        ctx.opponent_level,
        settings.max_timeout_probability,
        settings.min_timeout_probability,
        settings.level_cap_for_scaling,
    );
    if rng.random::<f64>() < timeout_prob {
        tracing::info!(
            opponent_level = ctx.opponent_level,
            "bot lets its turn time out"
        );
        return BotMove {
            word: None,
            creativity: 0,
        };
    }

    // Cheap path: reuse a decent word someone already got approved for this
    // prompt.
    match content::random_cached_valid_word(
        conn,
        ctx.prompt.id,
        &ctx.words_played_this_round_all,
    ) {
        Ok(Some(previous)) => {
            tracing::info!(word = %previous.submitted_word, "bot reuses a cached word");
            return BotMove {
                word: Some(previous.submitted_word),
                creativity: previous.creativity_score.unwrap_or(2),
            };
        }
        Ok(None) => {}
        Err(e) => tracing::error!(error = %e, "bot cached-word lookup failed"),
    }

    if let Some((word, creativity)) = invent_word(ctx, judge).await {
        tracing::info!(%word, creativity, "bot plays a generated word");
        return BotMove {
            word: Some(word),
            creativity,
        };
    }

    // Guaranteed-termination fallback: the target word is always a legal,
    // uncreative move (unless already played, in which case it is a mistake
    // and the round moves on regardless).
    tracing::warn!("bot falls back to the target word");
    BotMove {
        word: Some(ctx.prompt.target_word.clone()),
        creativity: 1,
    }
}
