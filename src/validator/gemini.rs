//! Gemini-backed [`WordJudge`]. Requests ask for structured JSON via a
//! response schema; an ordered model chain absorbs per-model rate limits.

use serde_json::{Value, json};

use super::{InventRequest, JudgeError, JudgeRequest, WordJudge};

const GENERATE_CONTENT_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiJudge {
    http: reqwest::Client,
    api_key: Option<String>,
    models: Vec<String>,
}

impl GeminiJudge {
    pub fn new(api_key: Option<String>, models: Vec<String>) -> GeminiJudge {
        GeminiJudge {
            http: reqwest::Client::new(),
            api_key,
            models,
        }
    }

    /// Runs one structured-JSON generation request down the model chain.
    /// HTTP 429 moves on to the next model; any other failure is terminal.
    async fn generate(
        &self,
        prompt: &str,
        response_schema: Value,
    ) -> Result<Value, JudgeError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(JudgeError::MissingCredentials)?;

        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema,
            },
        });

        for model in &self.models {
            let url = format!("{GENERATE_CONTENT_URL}/{model}:generateContent");
            let response = self
                .http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!(%model, "model rate-limited, trying next in chain");
                continue;
            }

            let response = response.error_for_status()?;
            let envelope: Value = response.json().await?;
            let text = envelope
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    JudgeError::BadResponse("no candidate text in response".to_string())
                })?;

            let parsed = serde_json::from_str::<Value>(text).map_err(|e| {
                JudgeError::BadResponse(format!("candidate is not JSON: {e}"))
            })?;
            tracing::info!(%model, "gemini call succeeded");
            return Ok(parsed);
        }

        Err(JudgeError::RateLimited)
    }
}

#[axum::async_trait]
impl WordJudge for GeminiJudge {
    async fn judge_word(&self, request: &JudgeRequest<'_>) -> Result<Value, JudgeError> {
        let prompt = format!(
            r#"You are a word game judge. The game content is in the language with code '{language}'. Given a sentence, a target word within that sentence, a prompt for modifying the target word, and a submitted word from a player, determine if the submitted word is valid according to the prompt and how creative it is.
Don't be too harsh, if the word is a reasonable response to the prompt, consider it valid.

Your response will be structured as a JSON object according to a predefined schema.

Sentence: "{sentence}"
Target Word: "{target}"
Prompt: "{prompt_text}"
Submitted Word: "{word}"

Please provide your judgment based on these fields:
- "is_valid": (boolean) True if the submitted word is a valid response, false otherwise.
- "creativity_score": (integer) From 1 (obvious) to 5 (highly creative). If "is_valid" is false, this score should be 0.
- "reason": (string) A brief explanation for your decision, especially if invalid."#,
            language = request.language,
            sentence = request.sentence_text,
            target = request.target_word,
            prompt_text = request.prompt_text,
            word = request.word,
        );

        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "is_valid": { "type": "BOOLEAN" },
                "creativity_score": { "type": "INTEGER" },
                "reason": { "type": "STRING" },
            },
            "required": ["is_valid", "reason", "creativity_score"],
        });

        self.generate(&prompt, schema).await
    }

    async fn invent_word(
        &self,
        request: &InventRequest<'_>,
    ) -> Result<Value, JudgeError> {
        let avoid = request.words_to_avoid.join(", ");
        let prompt = format!(
            r#"You are a creative player in a word game in language '{language}'.
Your goal is to find a single, novel word to replace the target word in the sentence, based on the prompt.
Do not repeat any of the words already played in this round.

Sentence: "{sentence}"
Target Word: "{target}"
Prompt: "{prompt_text}"
Words Already Played (Avoid These): "{avoid}"

Think of a creative and valid word. Provide the word and a self-assessed creativity score from 1 to 5."#,
            language = request.language,
            sentence = request.sentence_text,
            target = request.target_word,
            prompt_text = request.prompt_text,
        );

        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "word": { "type": "STRING" },
                "creativity": { "type": "INTEGER" },
            },
            "required": ["word", "creativity"],
        });

        self.generate(&prompt, schema).await
    }
}
