use std::collections::HashMap;

use serde::Deserialize;

/// Runtime configuration, read once at startup. Scalar values can be
/// overridden through environment variables of the same (upper-cased) name;
/// list-valued settings (bot name lists, the model chain) come from an
/// optional TOML file pointed at by `WORDEX_CONFIG`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub turn_duration_seconds: u64,
    pub game_max_rounds: i64,
    pub max_mistakes: i64,

    pub matchmaking_bot_threshold_seconds: u64,
    pub matchmaking_sweep_interval_seconds: u64,
    pub default_language: String,

    pub max_mistake_probability: f64,
    pub min_mistake_probability: f64,
    pub max_timeout_probability: f64,
    pub min_timeout_probability: f64,
    pub level_cap_for_scaling: i64,

    pub xp_per_level_base: i64,
    pub xp_per_level_multiplier: f64,
    pub xp_for_round_win: i64,
    pub xp_for_round_loss: i64,
    pub xp_for_round_draw: i64,
    pub xp_for_game_win: i64,
    pub xp_for_game_loss: i64,
    pub xp_for_game_draw: i64,
    pub xp_for_game_win_by_forfeit: i64,

    pub gemini_api_key: Option<String>,
    pub gemini_models: Vec<String>,
    pub bot_usernames: HashMap<String, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            turn_duration_seconds: 30,
            game_max_rounds: 3,
            max_mistakes: 3,
            matchmaking_bot_threshold_seconds: 15,
            matchmaking_sweep_interval_seconds: 15,
            default_language: "en".to_string(),
            max_mistake_probability: 0.20,
            min_mistake_probability: 0.03,
            max_timeout_probability: 0.10,
            min_timeout_probability: 0.01,
            level_cap_for_scaling: 30,
            xp_per_level_base: 100,
            xp_per_level_multiplier: 1.25,
            xp_for_round_win: 25,
            xp_for_round_loss: 5,
            xp_for_round_draw: 10,
            xp_for_game_win: 100,
            xp_for_game_loss: 5,
            xp_for_game_draw: 10,
            xp_for_game_win_by_forfeit: 10,
            gemini_api_key: None,
            gemini_models: vec![
                "gemini-2.5-flash-lite".to_string(),
                "gemini-2.0-flash-lite".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-1.5-flash".to_string(),
            ],
            bot_usernames: HashMap::from([
                (
                    "en".to_string(),
                    vec![
                        "RoboPlayer".to_string(),
                        "WordBot".to_string(),
                        "SyntaxSlayer".to_string(),
                        "VerbViper".to_string(),
                        "Lexi-CON".to_string(),
                        "AI-Opponent".to_string(),
                    ],
                ),
                (
                    "es".to_string(),
                    vec![
                        "PalabraBot".to_string(),
                        "Jugador-IA".to_string(),
                        "SintaxSlayer".to_string(),
                        "VerboVíbora".to_string(),
                        "Lexi-CON".to_string(),
                        "Oponente-IA".to_string(),
                    ],
                ),
            ]),
        }
    }
}

impl Settings {
    pub fn load() -> Settings {
        let _ = dotenvy::dotenv();

        let mut settings = match std::env::var("WORDEX_CONFIG") {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(raw) => match toml::from_str::<Settings>(&raw) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to parse {path}: {e}; using defaults");
                        Settings::default()
                    }
                },
                Err(e) => {
                    tracing::error!("failed to read {path}: {e}; using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };

        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        fn parse_var<T: std::str::FromStr>(name: &str, into: &mut T) {
            if let Ok(raw) = std::env::var(name) {
                match raw.parse::<T>() {
                    Ok(v) => *into = v,
                    Err(_) => tracing::warn!("ignoring unparseable {name}={raw}"),
                }
            }
        }

        parse_var("TURN_DURATION_SECONDS", &mut self.turn_duration_seconds);
        parse_var("GAME_MAX_ROUNDS", &mut self.game_max_rounds);
        parse_var("MAX_MISTAKES", &mut self.max_mistakes);
        parse_var(
            "MATCHMAKING_BOT_THRESHOLD_SECONDS",
            &mut self.matchmaking_bot_threshold_seconds,
        );
        parse_var(
            "MATCHMAKING_SWEEP_INTERVAL_SECONDS",
            &mut self.matchmaking_sweep_interval_seconds,
        );
        parse_var("MAX_MISTAKE_PROBABILITY", &mut self.max_mistake_probability);
        parse_var("MIN_MISTAKE_PROBABILITY", &mut self.min_mistake_probability);
        parse_var("MAX_TIMEOUT_PROBABILITY", &mut self.max_timeout_probability);
        parse_var("MIN_TIMEOUT_PROBABILITY", &mut self.min_timeout_probability);
        parse_var("LEVEL_CAP_FOR_SCALING", &mut self.level_cap_for_scaling);

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                self.gemini_api_key = Some(key);
            }
        }
    }

    pub fn turn_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.turn_duration_seconds)
    }

    /// Bot display names for a language, falling back to the English list.
    pub fn bot_names_for(&self, language: &str) -> &[String] {
        static FALLBACK: &[String] = &[];
        self.bot_usernames
            .get(language)
            .or_else(|| self.bot_usernames.get("en"))
            .map(|v| v.as_slice())
            .unwrap_or(FALLBACK)
    }
}
