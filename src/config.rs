use crate::error::{Error, Result};
use crate::state::SessionOptions;
use crate::util::{env_non_empty, env_override_f32, env_override_usize, is_local_endpoint_url};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_CONTEXT_ENTRIES: usize = 64;
const LOCAL_DEFAULT_MAX_FOLLOWUP_ROUNDS: usize = 12;
const REMOTE_DEFAULT_MAX_FOLLOWUP_ROUNDS: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub instructions: Option<String>,
    pub history_path: Option<PathBuf>,
    pub temperature: f32,
    pub max_context_entries: usize,
    pub max_followup_rounds: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = env_non_empty("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let default_rounds = if is_local_endpoint_url(&api_url) {
            LOCAL_DEFAULT_MAX_FOLLOWUP_ROUNDS
        } else {
            REMOTE_DEFAULT_MAX_FOLLOWUP_ROUNDS
        };

        Ok(Self {
            api_key: env_non_empty("OPENAI_API_KEY"),
            model: env_non_empty("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_url,
            instructions: env_non_empty("TURNLOOM_INSTRUCTIONS"),
            history_path: env_non_empty("TURNLOOM_HISTORY_PATH").map(PathBuf::from),
            temperature: env_override_f32("TURNLOOM_TEMPERATURE", DEFAULT_TEMPERATURE, 0.0, 2.0),
            max_context_entries: env_override_usize(
                "TURNLOOM_MAX_CONTEXT_ENTRIES",
                DEFAULT_MAX_CONTEXT_ENTRIES,
                4,
                512,
            ),
            max_followup_rounds: env_override_usize(
                "TURNLOOM_MAX_FOLLOWUP_ROUNDS",
                default_rounds,
                1,
                64,
            ),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "invalid OPENAI_BASE_URL '{}': expected http:// or https:// URL",
                self.api_url
            )));
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            return Err(Error::Config(format!(
                "OPENAI_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            )));
        }

        if self.model.trim().is_empty() {
            return Err(Error::Config("model name must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            model: self.model.clone(),
            system_prompt: self.instructions.clone(),
            temperature: self.temperature,
            max_context_entries: self.max_context_entries,
            max_followup_rounds: self.max_followup_rounds,
            history_path: self.history_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScopedEnv, ENV_LOCK};

    fn remote_config() -> Config {
        Config {
            api_key: Some("sk-test".to_string()),
            model: DEFAULT_MODEL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            instructions: None,
            history_path: None,
            temperature: DEFAULT_TEMPERATURE,
            max_context_entries: DEFAULT_MAX_CONTEXT_ENTRIES,
            max_followup_rounds: REMOTE_DEFAULT_MAX_FOLLOWUP_ROUNDS,
        }
    }

    #[test]
    fn test_load_reads_environment_and_clamps() {
        let _env_lock = ENV_LOCK.blocking_lock();
        let _env = ScopedEnv::new(&[
            ("OPENAI_API_KEY", Some("  sk-live  ")),
            ("OPENAI_BASE_URL", Some("http://localhost:11434/v1")),
            ("OPENAI_MODEL", None),
            ("TURNLOOM_INSTRUCTIONS", Some("Be brief.")),
            ("TURNLOOM_HISTORY_PATH", None),
            ("TURNLOOM_TEMPERATURE", Some("5")),
            ("TURNLOOM_MAX_CONTEXT_ENTRIES", Some("1")),
            ("TURNLOOM_MAX_FOLLOWUP_ROUNDS", None),
        ]);

        let config = Config::load().expect("config should load");
        assert_eq!(config.api_key.as_deref(), Some("sk-live"));
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.instructions.as_deref(), Some("Be brief."));
        assert_eq!(config.temperature, 2.0);
        assert_eq!(config.max_context_entries, 4);
        assert_eq!(config.max_followup_rounds, LOCAL_DEFAULT_MAX_FOLLOWUP_ROUNDS);
    }

    #[test]
    fn test_blank_api_key_is_treated_as_missing() {
        let _env_lock = ENV_LOCK.blocking_lock();
        let _env = ScopedEnv::new(&[
            ("OPENAI_API_KEY", Some("   ")),
            ("OPENAI_BASE_URL", None),
        ]);

        let config = Config::load().expect("config should load");
        assert!(config.api_key.is_none());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = Config {
            api_url: "ftp://example.com/v1".to_string(),
            ..remote_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_allows_local_endpoint_without_key() {
        let config = Config {
            api_key: None,
            api_url: "http://127.0.0.1:8000/v1/chat/completions".to_string(),
            ..remote_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_options_carry_instructions_and_limits() {
        let config = Config {
            instructions: Some("You are terse.".to_string()),
            max_followup_rounds: 3,
            ..remote_config()
        };
        let options = config.session_options();
        assert_eq!(options.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(options.max_followup_rounds, 3);
        assert_eq!(options.model, DEFAULT_MODEL);
    }
}
