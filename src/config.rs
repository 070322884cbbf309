use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::provider::gemini::{GeminiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How `POST /ask` delivers the generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskMode {
    Atomic,
    Stream,
}

/// Body shape of a successful atomic reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub mode: AskMode,
    pub output: OutputFormat,
    pub gemini: GeminiConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = var("GEMINI_API_KEY").ok_or(ConfigError::MissingVar("GEMINI_API_KEY"))?;

        let port = match var("PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                value,
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let timeout_ms = match var("GEMINI_TIMEOUT_MS") {
            Some(value) => value.parse::<u64>().map_err(|e| ConfigError::Invalid {
                name: "GEMINI_TIMEOUT_MS",
                value,
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEOUT_MS,
        };

        let mode = match var("ASK_MODE") {
            None => AskMode::Stream,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "stream" => AskMode::Stream,
                "atomic" => AskMode::Atomic,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "ASK_MODE",
                        value,
                        reason: "expected `stream` or `atomic`".to_string(),
                    })
                }
            },
        };

        let output = match var("ASK_OUTPUT") {
            None => OutputFormat::Json,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "json" => OutputFormat::Json,
                "text" => OutputFormat::Text,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "ASK_OUTPUT",
                        value,
                        reason: "expected `json` or `text`".to_string(),
                    })
                }
            },
        };

        Ok(Self {
            port,
            mode,
            output,
            gemini: GeminiConfig {
                api_key,
                model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: var("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                timeout: Duration::from_millis(timeout_ms),
            },
        })
    }
}
