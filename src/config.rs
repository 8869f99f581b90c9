use std::env;
use std::str::FromStr;
use std::time::Duration;

use eyre::{Result, WrapErr, eyre};
use url::Url;

use crate::relay::conversation_state::DEFAULT_MAX_TURNS;
use crate::relay::prompt::SYSTEM_PROMPT;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";

/// Settings of the completion API client.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: Url,
    /// Per-request timeout; `None` waits as long as the API takes.
    pub timeout: Option<Duration>,
}

/// Settings of the relay itself.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub system_prompt: String,
    pub history_limit: usize,
}

impl CompletionConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = required(&lookup, "OPENAI_API_KEY")?;
        let model = lookup("OPENAI_MODEL")
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let max_tokens = parsed(&lookup, "OPENAI_MAX_TOKENS")?.unwrap_or(DEFAULT_MAX_TOKENS);
        let base_url = base_url(lookup("OPENAI_BASE_URL").as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let timeout = parsed::<u64>(&lookup, "OPENAI_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            api_key,
            model,
            max_tokens,
            base_url,
            timeout,
        })
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let system_prompt = lookup("SYSTEM_PROMPT")
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| SYSTEM_PROMPT.to_string());
        let history_limit = parsed(&lookup, "HISTORY_LIMIT")?.unwrap_or(DEFAULT_MAX_TURNS);

        Ok(Self {
            system_prompt,
            history_limit,
        })
    }
}

pub fn telegram_token_from_env() -> Result<String> {
    required(&|key: &str| env::var(key).ok(), "TELEGRAM_TOKEN")
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| eyre!("{} environment variable not set", key))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .wrap_err_with(|| format!("invalid value for {}: {:?}", key, value))
        })
        .transpose()
}

// `Url::join` drops the last path segment unless it ends with a slash.
fn base_url(raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).wrap_err_with(|| format!("invalid OPENAI_BASE_URL: {}", raw))
}
