use std::time::Duration;

use anyhow::{Context, Result};

use crate::retrieval::{DEFAULT_CONTEXT_BUDGET, DEFAULT_TOP_K};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub anthropic_api_key: String,
    pub worker_count: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub lease_ttl: Duration,
    /// How often the daemon rescans for queued jobs it does not know about.
    pub queue_scan_interval: Duration,
    pub retrieval_top_k: usize,
    pub context_char_budget: usize,
    /// Optional path to a JSON rubric file overriding the built-in set.
    pub rubric_path: Option<String>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            worker_count: parse_env("WORKER_COUNT", 2)?,
            max_attempts: parse_env("LLM_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(parse_env("LLM_RETRY_BASE_DELAY_MS", 1000)?),
            lease_ttl: Duration::from_secs(parse_env("JOB_LEASE_TTL_SECS", 600)?),
            queue_scan_interval: Duration::from_secs(parse_env("QUEUE_SCAN_SECS", 30)?),
            retrieval_top_k: parse_env("RETRIEVAL_TOP_K", DEFAULT_TOP_K)?,
            context_char_budget: parse_env("CONTEXT_CHAR_BUDGET", DEFAULT_CONTEXT_BUDGET)?,
            rubric_path: std::env::var("RUBRIC_PATH").ok(),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Environment variable '{key}' is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_falls_back_to_default_when_unset() {
        let value: usize = parse_env("EVALUATOR_TEST_UNSET_KNOB", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        std::env::set_var("EVALUATOR_TEST_GARBAGE_KNOB", "not-a-number");
        let result: Result<u32> = parse_env("EVALUATOR_TEST_GARBAGE_KNOB", 1);
        assert!(result.is_err());
        std::env::remove_var("EVALUATOR_TEST_GARBAGE_KNOB");
    }
}
