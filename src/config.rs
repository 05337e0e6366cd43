//! Configuration types.
//!
//! Values come from `DIGEST_*` environment variables with defaults; prompts
//! come from an optional JSON file.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Key in [`PromptBook::accounts`] used when a source has no prompt of its own.
pub const DEFAULT_PROMPT_KEY: &str = "default";

/// Built-in system prompt for relevance classification.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You curate a daily newsletter. \
Include posts with original information, announcements, substantive analysis or \
notable links. Exclude low-effort replies, engagement bait, giveaways and pure \
self-promotion. Judge each post on its own merits.";

/// Built-in account prompt used when neither the source nor the default key is configured.
pub const DEFAULT_ACCOUNT_PROMPT: &str =
    "No account-specific guidance. Apply the general rules.";

/// Core digest configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Lookback window in hours.
    pub window_hours: u32,
    /// Maximum new messages kept per source per run (most recent win).
    pub max_per_source: Option<usize>,
    /// Messages per summarizer block.
    pub block_size: usize,
    /// Messages shared between consecutive blocks.
    pub overlap_size: usize,
    /// Channels with fewer new messages are skipped.
    pub min_messages_for_summary: usize,
    /// Maximum messages per classification call.
    pub llm_max_batch: usize,
    /// Score at or above which a scored message is included.
    pub llm_include_threshold: f64,
    /// Hard cap on the running narrative, in characters.
    pub max_narrative_chars: usize,
    /// Concurrent classification calls per source.
    pub llm_concurrency: usize,
    /// Channels summarised concurrently.
    pub channel_concurrency: usize,
    /// Timeout for a single LLM call.
    pub llm_timeout: Duration,
    /// Per-channel lock lifetime; a crashed run's lock expires after this.
    pub lock_ttl: Duration,
    /// Jittered delay range between source fetches (milliseconds).
    pub fetch_delay_ms: (u64, u64),
    /// Retry policy for classification calls.
    pub classification_retry: RetryConfig,
    /// Retry policy for narrative and digest calls.
    pub narrative_retry: RetryConfig,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            max_per_source: Some(10),
            block_size: 40,
            overlap_size: 5,
            min_messages_for_summary: 10,
            llm_max_batch: 10,
            llm_include_threshold: 0.5,
            max_narrative_chars: 4000,
            llm_concurrency: 4,
            channel_concurrency: 4,
            llm_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(1800), // 30 minutes
            fetch_delay_ms: (300, 800),
            classification_retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1000),
            },
            narrative_retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1000),
            },
        }
    }
}

impl DigestConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_per_source = match std::env::var("DIGEST_MAX_PER_SOURCE") {
            Ok(v) if v.trim() == "0" || v.trim().eq_ignore_ascii_case("none") => None,
            Ok(v) => Some(parse_value("DIGEST_MAX_PER_SOURCE", &v)?),
            Err(_) => defaults.max_per_source,
        };

        let config = Self {
            window_hours: env_or("DIGEST_WINDOW_HOURS", defaults.window_hours)?,
            max_per_source,
            block_size: env_or("DIGEST_BLOCK_SIZE", defaults.block_size)?,
            overlap_size: env_or("DIGEST_OVERLAP_SIZE", defaults.overlap_size)?,
            min_messages_for_summary: env_or(
                "DIGEST_MIN_MESSAGES_FOR_SUMMARY",
                defaults.min_messages_for_summary,
            )?,
            llm_max_batch: env_or("DIGEST_LLM_MAX_BATCH", defaults.llm_max_batch)?,
            llm_include_threshold: env_or(
                "DIGEST_LLM_INCLUDE_THRESHOLD",
                defaults.llm_include_threshold,
            )?,
            max_narrative_chars: env_or(
                "DIGEST_MAX_NARRATIVE_CHARS",
                defaults.max_narrative_chars,
            )?,
            llm_concurrency: env_or("DIGEST_LLM_CONCURRENCY", defaults.llm_concurrency)?,
            channel_concurrency: env_or(
                "DIGEST_CHANNEL_CONCURRENCY",
                defaults.channel_concurrency,
            )?,
            llm_timeout: Duration::from_secs(env_or(
                "DIGEST_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            lock_ttl: Duration::from_secs(env_or(
                "DIGEST_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )?),
            fetch_delay_ms: (
                env_or("DIGEST_FETCH_DELAY_MIN_MS", defaults.fetch_delay_ms.0)?,
                env_or("DIGEST_FETCH_DELAY_MAX_MS", defaults.fetch_delay_ms.1)?,
            ),
            classification_retry: defaults.classification_retry,
            narrative_retry: RetryConfig {
                max_attempts: env_or(
                    "DIGEST_NARRATIVE_MAX_ATTEMPTS",
                    defaults.narrative_retry.max_attempts,
                )?,
                ..defaults.narrative_retry
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(invalid("block_size", "must be at least 1"));
        }
        if self.overlap_size >= self.block_size {
            return Err(invalid(
                "overlap_size",
                format!(
                    "must be smaller than block_size ({} >= {})",
                    self.overlap_size, self.block_size
                ),
            ));
        }
        if self.llm_max_batch == 0 {
            return Err(invalid("llm_max_batch", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.llm_include_threshold) {
            return Err(invalid("llm_include_threshold", "must be within [0, 1]"));
        }
        if self.max_narrative_chars < 16 {
            return Err(invalid("max_narrative_chars", "must be at least 16"));
        }
        if self.llm_concurrency == 0 || self.channel_concurrency == 0 {
            return Err(invalid("concurrency", "limits must be at least 1"));
        }
        if self.fetch_delay_ms.0 > self.fetch_delay_ms.1 {
            return Err(invalid("fetch_delay_ms", "min is greater than max"));
        }
        if self.classification_retry.max_attempts == 0 || self.narrative_retry.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
}

impl RetryConfig {
    /// No waiting between attempts (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }
}

/// Per-source settings for relevance classification.
///
/// Account prompts and post caps are explicit maps keyed by source id; lookups
/// fall back to the [`DEFAULT_PROMPT_KEY`] entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBook {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub accounts: HashMap<String, String>,
    /// Overrides `DigestConfig::max_per_source` for the given sources.
    #[serde(default)]
    pub max_posts: HashMap<String, usize>,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for PromptBook {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            accounts: HashMap::new(),
            max_posts: HashMap::new(),
        }
    }
}

impl PromptBook {
    /// Load prompts from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }

    /// Account prompt for a source, or the default one.
    pub fn account_prompt(&self, source_id: &str) -> &str {
        self.accounts
            .get(source_id)
            .or_else(|| self.accounts.get(DEFAULT_PROMPT_KEY))
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACCOUNT_PROMPT)
    }

    /// Post cap for a source: its own entry, then the default entry, then
    /// `fallback`.
    pub fn max_posts(&self, source_id: &str, fallback: Option<usize>) -> Option<usize> {
        self.max_posts
            .get(source_id)
            .or_else(|| self.max_posts.get(DEFAULT_PROMPT_KEY))
            .copied()
            .or(fallback)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => parse_value(key, &v),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DigestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 40);
        assert_eq!(config.overlap_size, 5);
        assert_eq!(config.llm_max_batch, 10);
    }

    #[test]
    fn overlap_must_be_smaller_than_block() {
        let config = DigestConfig {
            block_size: 5,
            overlap_size: 5,
            ..DigestConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "overlap_size"
        ));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let config = DigestConfig {
            llm_include_threshold: 1.5,
            ..DigestConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_rejected() {
        let config = DigestConfig {
            llm_max_batch: 0,
            ..DigestConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<usize>("DIGEST_BLOCK_SIZE", "forty").unwrap_err();
        assert!(err.to_string().contains("DIGEST_BLOCK_SIZE"));
    }

    #[test]
    fn account_prompt_prefers_source_entry() {
        let mut book = PromptBook::default();
        book.accounts.insert("rustlang".into(), "Release notes only.".into());
        book.accounts.insert(DEFAULT_PROMPT_KEY.into(), "Be strict.".into());
        assert_eq!(book.account_prompt("rustlang"), "Release notes only.");
        assert_eq!(book.account_prompt("someone_else"), "Be strict.");
    }

    #[test]
    fn account_prompt_builtin_fallback() {
        let book = PromptBook::default();
        assert_eq!(book.account_prompt("anyone"), DEFAULT_ACCOUNT_PROMPT);
    }

    #[test]
    fn max_posts_lookup_order() {
        let mut book = PromptBook::default();
        assert_eq!(book.max_posts("rustlang", Some(10)), Some(10));
        assert_eq!(book.max_posts("rustlang", None), None);

        book.max_posts.insert(DEFAULT_PROMPT_KEY.into(), 5);
        assert_eq!(book.max_posts("rustlang", Some(10)), Some(5));

        book.max_posts.insert("rustlang".into(), 3);
        assert_eq!(book.max_posts("rustlang", Some(10)), Some(3));
        assert_eq!(book.max_posts("tokio_rs", None), Some(5));
    }

    #[test]
    fn prompt_book_from_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("prompts.json");
        std::fs::write(
            &path,
            r#"{"accounts": {"default": "Only launches.", "tokio_rs": "Releases."},
                "max_posts": {"tokio_rs": 4}}"#,
        )
        .unwrap();
        let book = PromptBook::load(&path).unwrap();
        assert_eq!(book.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(book.account_prompt("tokio_rs"), "Releases.");
        assert_eq!(book.account_prompt("other"), "Only launches.");
        assert_eq!(book.max_posts("tokio_rs", Some(10)), Some(4));
        assert_eq!(book.max_posts("other", Some(10)), Some(10));
    }
}
