//! LLM integration for AI Digest.
//!
//! The pipeline talks to models only through [`LlmProvider`]. The production
//! adapter is [`AnthropicProvider`]; tests inject deterministic stubs.

pub mod anthropic;
pub mod provider;
pub mod retry;
pub mod usage;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use usage::{LlmUsage, MeteredProvider};

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::error::{ConfigError, LlmError};

/// Default model when `DIGEST_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Read `ANTHROPIC_API_KEY` and `DIGEST_MODEL`.
    pub fn from_env(timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
        let model = std::env::var("DIGEST_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            api_key: secrecy::SecretString::from(api_key),
            model,
            timeout,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let api_key = secrecy::SecretString::from(config.api_key.expose_secret().to_string());
    let provider = AnthropicProvider::new(api_key, &config.model, config.timeout)?;
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(provider))
}
