//! Token usage accounting for a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Point-in-time usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LlmUsage {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LlmUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Usage accrued since an earlier snapshot.
    pub fn since(&self, earlier: &LlmUsage) -> LlmUsage {
        LlmUsage {
            calls: self.calls.saturating_sub(earlier.calls),
            failed_calls: self.failed_calls.saturating_sub(earlier.failed_calls),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }

    /// Estimated spend given (input, output) cost per token.
    pub fn estimated_cost(&self, cost_per_token: (Decimal, Decimal)) -> Decimal {
        let (input, output) = cost_per_token;
        input * Decimal::from(self.input_tokens) + output * Decimal::from(self.output_tokens)
    }
}

/// Provider wrapper that counts calls and tokens.
pub struct MeteredProvider {
    inner: Arc<dyn LlmProvider>,
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl MeteredProvider {
    pub fn new(inner: Arc<dyn LlmProvider>) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    pub fn usage(&self) -> LlmUsage {
        LlmUsage {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LlmProvider for MeteredProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.complete(request).await {
            Ok(response) => {
                self.input_tokens
                    .fetch_add(u64::from(response.input_tokens), Ordering::Relaxed);
                self.output_tokens
                    .fetch_add(u64::from(response.output_tokens), Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
