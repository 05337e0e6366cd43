//! Digest reducer: sealed running narrative → short human-facing digest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::info;

use crate::config::{DigestConfig, RetryConfig};
use crate::error::PipelineError;
use crate::llm::retry::with_retry;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{ChannelDigest, RunningSummary};
use crate::store::Database;

const DIGEST_SYSTEM_PROMPT: &str = "You write the chat section of a daily digest. \
Given the running narrative of one channel, write a short summary for a reader who was not there: \
the main topics, decisions and open questions, in at most five concise bullet points. \
Return only the summary.";

/// Channel metadata that goes into a digest alongside the narrative.
#[derive(Debug, Clone)]
pub struct ReduceInput {
    pub date: NaiveDate,
    /// Inclusive `(first, last)` block numbers of this session.
    pub block_range: (u64, u64),
    pub contributing_message_ids: Vec<String>,
}

pub struct DigestReducer {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
    retry: RetryConfig,
    timeout: Duration,
}

pub fn build_digest_request(summary: &RunningSummary) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(DIGEST_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Channel: #{}\n\n=== NARRATIVE ===\n{}",
            summary.channel_id, summary.narrative_text
        )),
    ])
    .with_max_tokens(600)
    .with_temperature(0.2)
    .with_purpose("digest")
}

impl DigestReducer {
    pub fn new(llm: Arc<dyn LlmProvider>, db: Arc<dyn Database>, config: &DigestConfig) -> Self {
        Self {
            llm,
            db,
            retry: config.narrative_retry,
            timeout: config.llm_timeout,
        }
    }

    /// One digest call for the channel, persisted by `(channel_id, date)`.
    pub async fn reduce(
        &self,
        summary: &RunningSummary,
        input: ReduceInput,
    ) -> Result<ChannelDigest, PipelineError> {
        let channel_id = summary.channel_id.as_str();
        let request = build_digest_request(summary);
        let llm = &self.llm;

        let text = with_retry(self.retry, self.timeout, "digest_reduce", |_| {
            let request = request.clone();
            async move {
                let response = llm.complete(request).await?;
                let text = response.content.trim().to_string();
                if text.is_empty() {
                    return Err(PipelineError::ProtocolViolation("empty digest".to_string()));
                }
                Ok(text)
            }
        })
        .await
        .map_err(|e| PipelineError::DigestReduction {
            channel_id: channel_id.to_string(),
            reason: e.to_string(),
        })?;

        let digest = ChannelDigest {
            channel_id: channel_id.to_string(),
            date: input.date,
            summary_text: text,
            source_block_range: input.block_range,
            contributing_message_ids: input.contributing_message_ids,
            created_at: Utc::now(),
        };
        self.db
            .save_digest(&digest)
            .await
            .map_err(|e| PipelineError::StorageUnavailable {
                source_id: channel_id.to_string(),
                reason: e.to_string(),
            })?;

        info!(
            channel_id,
            date = %digest.date,
            blocks = ?digest.source_block_range,
            messages = digest.contributing_message_ids.len(),
            "Channel digest sealed"
        );
        Ok(digest)
    }
}
