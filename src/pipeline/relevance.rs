//! Batched LLM relevance filter for feed sources.
//!
//! Messages are split into batches of at most `batch_size`, each batch is one
//! classification call, and every message comes back with exactly one
//! [`SelectionRecord`]. A batch that cannot be classified fails closed: all of
//! its messages are excluded with reason `classification_error`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{DigestConfig, PromptBook, RetryConfig};
use crate::error::PipelineError;
use crate::llm::retry::with_retry;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::json::extract_json;
use crate::pipeline::types::{Message, SelectionRecord};
use crate::store::Database;

const RESPONSE_FORMAT: &str = r#"You will receive a JSON array of posts. Decide for EVERY post whether it belongs in the digest.

Respond with ONLY valid JSON, no markdown fences, in exactly this shape:
{"results": [{"id": "<post id>", "include": true, "score": 0.0, "reason": "<one short sentence>"}]}

Rules:
- Return exactly one entry per post id you received, and no other ids.
- "score" is your confidence from 0.0 to 1.0 that the post belongs in the digest.
- "include" is your yes/no decision."#;

/// Result of filtering one source.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    /// One record per input message, in input order.
    pub records: Vec<SelectionRecord>,
    /// Batches that exhausted their retries.
    pub failed_batches: usize,
    pub errors: Vec<String>,
}

impl FilterOutcome {
    pub fn included_count(&self) -> usize {
        self.records.iter().filter(|r| r.included).count()
    }

    pub fn classification_failures(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.is_classification_error())
            .count()
    }
}

pub struct RelevanceFilter {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
    retry: RetryConfig,
    timeout: Duration,
    concurrency: usize,
}

impl RelevanceFilter {
    pub fn new(llm: Arc<dyn LlmProvider>, db: Arc<dyn Database>, config: &DigestConfig) -> Self {
        Self {
            llm,
            db,
            retry: config.classification_retry,
            timeout: config.llm_timeout,
            concurrency: config.llm_concurrency.max(1),
        }
    }

    /// Classify `messages` and persist a selection record for each.
    pub async fn filter(
        &self,
        source_id: &str,
        messages: &[Message],
        prompts: &PromptBook,
        batch_size: usize,
        threshold: f64,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        if messages.is_empty() {
            return outcome;
        }

        let batches: Vec<&[Message]> = messages.chunks(batch_size.max(1)).collect();
        let mut results: Vec<(usize, Result<Vec<SelectionRecord>, PipelineError>)> =
            stream::iter(batches.iter().copied().enumerate())
                .map(|(index, batch)| async move {
                    let result = self
                        .classify_batch(source_id, index, batch, prompts, threshold)
                        .await;
                    (index, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        for (index, result) in results {
            match result {
                Ok(records) => outcome.records.extend(records),
                Err(e) => {
                    let err = PipelineError::Classification {
                        source_id: source_id.to_string(),
                        batch: index,
                        reason: e.to_string(),
                    };
                    warn!(
                        source_id,
                        batch = index,
                        message_ids = ?batches[index].iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
                        error = %e,
                        "Batch classification failed, excluding batch"
                    );
                    outcome.failed_batches += 1;
                    outcome.errors.push(err.to_string());
                    outcome.records.extend(
                        batches[index]
                            .iter()
                            .map(|m| SelectionRecord::classification_error(source_id, &m.id)),
                    );
                }
            }
        }

        for record in &outcome.records {
            if let Err(e) = self.db.save_selection(record).await {
                warn!(source_id, message_id = %record.message_id, error = %e, "Failed to persist selection record");
                outcome.errors.push(format!("persist {}: {e}", record.message_id));
            }
        }

        info!(
            source_id,
            messages = messages.len(),
            batches = batches.len(),
            included = outcome.included_count(),
            failed_batches = outcome.failed_batches,
            "Relevance filter complete"
        );
        outcome
    }

    async fn classify_batch(
        &self,
        source_id: &str,
        index: usize,
        batch: &[Message],
        prompts: &PromptBook,
        threshold: f64,
    ) -> Result<Vec<SelectionRecord>, PipelineError> {
        let request = build_request(source_id, batch, prompts);
        let llm = &self.llm;
        debug!(source_id, batch = index, size = batch.len(), "Classifying batch");

        with_retry(self.retry, self.timeout, "classify", |attempt| {
            let request = request.clone();
            async move {
                let response = llm.complete(request).await?;
                parse_response(&response.content, source_id, batch, threshold).inspect_err(|e| {
                    debug!(source_id, batch = index, attempt, error = %e, "Unusable classification");
                })
            }
        })
        .await
    }
}

/// Build the classification request for one batch.
pub fn build_request(source_id: &str, batch: &[Message], prompts: &PromptBook) -> CompletionRequest {
    let posts: Vec<serde_json::Value> = batch
        .iter()
        .map(|m| {
            let mut post = json!({
                "id": m.id,
                "author": m.author,
                "kind": m.kind.as_str(),
                "timestamp": m.timestamp.to_rfc3339(),
                "text": m.text,
                "images": m.attachments,
            });
            if let Some(url) = m.quoted_status_url() {
                post["quoted_status"] = json!(url);
            }
            post
        })
        .collect();

    let system = format!("{}\n\n{RESPONSE_FORMAT}", prompts.system_prompt);
    let account = format!(
        "Guidance for posts from @{source_id}:\n{}",
        prompts.account_prompt(source_id)
    );

    CompletionRequest::new(vec![
        ChatMessage::system(system),
        ChatMessage::system(account),
        ChatMessage::user(serde_json::Value::Array(posts).to_string()),
    ])
    .with_max_tokens(200 + 120 * batch.len() as u32)
    .with_temperature(0.0)
    .with_purpose("classify")
}

#[derive(Debug, Deserialize)]
struct Verdict {
    id: serde_json::Value,
    #[serde(default)]
    include: Option<bool>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VerdictPayload {
    Wrapped { results: Vec<Verdict> },
    Bare(Vec<Verdict>),
}

fn verdict_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Validate a classification reply against the batch it answers.
///
/// Every sent id must appear exactly once, no other ids may appear, and each
/// entry needs `include` or `score`. A `score` wins over `include`.
pub fn parse_response(
    content: &str,
    source_id: &str,
    batch: &[Message],
    threshold: f64,
) -> Result<Vec<SelectionRecord>, PipelineError> {
    let json = extract_json(content);
    let payload: VerdictPayload = serde_json::from_str(&json)
        .map_err(|e| PipelineError::ProtocolViolation(format!("unparseable reply: {e}")))?;
    let verdicts = match payload {
        VerdictPayload::Wrapped { results } => results,
        VerdictPayload::Bare(results) => results,
    };

    let sent: HashSet<&str> = batch.iter().map(|m| m.id.as_str()).collect();
    let mut by_id: HashMap<String, Verdict> = HashMap::with_capacity(verdicts.len());
    for verdict in verdicts {
        let id = verdict_id(&verdict.id).ok_or_else(|| {
            PipelineError::ProtocolViolation(format!("non-scalar id {}", verdict.id))
        })?;
        if !sent.contains(id.as_str()) {
            return Err(PipelineError::ProtocolViolation(format!("unknown id {id}")));
        }
        if verdict.include.is_none() && verdict.score.is_none() {
            return Err(PipelineError::ProtocolViolation(format!(
                "id {id} has neither include nor score"
            )));
        }
        if by_id.insert(id.clone(), verdict).is_some() {
            return Err(PipelineError::ProtocolViolation(format!("duplicate id {id}")));
        }
    }

    let missing: Vec<&str> = batch
        .iter()
        .map(|m| m.id.as_str())
        .filter(|id| !by_id.contains_key(*id))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::ProtocolViolation(format!(
            "missing ids {}",
            missing.join(", ")
        )));
    }

    let now = Utc::now();
    Ok(batch
        .iter()
        .filter_map(|m| by_id.remove(&m.id).map(|v| (m, v)))
        .map(|(m, v)| {
            let included = match v.score {
                Some(score) => score >= threshold,
                None => v.include.unwrap_or(false),
            };
            SelectionRecord {
                source_id: source_id.to_string(),
                message_id: m.id.clone(),
                included,
                reason: v.reason,
                score: v.score,
                evaluated_at: now,
            }
        })
        .collect())
}
