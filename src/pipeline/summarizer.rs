//! Block-based streaming summarizer.
//!
//! A channel's ordered messages are cut into overlapping blocks and folded one
//! block at a time into a bounded running narrative. The narrative is
//! persisted after every block, so an interrupted run resumes at the next
//! block instead of starting over.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{DigestConfig, RetryConfig};
use crate::error::PipelineError;
use crate::llm::retry::with_retry;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Message, RunningSummary};
use crate::store::Database;

const NARRATIVE_SYSTEM_PROMPT: &str = "You maintain a running narrative summary of a chat channel. \
You receive the existing narrative and the next block of messages in chronological order. \
Return the updated narrative as plain prose: keep previously established facts unless the new \
messages contradict them, add the new facts, decisions, questions and events, and compress older \
detail so the whole narrative stays short. Never list messages one by one. Return only the narrative.";

const MARKER: &str = "…";

/// Where a channel's fold stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerState {
    /// Nothing folded for this channel yet.
    Empty,
    /// Some blocks folded; more remain or a block failed.
    Accumulating,
    /// Every block folded; ready for the reducer.
    Sealed,
    /// Too few messages; nothing was folded.
    InsufficientActivity,
}

/// Result of folding one channel.
#[derive(Debug)]
pub struct ChannelFold {
    pub channel_id: String,
    pub state: SummarizerState,
    /// Latest persisted summary (may predate this session).
    pub summary: Option<RunningSummary>,
    /// First block number belonging to this session's message set.
    pub first_block: Option<u64>,
    /// Last block number persisted for this session's message set.
    pub last_block: Option<u64>,
    /// Blocks folded by this call.
    pub folded_blocks: usize,
    /// Blocks already folded by an earlier, interrupted call.
    pub skipped_blocks: usize,
    pub error: Option<PipelineError>,
}

impl ChannelFold {
    fn new(channel_id: &str, summary: Option<RunningSummary>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            state: if summary.is_some() {
                SummarizerState::Accumulating
            } else {
                SummarizerState::Empty
            },
            summary,
            first_block: None,
            last_block: None,
            folded_blocks: 0,
            skipped_blocks: 0,
            error: None,
        }
    }

    /// Inclusive block range covered by this session, if any block exists.
    pub fn block_range(&self) -> Option<(u64, u64)> {
        Some((self.first_block?, self.last_block?))
    }
}

/// Partition `n` messages into blocks of `block_size` where each block
/// starts `overlap` messages before the previous block's end.
///
/// The final block may be shorter. `overlap` must be smaller than
/// `block_size`.
pub fn plan_blocks(n: usize, block_size: usize, overlap: usize) -> Vec<Range<usize>> {
    let block_size = block_size.max(1);
    let stride = block_size.saturating_sub(overlap).max(1);
    let mut blocks = Vec::new();
    let mut start = 0;
    while start < n {
        let end = (start + block_size).min(n);
        blocks.push(start..end);
        if end == n {
            break;
        }
        start += stride;
    }
    blocks
}

/// Cut the oldest part of `text` so it fits in `max_chars` characters.
///
/// Keeps the tail, starting at a paragraph, sentence or word boundary when
/// one is close, and marks the cut with a leading ellipsis.
pub fn truncate_oldest(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(MARKER.chars().count());
    let start = text
        .char_indices()
        .nth(total - budget)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail = &text[start..];

    // Only snap to a boundary within the first half of the tail.
    let limit = tail.len() / 2;
    let boundary = tail
        .find("\n\n")
        .filter(|&i| i <= limit)
        .map(|i| i + 2)
        .or_else(|| {
            [". ", "! ", "? ", ".\n"]
                .iter()
                .filter_map(|p| tail.find(*p))
                .min()
                .filter(|&i| i <= limit)
                .map(|i| i + 2)
        })
        .or_else(|| {
            tail.char_indices()
                .find(|(_, c)| c.is_whitespace())
                .filter(|&(i, _)| i <= limit)
                .map(|(i, c)| i + c.len_utf8())
        })
        .unwrap_or(0);

    let kept = tail[boundary..].trim_start();
    format!("{MARKER}{kept}")
}

fn format_block(block: &[Message], context_len: usize) -> String {
    let mut out = String::new();
    for (i, msg) in block.iter().enumerate() {
        if i == 0 && context_len > 0 {
            out.push_str("(already summarized, for context)\n");
        }
        if i == context_len && context_len > 0 {
            out.push_str("(new)\n");
        }
        out.push_str(&format!(
            "[{}] {}: {}",
            msg.timestamp.format("%Y-%m-%d %H:%M"),
            msg.author,
            msg.text
        ));
        if !msg.attachments.is_empty() {
            out.push_str(&format!(" [{} attachment(s)]", msg.attachments.len()));
        }
        out.push('\n');
    }
    out
}

/// Narrative-update request for one block.
pub fn build_narrative_request(
    narrative: &str,
    block: &[Message],
    context_len: usize,
    max_chars: usize,
) -> CompletionRequest {
    let mut content = String::new();
    if !narrative.is_empty() {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(narrative);
        content.push_str("\n\n");
    }
    content.push_str("=== NEW MESSAGES ===\n");
    content.push_str(&format_block(block, context_len));

    CompletionRequest::new(vec![
        ChatMessage::system(format!(
            "{NARRATIVE_SYSTEM_PROMPT}\nThe narrative must not exceed {max_chars} characters."
        )),
        ChatMessage::user(content),
    ])
    .with_max_tokens(((max_chars / 3) as u32).max(256))
    .with_temperature(0.2)
    .with_purpose("narrative")
}

fn build_compression_request(narrative: &str, max_chars: usize) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(format!(
            "Rewrite the following channel narrative in at most {max_chars} characters. \
             Keep the most important facts and the most recent events; drop minor and older \
             detail. Return only the rewritten narrative."
        )),
        ChatMessage::user(narrative.to_string()),
    ])
    .with_max_tokens(((max_chars / 3) as u32).max(256))
    .with_temperature(0.0)
    .with_purpose("narrative_compress")
}

pub struct BlockSummarizer {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
    block_size: usize,
    overlap_size: usize,
    min_messages: usize,
    max_chars: usize,
    retry: RetryConfig,
    timeout: Duration,
}

impl BlockSummarizer {
    pub fn new(llm: Arc<dyn LlmProvider>, db: Arc<dyn Database>, config: &DigestConfig) -> Self {
        Self {
            llm,
            db,
            block_size: config.block_size,
            overlap_size: config.overlap_size,
            min_messages: config.min_messages_for_summary,
            max_chars: config.max_narrative_chars,
            retry: config.narrative_retry,
            timeout: config.llm_timeout,
        }
    }

    /// Fold a channel's unconsumed messages (chronological) into its running
    /// narrative.
    ///
    /// Narrative failures are reported in [`ChannelFold::error`]; only
    /// storage failures are returned as `Err`.
    pub async fn summarize_channel(
        &self,
        channel_id: &str,
        messages: &[Message],
    ) -> Result<ChannelFold, PipelineError> {
        if messages.len() < self.min_messages {
            info!(
                channel_id,
                messages = messages.len(),
                min = self.min_messages,
                "Insufficient activity, skipping channel"
            );
            let mut fold = ChannelFold::new(channel_id, None);
            fold.state = SummarizerState::InsufficientActivity;
            return Ok(fold);
        }

        let existing = self
            .db
            .get_running_summary(channel_id)
            .await
            .map_err(|e| storage_error(channel_id, e))?;
        let mut fold = ChannelFold::new(channel_id, existing.clone());

        // Resume after the last persisted message, replaying its overlap as context.
        let resume_at = existing.as_ref().and_then(|s| {
            messages
                .iter()
                .position(|m| m.id == s.last_message_id_included)
        });
        let (offset, first_context) = match resume_at {
            Some(p) => {
                let start = (p + 1).saturating_sub(self.overlap_size);
                (start, p + 1 - start)
            }
            None => (0, 0),
        };

        let mut next_block = existing.as_ref().map(|s| s.block_number + 1).unwrap_or(0);
        if let Some(s) = &existing
            && resume_at.is_some()
        {
            let backlog: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            let prior: Vec<u64> = self
                .db
                .running_summary_history(channel_id)
                .await
                .map_err(|e| storage_error(channel_id, e))?
                .iter()
                .filter(|h| backlog.contains(h.last_message_id_included.as_str()))
                .map(|h| h.block_number)
                .collect();
            fold.skipped_blocks = prior.len();
            fold.first_block = Some(prior.iter().copied().min().unwrap_or(s.block_number));
            fold.last_block = Some(s.block_number);
            info!(
                channel_id,
                skipped = prior.len(),
                resume_block = next_block,
                "Resuming channel"
            );
        }

        let remaining = &messages[offset..];
        let blocks = if remaining.len() > first_context {
            plan_blocks(remaining.len(), self.block_size, self.overlap_size)
        } else {
            Vec::new()
        };

        let mut narrative = existing
            .as_ref()
            .map(|s| s.narrative_text.clone())
            .unwrap_or_default();

        for (i, range) in blocks.iter().enumerate() {
            let block = &remaining[range.clone()];
            let context_len = if i == 0 { first_context } else { self.overlap_size };

            let updated = match self
                .fold_block(channel_id, next_block, &narrative, block, context_len)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    error!(
                        channel_id,
                        block_number = next_block,
                        first_message = %block[0].id,
                        error = %e,
                        "Narrative update failed, stopping channel"
                    );
                    fold.error = Some(PipelineError::NarrativeUpdate {
                        channel_id: channel_id.to_string(),
                        block_number: next_block,
                        reason: e.to_string(),
                    });
                    return Ok(fold);
                }
            };

            let Some(last) = block.last() else { continue };
            let summary = RunningSummary {
                channel_id: channel_id.to_string(),
                block_number: next_block,
                narrative_text: updated,
                last_message_id_included: last.id.clone(),
                updated_at: Utc::now(),
            };
            self.db
                .save_running_summary(&summary)
                .await
                .map_err(|e| storage_error(channel_id, e))?;

            debug!(
                channel_id,
                block_number = next_block,
                range = ?((range.start + offset)..(range.end + offset)),
                chars = summary.narrative_text.chars().count(),
                "Block folded"
            );
            fold.first_block.get_or_insert(next_block);
            fold.last_block = Some(next_block);
            fold.folded_blocks += 1;
            fold.state = SummarizerState::Accumulating;
            narrative = summary.narrative_text.clone();
            fold.summary = Some(summary);
            next_block += 1;
        }

        fold.state = SummarizerState::Sealed;
        info!(
            channel_id,
            folded = fold.folded_blocks,
            skipped = fold.skipped_blocks,
            "Channel sealed"
        );
        Ok(fold)
    }

    /// One narrative update, bounded to `max_chars`.
    async fn fold_block(
        &self,
        channel_id: &str,
        block_number: u64,
        narrative: &str,
        block: &[Message],
        context_len: usize,
    ) -> Result<String, PipelineError> {
        let request = build_narrative_request(narrative, block, context_len, self.max_chars);
        let text = self.complete_text(request, "narrative_update").await?;
        if text.chars().count() <= self.max_chars {
            return Ok(text);
        }

        warn!(
            channel_id,
            block_number,
            chars = text.chars().count(),
            max = self.max_chars,
            "Narrative over cap, asking for compression"
        );
        let compressed = match self
            .complete_text(
                build_compression_request(&text, self.max_chars),
                "narrative_compress",
            )
            .await
        {
            Ok(c) if c.chars().count() <= self.max_chars => return Ok(c),
            Ok(c) => c,
            Err(e) => {
                warn!(channel_id, block_number, error = %e, "Compression failed");
                text
            }
        };

        warn!(channel_id, block_number, "Truncating oldest narrative content");
        Ok(truncate_oldest(&compressed, self.max_chars))
    }

    /// Retried completion that must produce non-empty text.
    async fn complete_text(
        &self,
        request: CompletionRequest,
        operation: &str,
    ) -> Result<String, PipelineError> {
        let llm = &self.llm;
        with_retry(self.retry, self.timeout, operation, |_| {
            let request = request.clone();
            async move {
                let response = llm.complete(request).await?;
                let text = response.content.trim().to_string();
                if text.is_empty() {
                    return Err(PipelineError::ProtocolViolation(
                        "empty narrative".to_string(),
                    ));
                }
                Ok(text)
            }
        })
        .await
    }
}

fn storage_error(channel_id: &str, e: crate::error::DatabaseError) -> PipelineError {
    PipelineError::StorageUnavailable {
        source_id: channel_id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason, Role};
    use crate::pipeline::types::MessageKind;
    use crate::store::LibSqlBackend;

    fn messages(n: usize) -> Vec<Message> {
        let base: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        (0..n)
            .map(|i| Message {
                id: format!("m{i:03}"),
                source_id: "general".into(),
                author: format!("user{}", i % 4),
                timestamp: base + ChronoDuration::minutes(i as i64),
                text: format!("message number {i}"),
                attachments: vec![],
                thread_id: None,
                kind: MessageKind::Normal,
            })
            .collect()
    }

    fn reply(content: impl Into<String>) -> CompletionResponse {
        CompletionResponse {
            content: content.into(),
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            response_id: None,
        }
    }

    fn user_text(request: &CompletionRequest) -> String {
        request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Returns a short narrative naming the call count. Fails every call
    /// whose index is in `fail_calls`.
    struct CountingLlm {
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
        requests: Mutex<Vec<String>>,
    }

    impl CountingLlm {
        fn new() -> Self {
            Self::failing(vec![])
        }

        fn failing(fail_calls: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_calls,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for CountingLlm {
        fn model_name(&self) -> &str {
            "counting-stub"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(user_text(&request));
            if self.fail_calls.contains(&n) {
                return Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "boom".into(),
                });
            }
            Ok(reply(format!("narrative after call {n}")))
        }
    }

    /// Echoes its whole input back, so the narrative only ever grows.
    struct AppendingLlm;

    #[async_trait]
    impl LlmProvider for AppendingLlm {
        fn model_name(&self) -> &str {
            "appending-stub"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(reply(format!("{} More events happened.", user_text(&request))))
        }
    }

    /// Always answers with an over-long narrative of NBSP-joined words.
    struct NbspLlm;

    #[async_trait]
    impl LlmProvider for NbspLlm {
        fn model_name(&self) -> &str {
            "nbsp-stub"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(reply(vec!["word"; 400].join("\u{a0}")))
        }
    }

    fn config() -> DigestConfig {
        DigestConfig {
            narrative_retry: RetryConfig::immediate(3),
            ..DigestConfig::default()
        }
    }

    async fn store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[test]
    fn plan_for_93_messages() {
        assert_eq!(plan_blocks(93, 40, 5), vec![0..40, 35..75, 70..93]);
    }

    #[test]
    fn second_block_starts_overlap_before_first_end() {
        for n in [45, 60, 80, 200] {
            let blocks = plan_blocks(n, 40, 5);
            assert_eq!(blocks[1].start, 35, "n = {n}");
            for pair in blocks.windows(2) {
                assert_eq!(pair[1].start, pair[0].end - 5);
            }
            assert_eq!(blocks.last().unwrap().end, n);
        }
    }

    #[test]
    fn plan_edge_cases() {
        assert!(plan_blocks(0, 40, 5).is_empty());
        assert_eq!(plan_blocks(10, 40, 5), vec![0..10]);
        assert_eq!(plan_blocks(40, 40, 5), vec![0..40]);
        assert_eq!(plan_blocks(41, 40, 5), vec![0..40, 35..41]);
    }

    #[test]
    fn truncate_keeps_tail_within_cap() {
        let text = "Old news about the release. Another old sentence. \
                    Recent discussion about the migration plan. Latest: the deploy is done.";
        for cap in [20, 40, 64, 100] {
            let out = truncate_oldest(text, cap);
            assert!(out.chars().count() <= cap, "cap {cap}: {out}");
            assert!(out.starts_with(MARKER));
            assert!(text.ends_with(out.trim_start_matches(MARKER)));
        }
        assert_eq!(truncate_oldest("short", 100), "short");
    }

    #[test]
    fn truncate_prefers_sentence_boundary() {
        let text = "First sentence is long and old. Second sentence stays.";
        let out = truncate_oldest(text, 30);
        assert_eq!(out, "…Second sentence stays.");
    }

    #[test]
    fn truncate_handles_multibyte() {
        let text = "é".repeat(50);
        let out = truncate_oldest(&text, 10);
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn truncate_snaps_after_multibyte_whitespace() {
        let text = vec!["word"; 100].join("\u{a0}");
        let out = truncate_oldest(&text, 50);
        assert!(out.chars().count() <= 50);
        assert!(out.starts_with("…word"));

        let thin = vec!["mot"; 80].join("\u{2009}");
        assert!(truncate_oldest(&thin, 40).chars().count() <= 40);
    }

    #[test]
    fn request_includes_existing_summary() {
        let msgs = messages(3);
        let request = build_narrative_request("Earlier: a vote.", &msgs, 1, 500);
        let user = user_text(&request);
        assert!(user.contains("=== EXISTING SUMMARY ===\nEarlier: a vote."));
        assert!(user.contains("(already summarized, for context)"));
        assert!(user.contains("user1: message number 1"));

        let first = build_narrative_request("", &msgs, 0, 500);
        assert!(!user_text(&first).contains("EXISTING SUMMARY"));
    }

    #[tokio::test]
    async fn ninety_three_messages_fold_into_three_blocks() {
        let llm = Arc::new(CountingLlm::new());
        let db = store().await;
        let summarizer = BlockSummarizer::new(llm.clone(), db.clone(), &config());
        let msgs = messages(93);

        let fold = summarizer.summarize_channel("general", &msgs).await.unwrap();

        assert_eq!(fold.state, SummarizerState::Sealed);
        assert_eq!(fold.folded_blocks, 3);
        assert_eq!(fold.block_range(), Some((0, 2)));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

        let history = db.running_summary_history("general").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].last_message_id_included, "m039");
        assert_eq!(history[1].last_message_id_included, "m074");
        assert_eq!(history[2].last_message_id_included, "m092");

        let current = db.get_running_summary("general").await.unwrap().unwrap();
        assert_eq!(current.block_number, 2);

        // Block 2 saw block 1's narrative and started at message 35.
        let requests = llm.requests.lock().unwrap();
        assert!(requests[1].contains("narrative after call 0"));
        assert!(requests[1].contains("message number 35\n"));
        assert!(!requests[1].contains("message number 34\n"));
    }

    #[tokio::test]
    async fn insufficient_activity_makes_no_call() {
        let llm = Arc::new(CountingLlm::new());
        let db = store().await;
        let summarizer = BlockSummarizer::new(llm.clone(), db.clone(), &config());

        let fold = summarizer
            .summarize_channel("general", &messages(4))
            .await
            .unwrap();

        assert_eq!(fold.state, SummarizerState::InsufficientActivity);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert!(db.get_running_summary("general").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_skips_persisted_blocks() {
        let db = store().await;
        let msgs = messages(93);

        // Exhaust all 3 attempts on the second block.
        let crashing = Arc::new(CountingLlm::failing(vec![1, 2, 3]));
        let first = BlockSummarizer::new(crashing.clone(), db.clone(), &config())
            .summarize_channel("general", &msgs)
            .await
            .unwrap();
        assert_eq!(first.folded_blocks, 1);
        assert_eq!(first.state, SummarizerState::Accumulating);
        assert!(matches!(
            first.error,
            Some(PipelineError::NarrativeUpdate { block_number: 1, .. })
        ));
        let after_crash = db.get_running_summary("general").await.unwrap().unwrap();
        assert_eq!(after_crash.block_number, 0);

        let healthy = Arc::new(CountingLlm::new());
        let second = BlockSummarizer::new(healthy.clone(), db.clone(), &config())
            .summarize_channel("general", &msgs)
            .await
            .unwrap();

        assert_eq!(second.state, SummarizerState::Sealed);
        assert_eq!(second.skipped_blocks, 1);
        assert_eq!(second.folded_blocks, 2);
        assert_eq!(second.block_range(), Some((0, 2)));
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);

        let requests = healthy.requests.lock().unwrap();
        assert!(requests[0].contains("narrative after call 0"));
        assert!(requests[0].contains("message number 35\n"));

        let history = db.running_summary_history("general").await.unwrap();
        let blocks: Vec<u64> = history.iter().map(|s| s.block_number).collect();
        assert_eq!(blocks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn rerun_after_full_fold_does_nothing() {
        let db = store().await;
        let msgs = messages(50);
        let llm = Arc::new(CountingLlm::new());
        let summarizer = BlockSummarizer::new(llm.clone(), db.clone(), &config());
        summarizer.summarize_channel("general", &msgs).await.unwrap();
        let calls = llm.calls.load(Ordering::SeqCst);

        let again = summarizer.summarize_channel("general", &msgs).await.unwrap();
        assert_eq!(again.state, SummarizerState::Sealed);
        assert_eq!(again.folded_blocks, 0);
        assert_eq!(again.skipped_blocks, 2);
        assert_eq!(again.block_range(), Some((0, 1)));
        assert_eq!(llm.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn new_session_continues_block_numbers() {
        let db = store().await;
        let llm = Arc::new(CountingLlm::new());
        let summarizer = BlockSummarizer::new(llm.clone(), db.clone(), &config());
        summarizer
            .summarize_channel("general", &messages(40))
            .await
            .unwrap();

        let mut next_day = messages(20);
        for m in &mut next_day {
            m.id = format!("d2-{}", m.id);
        }
        let fold = summarizer
            .summarize_channel("general", &next_day)
            .await
            .unwrap();
        assert_eq!(fold.skipped_blocks, 0);
        assert_eq!(fold.block_range(), Some((1, 1)));
        let requests = llm.requests.lock().unwrap();
        assert!(requests[1].contains("EXISTING SUMMARY"));
    }

    #[tokio::test]
    async fn first_block_failure_leaves_no_summary() {
        let db = store().await;
        let llm = Arc::new(CountingLlm::failing(vec![0, 1, 2]));
        let fold = BlockSummarizer::new(llm, db.clone(), &config())
            .summarize_channel("general", &messages(12))
            .await
            .unwrap();
        assert_eq!(fold.state, SummarizerState::Empty);
        assert_eq!(fold.folded_blocks, 0);
        assert!(fold.error.is_some());
        assert!(db.get_running_summary("general").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn narrative_stays_bounded_with_appending_model() {
        let db = store().await;
        let config = DigestConfig {
            block_size: 10,
            overlap_size: 2,
            max_narrative_chars: 300,
            ..config()
        };
        let summarizer = BlockSummarizer::new(Arc::new(AppendingLlm), db.clone(), &config);

        let fold = summarizer
            .summarize_channel("general", &messages(100))
            .await
            .unwrap();

        assert_eq!(fold.state, SummarizerState::Sealed);
        assert!(fold.folded_blocks > 5);
        for summary in db.running_summary_history("general").await.unwrap() {
            assert!(
                summary.narrative_text.chars().count() <= 300,
                "block {} has {} chars",
                summary.block_number,
                summary.narrative_text.chars().count()
            );
        }
    }

    #[tokio::test]
    async fn over_cap_narrative_with_nbsp_is_truncated() {
        let db = store().await;
        let config = DigestConfig {
            max_narrative_chars: 300,
            ..config()
        };
        let fold = BlockSummarizer::new(Arc::new(NbspLlm), db.clone(), &config)
            .summarize_channel("general", &messages(12))
            .await
            .unwrap();

        assert_eq!(fold.state, SummarizerState::Sealed);
        let summary = db.get_running_summary("general").await.unwrap().unwrap();
        assert!(summary.narrative_text.chars().count() <= 300);
        assert!(summary.narrative_text.starts_with(MARKER));
    }

    #[tokio::test]
    async fn grown_backlog_resumes_after_short_last_block() {
        let db = store().await;
        let llm = Arc::new(CountingLlm::new());
        let summarizer = BlockSummarizer::new(llm.clone(), db.clone(), &config());

        // First session folds a single short block and is never reduced.
        let first = summarizer
            .summarize_channel("general", &messages(30))
            .await
            .unwrap();
        assert_eq!(first.block_range(), Some((0, 0)));

        let grown = summarizer
            .summarize_channel("general", &messages(90))
            .await
            .unwrap();

        assert_eq!(grown.state, SummarizerState::Sealed);
        assert_eq!(grown.skipped_blocks, 1);
        assert_eq!(grown.folded_blocks, 2);
        assert_eq!(grown.block_range(), Some((0, 2)));

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        for later in &requests[1..] {
            assert!(!later.contains("message number 0\n"));
            assert!(!later.contains("message number 24\n"));
        }
        // Overlap context, then the first new message.
        assert!(requests[1].contains("message number 25\n"));
        assert!(requests[1].contains("(new)\n[2026-03-02 08:30] user2: message number 30\n"));

        let history = db.running_summary_history("general").await.unwrap();
        let last_ids: Vec<&str> = history
            .iter()
            .map(|s| s.last_message_id_included.as_str())
            .collect();
        assert_eq!(last_ids, vec!["m029", "m064", "m089"]);
    }

    #[tokio::test]
    async fn resume_with_smaller_blocks_keeps_range() {
        let db = store().await;
        let msgs = messages(93);

        let crashing = Arc::new(CountingLlm::failing(vec![1, 2, 3]));
        BlockSummarizer::new(crashing, db.clone(), &config())
            .summarize_channel("general", &msgs)
            .await
            .unwrap();

        let smaller = DigestConfig {
            block_size: 20,
            ..config()
        };
        let healthy = Arc::new(CountingLlm::new());
        let fold = BlockSummarizer::new(healthy.clone(), db.clone(), &smaller)
            .summarize_channel("general", &msgs)
            .await
            .unwrap();

        assert_eq!(fold.skipped_blocks, 1);
        assert_eq!(fold.folded_blocks, 4);
        assert_eq!(fold.block_range(), Some((0, 4)));
        let requests = healthy.requests.lock().unwrap();
        assert!(requests[0].contains("message number 35\n"));
        assert!(!requests[0].contains("message number 34\n"));
    }
}
