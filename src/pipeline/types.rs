//! Shared types for the digest pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::usage::LlmUsage;

// ── Messages ────────────────────────────────────────────────────────

/// What kind of post a message is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Normal,
    Reply,
    ThreadStart,
    Retweet,
    Quote,
}

static QUOTED_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+/status/\d+").unwrap());

impl MessageKind {
    /// Classify a feed item title.
    ///
    /// Feed bridges prefix retweets with `RT by @user` and replies with
    /// `R to @user`; anything else is a normal post.
    pub fn from_feed_title(title: &str) -> Self {
        let title = title.trim_start();
        if title.starts_with("RT by @") {
            Self::Retweet
        } else if title.starts_with("R to @") {
            Self::Reply
        } else {
            Self::Normal
        }
    }

    /// Classify a feed item from its title and body. A normal post that links
    /// to another status is a quote.
    pub fn detect(title: &str, text: &str) -> Self {
        match Self::from_feed_title(title) {
            Self::Normal if quoted_status_url(text).is_some() => Self::Quote,
            kind => kind,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reply => "reply",
            Self::ThreadStart => "thread_start",
            Self::Retweet => "retweet",
            Self::Quote => "quote",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "reply" => Ok(Self::Reply),
            "thread_start" => Ok(Self::ThreadStart),
            "retweet" => Ok(Self::Retweet),
            "quote" => Ok(Self::Quote),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// First link to another status (`.../status/<digits>`) in `text`.
pub fn quoted_status_url(text: &str) -> Option<&str> {
    QUOTED_STATUS.find(text).map(|m| m.as_str())
}

/// A tweet or chat message.
///
/// `id` is unique within `source_id`; the pair identifies a message globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Account handle or channel id.
    pub source_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// Image/media URLs.
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn quoted_status_url(&self) -> Option<&str> {
        quoted_status_url(&self.text)
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[end - hours, end]`.
    pub fn lookback(end: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: end - Duration::hours(i64::from(hours)),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

// ── Pipeline outputs ────────────────────────────────────────────────

/// Relevance decision for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub source_id: String,
    pub message_id: String,
    pub included: bool,
    pub reason: String,
    pub score: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

/// Reason recorded when a batch could not be classified.
pub const CLASSIFICATION_ERROR_REASON: &str = "classification_error";

impl SelectionRecord {
    /// Fail-closed record for a message whose batch could not be classified.
    pub fn classification_error(source_id: &str, message_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            message_id: message_id.to_string(),
            included: false,
            reason: CLASSIFICATION_ERROR_REASON.to_string(),
            score: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn is_classification_error(&self) -> bool {
        !self.included && self.reason == CLASSIFICATION_ERROR_REASON
    }
}

/// Rolling narrative of a chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningSummary {
    pub channel_id: String,
    /// Index of the last folded block; starts at 0.
    pub block_number: u64,
    pub narrative_text: String,
    pub last_message_id_included: String,
    pub updated_at: DateTime<Utc>,
}

/// Final per-channel, per-day summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDigest {
    pub channel_id: String,
    pub date: NaiveDate,
    pub summary_text: String,
    /// Inclusive `(first, last)` block numbers folded into this digest.
    pub source_block_range: (u64, u64),
    pub contributing_message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ── Run report ──────────────────────────────────────────────────────

/// Which path a source takes through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Tweet feed: dedup → relevance filter.
    Feed,
    /// Chat channel: dedup → block summarizer → reducer.
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    Partial,
    InsufficientActivity,
    Failed,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::InsufficientActivity => "insufficient_activity",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome for one source in a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub fetched: usize,
    pub new_messages: usize,
    /// Feed sources: included messages, in chronological order.
    pub included: Vec<Message>,
    /// Feed sources: every relevance decision made this run.
    pub selections: Vec<SelectionRecord>,
    /// Chat sources: the sealed digest, if one was produced.
    pub digest: Option<ChannelDigest>,
    /// Chat sources: blocks folded this run.
    pub blocks_folded: usize,
    pub errors: Vec<String>,
}

impl SourceReport {
    pub fn new(source_id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            status: SourceStatus::Success,
            fetched: 0,
            new_messages: 0,
            included: Vec::new(),
            selections: Vec::new(),
            digest: None,
            blocks_folded: 0,
            errors: Vec::new(),
        }
    }

    pub fn failed(source_id: impl Into<String>, kind: SourceKind, error: impl Into<String>) -> Self {
        let mut report = Self::new(source_id, kind);
        report.status = SourceStatus::Failed;
        report.errors.push(error.into());
        report
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    pub messages_fetched: usize,
    pub messages_new: usize,
    pub included: usize,
    pub excluded: usize,
    pub classification_failures: usize,
    pub blocks_folded: usize,
    pub narrative_failures: usize,
    pub llm: LlmUsage,
    pub estimated_cost: Decimal,
}

/// Everything a renderer needs from one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub window: Window,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The run stopped early (storage failure or cancellation).
    pub aborted: bool,
    pub sources: Vec<SourceReport>,
    pub metrics: RunMetrics,
}

impl RunReport {
    /// Plain-text summary, one block per source.
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "Digest run {} ({} → {}){}\n",
            self.run_id,
            self.window.start.format("%Y-%m-%d %H:%M"),
            self.window.end.format("%Y-%m-%d %H:%M"),
            if self.aborted { " [aborted]" } else { "" }
        );

        for source in &self.sources {
            out.push_str(&format!(
                "\n== {} [{}] fetched={} new={}\n",
                source.source_id, source.status, source.fetched, source.new_messages
            ));
            for msg in &source.included {
                out.push_str(&format!("- @{}: {}\n", msg.author, msg.text));
            }
            if let Some(digest) = &source.digest {
                out.push_str(&digest.summary_text);
                out.push('\n');
            }
            for err in &source.errors {
                out.push_str(&format!("! {err}\n"));
            }
        }

        let m = &self.metrics;
        out.push_str(&format!(
            "\nincluded={} excluded={} classification_failures={} blocks={} narrative_failures={} llm_calls={} tokens={} cost=${}\n",
            m.included,
            m.excluded,
            m.classification_failures,
            m.blocks_folded,
            m.narrative_failures,
            m.llm.calls,
            m.llm.total_tokens(),
            m.estimated_cost.round_dp(4),
        ));
        out
    }
}
