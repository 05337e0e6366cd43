//! Ingestion seam: where messages come from.
//!
//! Transports (RSS bridges, chat bot APIs) implement [`MessageSource`]. The
//! crate ships [`StaticSource`], loaded from a JSON dump, which the binary and
//! tests use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{ConfigError, PipelineError};
use crate::pipeline::types::{Message, MessageKind, SourceKind, Window};

/// A feed account or chat channel the digest reads from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Account handle or channel id; becomes `Message::source_id`.
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Fetch recent messages. Implementations may return messages outside
    /// `window`; the deduplicator filters them. Failures are
    /// `PipelineError::Transport`.
    async fn fetch(&self, window: &Window) -> Result<Vec<Message>, PipelineError>;
}

/// In-memory source returning a fixed message list.
pub struct StaticSource {
    source_id: String,
    kind: SourceKind,
    messages: Vec<Message>,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, messages: Vec<Message>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            messages,
        }
    }
}

#[async_trait]
impl MessageSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, _window: &Window) -> Result<Vec<Message>, PipelineError> {
        Ok(self.messages.clone())
    }
}

// ── JSON dump ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Dump {
    sources: Vec<DumpSource>,
}

#[derive(Debug, Deserialize)]
struct DumpSource {
    source_id: String,
    kind: SourceKind,
    #[serde(default)]
    messages: Vec<DumpItem>,
}

/// A message as exported by a fetcher. Feed items may carry the raw feed
/// title instead of an explicit kind.
#[derive(Debug, Deserialize)]
struct DumpItem {
    id: String,
    #[serde(default)]
    author: Option<String>,
    timestamp: DateTime<Utc>,
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    attachments: Vec<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    kind: Option<MessageKind>,
}

impl DumpItem {
    fn into_message(self, source_id: &str) -> Message {
        let kind = self
            .kind
            .unwrap_or_else(|| MessageKind::detect(self.title.as_deref().unwrap_or(""), &self.text));
        Message {
            id: self.id,
            source_id: source_id.to_string(),
            author: self.author.unwrap_or_else(|| source_id.to_string()),
            timestamp: self.timestamp,
            text: self.text,
            attachments: self.attachments,
            thread_id: self.thread_id,
            kind,
        }
    }
}

/// Parse a JSON dump of the form
/// `{"sources": [{"source_id": "...", "kind": "feed"|"chat", "messages": [...]}]}`.
pub fn parse_dump(raw: &str) -> Result<Vec<Arc<dyn MessageSource>>, ConfigError> {
    let dump: Dump = serde_json::from_str(raw)
        .map_err(|e| ConfigError::ParseError(format!("message dump: {e}")))?;
    Ok(dump
        .sources
        .into_iter()
        .map(|source| {
            let messages = source
                .messages
                .into_iter()
                .map(|item| item.into_message(&source.source_id))
                .collect();
            Arc::new(StaticSource::new(source.source_id, source.kind, messages))
                as Arc<dyn MessageSource>
        })
        .collect())
}

/// Load sources from a JSON dump file.
pub fn load_dump(path: &Path) -> Result<Vec<Arc<dyn MessageSource>>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    parse_dump(&raw)
}
