//! `Database` trait: single async interface for all digest persistence.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{ChannelDigest, Message, RunningSummary, SelectionRecord};

/// Backend-agnostic storage for the seen index, message backlog, selection
/// records, running summaries, digests and channel locks.
///
/// Every message-keyed table is keyed by `(source_id, message_id)`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Seen index ──────────────────────────────────────────────────

    /// Which of `message_ids` are already in the seen index.
    async fn seen_ids(
        &self,
        source_id: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError>;

    /// Insert ids into the seen index, ignoring ones already present.
    ///
    /// Returns only the ids this call inserted, in input order.
    async fn mark_seen(
        &self,
        source_id: &str,
        message_ids: &[String],
        first_seen: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn is_seen(&self, source_id: &str, message_id: &str) -> Result<bool, DatabaseError>;

    // ── Messages / chat backlog ─────────────────────────────────────

    /// Persist messages. Existing rows are left untouched.
    async fn store_messages(&self, messages: &[Message]) -> Result<(), DatabaseError>;

    /// Stored messages of a source not yet folded into a digest, ordered by
    /// `(timestamp, id)`.
    async fn unconsumed_messages(&self, source_id: &str) -> Result<Vec<Message>, DatabaseError>;

    /// Mark messages as folded into a sealed digest.
    async fn mark_consumed(
        &self,
        source_id: &str,
        message_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Selection records ───────────────────────────────────────────

    /// Insert or replace the record for `(source_id, message_id)`.
    async fn save_selection(&self, record: &SelectionRecord) -> Result<(), DatabaseError>;

    async fn get_selection(
        &self,
        source_id: &str,
        message_id: &str,
    ) -> Result<Option<SelectionRecord>, DatabaseError>;

    // ── Running summaries ───────────────────────────────────────────

    async fn get_running_summary(
        &self,
        channel_id: &str,
    ) -> Result<Option<RunningSummary>, DatabaseError>;

    /// Replace the current summary and append it to the history.
    async fn save_running_summary(&self, summary: &RunningSummary) -> Result<(), DatabaseError>;

    /// Every persisted block version, oldest first.
    async fn running_summary_history(
        &self,
        channel_id: &str,
    ) -> Result<Vec<RunningSummary>, DatabaseError>;

    // ── Digests ─────────────────────────────────────────────────────

    /// Insert or replace the digest for `(channel_id, date)`.
    async fn save_digest(&self, digest: &ChannelDigest) -> Result<(), DatabaseError>;

    async fn get_digest(
        &self,
        channel_id: &str,
        date: NaiveDate,
    ) -> Result<Option<ChannelDigest>, DatabaseError>;

    // ── Channel locks ───────────────────────────────────────────────

    /// Take the advisory lock on a channel. Returns `false` if another owner
    /// holds an unexpired lock.
    async fn try_lock_channel(
        &self,
        channel_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Release a lock held by `owner`. No-op if the lock has changed hands.
    async fn release_channel_lock(&self, channel_id: &str, owner: &str)
    -> Result<(), DatabaseError>;
}
