//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{ChannelDigest, Message, MessageKind, RunningSummary, SelectionRecord};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// so every write here is a single statement; nothing relies on a
/// multi-statement transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so stored timestamps sort as text.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const MESSAGE_COLUMNS: &str =
    "source_id, message_id, author, timestamp, text, attachments, thread_id, kind";

/// Map a libsql Row to a Message (column order matches MESSAGE_COLUMNS).
fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let timestamp: String = row.get(3)?;
    let attachments: String = row.get(5)?;
    let kind: String = row.get(7)?;
    Ok(Message {
        source_id: row.get(0)?,
        id: row.get(1)?,
        author: row.get(2)?,
        timestamp: parse_datetime(&timestamp),
        text: row.get(4)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        thread_id: row.get(6).ok(),
        kind: kind.parse().unwrap_or_default(),
    })
}

const SUMMARY_COLUMNS: &str =
    "channel_id, block_number, narrative_text, last_message_id_included, updated_at";

fn row_to_summary(row: &libsql::Row) -> Result<RunningSummary, libsql::Error> {
    let block_number: i64 = row.get(1)?;
    let updated: String = row.get(4)?;
    Ok(RunningSummary {
        channel_id: row.get(0)?,
        block_number: block_number as u64,
        narrative_text: row.get(2)?,
        last_message_id_included: row.get(3)?,
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn seen_ids(
        &self,
        source_id: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut seen = HashSet::new();
        for id in message_ids {
            if self.is_seen(source_id, id).await? {
                seen.insert(id.clone());
            }
        }
        Ok(seen)
    }

    async fn mark_seen(
        &self,
        source_id: &str,
        message_ids: &[String],
        first_seen: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let first_seen = fmt_datetime(first_seen);
        let mut inserted = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO seen_messages (source_id, message_id, first_seen)
                     VALUES (?1, ?2, ?3)",
                    params![source_id, id.as_str(), first_seen.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("mark_seen: {e}")))?;
            if changed > 0 {
                inserted.push(id.clone());
            }
        }
        debug!(
            source_id,
            requested = message_ids.len(),
            inserted = inserted.len(),
            "Marked messages seen"
        );
        Ok(inserted)
    }

    async fn is_seen(&self, source_id: &str, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM seen_messages WHERE source_id = ?1 AND message_id = ?2",
                params![source_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_seen: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("is_seen: {e}")))?;
        Ok(row.is_some())
    }

    async fn store_messages(&self, messages: &[Message]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = fmt_datetime(Utc::now());
        for msg in messages {
            conn.execute(
                "INSERT OR IGNORE INTO messages (source_id, message_id, author, timestamp, text,
                    attachments, thread_id, kind, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    msg.source_id.as_str(),
                    msg.id.as_str(),
                    msg.author.as_str(),
                    fmt_datetime(msg.timestamp),
                    msg.text.as_str(),
                    to_json(&msg.attachments)?,
                    opt_text(msg.thread_id.as_deref()),
                    msg.kind.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_messages: {e}")))?;
        }
        Ok(())
    }

    async fn unconsumed_messages(&self, source_id: &str) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE source_id = ?1 AND consumed_at IS NULL
                     ORDER BY timestamp ASC, message_id ASC"
                ),
                params![source_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unconsumed_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("unconsumed_messages: {e}")))?
        {
            messages.push(
                row_to_message(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(messages)
    }

    async fn mark_consumed(
        &self,
        source_id: &str,
        message_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let at = fmt_datetime(at);
        for id in message_ids {
            conn.execute(
                "UPDATE messages SET consumed_at = ?3
                 WHERE source_id = ?1 AND message_id = ?2 AND consumed_at IS NULL",
                params![source_id, id.as_str(), at.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_consumed: {e}")))?;
        }
        Ok(())
    }

    async fn save_selection(&self, record: &SelectionRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO selection_records
                    (source_id, message_id, included, reason, score, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.source_id.as_str(),
                    record.message_id.as_str(),
                    record.included as i64,
                    record.reason.as_str(),
                    opt_real(record.score),
                    fmt_datetime(record.evaluated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_selection: {e}")))?;
        Ok(())
    }

    async fn get_selection(
        &self,
        source_id: &str,
        message_id: &str,
    ) -> Result<Option<SelectionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT source_id, message_id, included, reason, score, evaluated_at
                 FROM selection_records WHERE source_id = ?1 AND message_id = ?2",
                params![source_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_selection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
                let included: i64 = row.get(2).map_err(parse)?;
                let evaluated: String = row.get(5).map_err(parse)?;
                Ok(Some(SelectionRecord {
                    source_id: row.get(0).map_err(parse)?,
                    message_id: row.get(1).map_err(parse)?,
                    included: included != 0,
                    reason: row.get(3).map_err(parse)?,
                    score: row.get(4).ok(),
                    evaluated_at: parse_datetime(&evaluated),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_selection: {e}"))),
        }
    }

    async fn get_running_summary(
        &self,
        channel_id: &str,
    ) -> Result<Option<RunningSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUMMARY_COLUMNS} FROM running_summaries WHERE channel_id = ?1"),
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_running_summary: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_summary(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_running_summary: {e}"))),
        }
    }

    async fn save_running_summary(&self, summary: &RunningSummary) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let updated = fmt_datetime(summary.updated_at);
        let block_number = summary.block_number as i64;
        conn.execute(
            "INSERT INTO running_summaries
                (channel_id, block_number, narrative_text, last_message_id_included, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_id) DO UPDATE SET
                block_number = excluded.block_number,
                narrative_text = excluded.narrative_text,
                last_message_id_included = excluded.last_message_id_included,
                updated_at = excluded.updated_at",
            params![
                summary.channel_id.as_str(),
                block_number,
                summary.narrative_text.as_str(),
                summary.last_message_id_included.as_str(),
                updated.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_running_summary: {e}")))?;

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO running_summary_history ({SUMMARY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                summary.channel_id.as_str(),
                block_number,
                summary.narrative_text.as_str(),
                summary.last_message_id_included.as_str(),
                updated.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_running_summary history: {e}")))?;

        debug!(
            channel_id = %summary.channel_id,
            block_number = summary.block_number,
            "Running summary saved"
        );
        Ok(())
    }

    async fn running_summary_history(
        &self,
        channel_id: &str,
    ) -> Result<Vec<RunningSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM running_summary_history
                     WHERE channel_id = ?1 ORDER BY block_number ASC"
                ),
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("running_summary_history: {e}")))?;

        let mut history = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("running_summary_history: {e}")))?
        {
            history.push(
                row_to_summary(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(history)
    }

    async fn save_digest(&self, digest: &ChannelDigest) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO channel_digests
                    (channel_id, date, summary_text, first_block, last_block,
                     contributing_message_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    digest.channel_id.as_str(),
                    digest.date.to_string(),
                    digest.summary_text.as_str(),
                    digest.source_block_range.0 as i64,
                    digest.source_block_range.1 as i64,
                    to_json(&digest.contributing_message_ids)?,
                    fmt_datetime(digest.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_digest: {e}")))?;
        info!(channel_id = %digest.channel_id, date = %digest.date, "Digest saved");
        Ok(())
    }

    async fn get_digest(
        &self,
        channel_id: &str,
        date: NaiveDate,
    ) -> Result<Option<ChannelDigest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT channel_id, summary_text, first_block, last_block,
                    contributing_message_ids, created_at
                 FROM channel_digests WHERE channel_id = ?1 AND date = ?2",
                params![channel_id, date.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_digest: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
                let first: i64 = row.get(2).map_err(parse)?;
                let last: i64 = row.get(3).map_err(parse)?;
                let ids: String = row.get(4).map_err(parse)?;
                let created: String = row.get(5).map_err(parse)?;
                Ok(Some(ChannelDigest {
                    channel_id: row.get(0).map_err(parse)?,
                    date,
                    summary_text: row.get(1).map_err(parse)?,
                    source_block_range: (first as u64, last as u64),
                    contributing_message_ids: serde_json::from_str(&ids)
                        .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                    created_at: parse_datetime(&created),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_digest: {e}"))),
        }
    }

    async fn try_lock_channel(
        &self,
        channel_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DatabaseError::Query(format!("try_lock_channel: bad ttl: {e}")))?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO channel_locks (channel_id, owner, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE channel_locks.expires_at < excluded.acquired_at
                    OR channel_locks.owner = excluded.owner",
                params![
                    channel_id,
                    owner,
                    fmt_datetime(now),
                    fmt_datetime(now + ttl),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_lock_channel: {e}")))?;
        Ok(changed > 0)
    }

    async fn release_channel_lock(
        &self,
        channel_id: &str,
        owner: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM channel_locks WHERE channel_id = ?1 AND owner = ?2",
                params![channel_id, owner],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_channel_lock: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn msg(source: &str, id: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            source_id: source.to_string(),
            author: "ana".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0).unwrap(),
            text: format!("message {id}"),
            attachments: vec!["https://img.example/1.png".to_string()],
            thread_id: None,
            kind: MessageKind::Reply,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn mark_seen_returns_only_new_ids() {
        let db = test_db().await;
        let ids = vec!["1".to_string(), "2".to_string()];
        let inserted = db.mark_seen("general", &ids, Utc::now()).await.unwrap();
        assert_eq!(inserted, ids);

        let again = vec!["2".to_string(), "3".to_string()];
        let inserted = db.mark_seen("general", &again, Utc::now()).await.unwrap();
        assert_eq!(inserted, vec!["3".to_string()]);

        assert!(db.is_seen("general", "1").await.unwrap());
        assert!(!db.is_seen("random", "1").await.unwrap());
    }

    #[tokio::test]
    async fn seen_ids_scoped_by_source() {
        let db = test_db().await;
        db.mark_seen("a", &["1".to_string()], Utc::now()).await.unwrap();
        let seen = db
            .seen_ids("a", &["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("1"));
        assert!(db.seen_ids("b", &["1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_round_trip_and_consume() {
        let db = test_db().await;
        db.store_messages(&[msg("general", "b", 5), msg("general", "a", 1), msg("other", "x", 2)])
            .await
            .unwrap();

        let backlog = db.unconsumed_messages("general").await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, "a");
        assert_eq!(backlog[0].kind, MessageKind::Reply);
        assert_eq!(backlog[0].attachments.len(), 1);
        assert_eq!(backlog[0], msg("general", "a", 1));

        db.mark_consumed("general", &["a".to_string()], Utc::now())
            .await
            .unwrap();
        let backlog = db.unconsumed_messages("general").await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, "b");
    }

    #[tokio::test]
    async fn store_messages_keeps_existing_rows() {
        let db = test_db().await;
        db.store_messages(&[msg("general", "a", 1)]).await.unwrap();
        db.mark_consumed("general", &["a".to_string()], Utc::now())
            .await
            .unwrap();
        db.store_messages(&[msg("general", "a", 1)]).await.unwrap();
        assert!(db.unconsumed_messages("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn selection_upsert() {
        let db = test_db().await;
        let mut record = SelectionRecord {
            source_id: "rustlang".into(),
            message_id: "42".into(),
            included: true,
            reason: "release announcement".into(),
            score: Some(0.9),
            evaluated_at: Utc::now(),
        };
        db.save_selection(&record).await.unwrap();

        record.included = false;
        record.reason = "superseded".into();
        record.score = None;
        db.save_selection(&record).await.unwrap();

        let stored = db.get_selection("rustlang", "42").await.unwrap().unwrap();
        assert!(!stored.included);
        assert_eq!(stored.reason, "superseded");
        assert!(stored.score.is_none());
        assert!(db.get_selection("rustlang", "43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_summary_replaces_and_keeps_history() {
        let db = test_db().await;
        for block in 0..3u64 {
            db.save_running_summary(&RunningSummary {
                channel_id: "general".into(),
                block_number: block,
                narrative_text: format!("narrative {block}"),
                last_message_id_included: format!("m{block}"),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let current = db.get_running_summary("general").await.unwrap().unwrap();
        assert_eq!(current.block_number, 2);
        assert_eq!(current.narrative_text, "narrative 2");

        let history = db.running_summary_history("general").await.unwrap();
        let blocks: Vec<u64> = history.iter().map(|s| s.block_number).collect();
        assert_eq!(blocks, vec![0, 1, 2]);
        assert!(db.get_running_summary("random").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn digest_upsert_by_channel_and_date() {
        let db = test_db().await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let mut digest = ChannelDigest {
            channel_id: "general".into(),
            date,
            summary_text: "first".into(),
            source_block_range: (0, 2),
            contributing_message_ids: vec!["1".into(), "2".into()],
            created_at: Utc::now(),
        };
        db.save_digest(&digest).await.unwrap();
        digest.summary_text = "second".into();
        digest.source_block_range = (0, 3);
        db.save_digest(&digest).await.unwrap();

        let stored = db.get_digest("general", date).await.unwrap().unwrap();
        assert_eq!(stored.summary_text, "second");
        assert_eq!(stored.source_block_range, (0, 3));
        assert_eq!(stored.contributing_message_ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn channel_lock_excludes_other_owners() {
        let db = test_db().await;
        let ttl = Duration::from_secs(60);
        assert!(db.try_lock_channel("general", "run-a", ttl).await.unwrap());
        assert!(!db.try_lock_channel("general", "run-b", ttl).await.unwrap());
        // Re-entrant for the holder.
        assert!(db.try_lock_channel("general", "run-a", ttl).await.unwrap());

        // Releasing with the wrong owner does nothing.
        db.release_channel_lock("general", "run-b").await.unwrap();
        assert!(!db.try_lock_channel("general", "run-b", ttl).await.unwrap());

        db.release_channel_lock("general", "run-a").await.unwrap();
        assert!(db.try_lock_channel("general", "run-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let db = test_db().await;
        assert!(db
            .try_lock_channel("general", "crashed", Duration::ZERO)
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(db
            .try_lock_channel("general", "run-b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn on_disk_database() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("digest.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.mark_seen("a", &["1".to_string()], Utc::now()).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.is_seen("a", "1").await.unwrap());
    }
}
