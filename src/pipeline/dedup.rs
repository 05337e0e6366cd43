//! Deduplicator & windower.
//!
//! Turns a raw fetch into the messages this run has not delivered before:
//! window filter, seen-index filter, per-source cap, then marks the survivors
//! seen.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::types::{Message, Window};
use crate::store::Database;

pub struct Deduplicator {
    db: Arc<dyn Database>,
}

impl Deduplicator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Select messages of `source_id` that fall in `window` and were never
    /// selected before, keeping the most recent `max_per_source`.
    ///
    /// Output is chronological by `(timestamp, id)`. Returned ids are in the
    /// seen index when this returns; an id marked by a concurrent run is not
    /// returned here. Storage failures yield `StorageUnavailable` and no
    /// messages.
    pub async fn select_new(
        &self,
        source_id: &str,
        messages: Vec<Message>,
        window: &Window,
        max_per_source: Option<usize>,
    ) -> Result<Vec<Message>, PipelineError> {
        let fetched = messages.len();
        let mut foreign = 0usize;
        let mut candidates: Vec<Message> = messages
            .into_iter()
            .filter(|m| {
                if m.source_id != source_id {
                    foreign += 1;
                    return false;
                }
                window.contains(m.timestamp)
            })
            .collect();
        if foreign > 0 {
            warn!(source_id, foreign, "Dropped messages attributed to another source");
        }

        candidates.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let mut ids_in_batch = HashSet::new();
        candidates.retain(|m| ids_in_batch.insert(m.id.clone()));

        let ids: Vec<String> = candidates.iter().map(|m| m.id.clone()).collect();
        let seen = self
            .db
            .seen_ids(source_id, &ids)
            .await
            .map_err(|e| storage_unavailable(source_id, e))?;
        candidates.retain(|m| !seen.contains(&m.id));

        if let Some(cap) = max_per_source
            && candidates.len() > cap
        {
            let drop = candidates.len() - cap;
            candidates.drain(..drop);
        }

        let ids: Vec<String> = candidates.iter().map(|m| m.id.clone()).collect();
        let inserted: HashSet<String> = self
            .db
            .mark_seen(source_id, &ids, Utc::now())
            .await
            .map_err(|e| storage_unavailable(source_id, e))?
            .into_iter()
            .collect();
        if inserted.len() < ids.len() {
            debug!(
                source_id,
                raced = ids.len() - inserted.len(),
                "Messages claimed by a concurrent run"
            );
        }
        candidates.retain(|m| inserted.contains(&m.id));

        debug!(
            source_id,
            fetched,
            in_window_unseen = ids.len(),
            selected = candidates.len(),
            "Deduplicated"
        );
        Ok(candidates)
    }
}

fn storage_unavailable(source_id: &str, e: crate::error::DatabaseError) -> PipelineError {
    PipelineError::StorageUnavailable {
        source_id: source_id.to_string(),
        reason: e.to_string(),
    }
}
