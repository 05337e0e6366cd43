//! Run orchestration.
//!
//! One run:
//! 1. Fetch each source in turn (throttled), dedup against the seen index
//! 2. Feed sources → relevance filter → selection records
//! 3. Chat sources → backlog; once every source is fetched, channels are
//!    folded concurrently under a per-channel lock and reduced to a digest
//! 4. Backlog rows are consumed only after their digest is sealed

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DigestConfig, PromptBook};
use crate::error::PipelineError;
use crate::ingest::MessageSource;
use crate::llm::{LlmProvider, MeteredProvider};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::reducer::{DigestReducer, ReduceInput};
use crate::pipeline::relevance::RelevanceFilter;
use crate::pipeline::summarizer::{BlockSummarizer, SummarizerState};
use crate::pipeline::types::{
    ChannelDigest, Message, RunMetrics, RunReport, SourceKind, SourceReport, SourceStatus, Window,
};
use crate::store::Database;

/// How one chat channel ended up.
struct ChannelOutcome {
    status: SourceStatus,
    digest: Option<ChannelDigest>,
    blocks_folded: usize,
    narrative_failed: bool,
    errors: Vec<String>,
}

impl ChannelOutcome {
    fn new(status: SourceStatus) -> Self {
        Self {
            status,
            digest: None,
            blocks_folded: 0,
            narrative_failed: false,
            errors: Vec::new(),
        }
    }

    fn failed(error: impl ToString) -> Self {
        let mut outcome = Self::new(SourceStatus::Failed);
        outcome.errors.push(error.to_string());
        outcome
    }
}

pub struct DigestRunner {
    config: DigestConfig,
    prompts: PromptBook,
    db: Arc<dyn Database>,
    llm: Arc<MeteredProvider>,
    dedup: Deduplicator,
    relevance: RelevanceFilter,
    summarizer: BlockSummarizer,
    reducer: DigestReducer,
    shutdown: Arc<AtomicBool>,
}

impl DigestRunner {
    pub fn new(
        config: DigestConfig,
        prompts: PromptBook,
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let metered = Arc::new(MeteredProvider::new(llm));
        let llm: Arc<dyn LlmProvider> = metered.clone();
        Self {
            dedup: Deduplicator::new(Arc::clone(&db)),
            relevance: RelevanceFilter::new(Arc::clone(&llm), Arc::clone(&db), &config),
            summarizer: BlockSummarizer::new(Arc::clone(&llm), Arc::clone(&db), &config),
            reducer: DigestReducer::new(llm, Arc::clone(&db), &config),
            config,
            prompts,
            db,
            llm: metered,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the run between sources and between channels.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run over `sources` with the window ending now.
    pub async fn run(&self, sources: &[Arc<dyn MessageSource>]) -> RunReport {
        self.run_at(sources, Utc::now()).await
    }

    /// Run over `sources` with the window ending at `now`.
    pub async fn run_at(&self, sources: &[Arc<dyn MessageSource>], now: DateTime<Utc>) -> RunReport {
        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();
        let started_at = Utc::now();
        let usage_before = self.llm.usage();
        let window = Window::lookback(now, self.config.window_hours);
        info!(%run_id, sources = sources.len(), start = %window.start, end = %window.end, "Digest run started");

        let mut reports: Vec<SourceReport> = Vec::with_capacity(sources.len());
        let mut channels: Vec<(usize, String)> = Vec::new();
        let mut aborted = false;

        for (i, source) in sources.iter().enumerate() {
            let source_id = source.source_id();
            let kind = source.kind();
            if aborted {
                reports.push(SourceReport::failed(source_id, kind, "run aborted"));
                continue;
            }
            if self.cancelled() {
                warn!(%run_id, source_id, "Run cancelled");
                aborted = true;
                reports.push(SourceReport::failed(source_id, kind, "run cancelled"));
                continue;
            }
            if i > 0 {
                self.throttle().await;
            }

            let mut report = SourceReport::new(source_id, kind);
            let fetched = match source.fetch(&window).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(source_id, error = %e, "Fetch failed, treating as no new messages");
                    report.errors.push(e.to_string());
                    Vec::new()
                }
            };
            report.fetched = fetched.len();

            let cap = self.prompts.max_posts(source_id, self.config.max_per_source);
            let new = match self
                .dedup
                .select_new(source_id, fetched, &window, cap)
                .await
            {
                Ok(new) => new,
                Err(e) => {
                    error!(source_id, error = %e, "Seen index unavailable, aborting run");
                    report.status = SourceStatus::Failed;
                    report.errors.push(e.to_string());
                    reports.push(report);
                    aborted = matches!(e, PipelineError::StorageUnavailable { .. });
                    continue;
                }
            };
            report.new_messages = new.len();

            match kind {
                SourceKind::Feed => self.process_feed(&mut report, new).await,
                SourceKind::Chat => {
                    // Backlog first: a crash after this point resumes from storage.
                    if let Err(e) = self.db.store_messages(&new).await {
                        error!(source_id, error = %e, "Failed to append chat backlog");
                        report.status = SourceStatus::Failed;
                        report.errors.push(e.to_string());
                    } else {
                        channels.push((reports.len(), source_id.to_string()));
                    }
                }
            }
            reports.push(report);
        }

        let mut narrative_failures = 0usize;
        if aborted {
            for (index, _) in &channels {
                let report = &mut reports[*index];
                report.status = SourceStatus::Failed;
                report.errors.push("run aborted before summarization".to_string());
            }
        } else {
            let outcomes: Vec<(usize, ChannelOutcome)> = stream::iter(channels)
                .map(|(index, channel_id)| {
                    let owner = owner.as_str();
                    async move {
                        let outcome = self.process_channel(&channel_id, &window, owner).await;
                        (index, outcome)
                    }
                })
                .buffer_unordered(self.config.channel_concurrency.max(1))
                .collect()
                .await;

            for (index, outcome) in outcomes {
                let report = &mut reports[index];
                if outcome.narrative_failed {
                    narrative_failures += 1;
                }
                report.status = outcome.status;
                report.digest = outcome.digest;
                report.blocks_folded = outcome.blocks_folded;
                report.errors.extend(outcome.errors);
            }
            aborted = self.cancelled();
        }

        let usage = self.llm.usage().since(&usage_before);
        let metrics = RunMetrics {
            messages_fetched: reports.iter().map(|r| r.fetched).sum(),
            messages_new: reports.iter().map(|r| r.new_messages).sum(),
            included: reports.iter().map(|r| r.included.len()).sum(),
            excluded: reports
                .iter()
                .flat_map(|r| &r.selections)
                .filter(|s| !s.included)
                .count(),
            classification_failures: reports
                .iter()
                .flat_map(|r| &r.selections)
                .filter(|s| s.is_classification_error())
                .count(),
            blocks_folded: reports.iter().map(|r| r.blocks_folded).sum(),
            narrative_failures,
            llm: usage,
            estimated_cost: usage.estimated_cost(self.llm.cost_per_token()),
        };

        info!(
            %run_id,
            aborted,
            fetched = metrics.messages_fetched,
            new = metrics.messages_new,
            included = metrics.included,
            blocks = metrics.blocks_folded,
            llm_calls = metrics.llm.calls,
            tokens = metrics.llm.total_tokens(),
            "Digest run finished"
        );

        RunReport {
            run_id,
            window,
            started_at,
            finished_at: Utc::now(),
            aborted,
            sources: reports,
            metrics,
        }
    }

    /// Polite pause between source fetches.
    async fn throttle(&self) {
        let (min, max) = self.config.fetch_delay_ms;
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn process_feed(&self, report: &mut SourceReport, new: Vec<Message>) {
        if new.is_empty() {
            return;
        }
        let source_id = report.source_id.clone();
        if let Err(e) = self.db.store_messages(&new).await {
            warn!(source_id = %source_id, error = %e, "Failed to store feed messages");
            report.errors.push(e.to_string());
        }

        let outcome = self
            .relevance
            .filter(
                &source_id,
                &new,
                &self.prompts,
                self.config.llm_max_batch,
                self.config.llm_include_threshold,
            )
            .await;

        if outcome.failed_batches > 0 {
            report.status = SourceStatus::Partial;
        }
        report.errors.extend(outcome.errors);
        report.included = new
            .into_iter()
            .zip(&outcome.records)
            .filter(|(_, record)| record.included)
            .map(|(msg, _)| msg)
            .collect();
        report.selections = outcome.records;
    }

    /// Fold and reduce one channel under its lock.
    async fn process_channel(&self, channel_id: &str, window: &Window, owner: &str) -> ChannelOutcome {
        if self.cancelled() {
            return ChannelOutcome::failed("run cancelled");
        }
        match self
            .db
            .try_lock_channel(channel_id, owner, self.config.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(channel_id, "Channel locked by another run, skipping");
                return ChannelOutcome::failed(PipelineError::ChannelBusy {
                    channel_id: channel_id.to_string(),
                });
            }
            Err(e) => {
                error!(channel_id, error = %e, "Failed to take channel lock");
                return ChannelOutcome::failed(e);
            }
        }

        let outcome = self.fold_channel(channel_id, window).await;

        if let Err(e) = self.db.release_channel_lock(channel_id, owner).await {
            warn!(channel_id, error = %e, "Failed to release channel lock");
        }
        outcome
    }

    async fn fold_channel(&self, channel_id: &str, window: &Window) -> ChannelOutcome {
        let backlog = match self.db.unconsumed_messages(channel_id).await {
            Ok(backlog) => backlog,
            Err(e) => return ChannelOutcome::failed(e),
        };
        let ids: Vec<String> = backlog.iter().map(|m| m.id.clone()).collect();

        if backlog.is_empty() {
            return ChannelOutcome::new(SourceStatus::InsufficientActivity);
        }

        let fold = match self.summarizer.summarize_channel(channel_id, &backlog).await {
            Ok(fold) => fold,
            Err(e) => {
                error!(channel_id, error = %e, "Summarizer storage failure");
                return ChannelOutcome::failed(e);
            }
        };

        if fold.state == SummarizerState::InsufficientActivity {
            self.consume(channel_id, &ids).await;
            return ChannelOutcome::new(SourceStatus::InsufficientActivity);
        }

        if let Some(err) = &fold.error {
            let status = if fold.folded_blocks > 0 {
                SourceStatus::Partial
            } else {
                SourceStatus::Failed
            };
            let mut outcome = ChannelOutcome::new(status);
            outcome.blocks_folded = fold.folded_blocks;
            outcome.narrative_failed = true;
            outcome.errors.push(err.to_string());
            return outcome;
        }

        let mut outcome = ChannelOutcome::new(SourceStatus::Success);
        outcome.blocks_folded = fold.folded_blocks;
        let Some(summary) = fold.summary.as_ref() else {
            return outcome;
        };
        let block_range = fold
            .block_range()
            .unwrap_or((summary.block_number, summary.block_number));

        let input = ReduceInput {
            date: window.end.date_naive(),
            block_range,
            contributing_message_ids: ids.clone(),
        };
        match self.reducer.reduce(summary, input).await {
            Ok(digest) => {
                self.consume(channel_id, &ids).await;
                outcome.digest = Some(digest);
            }
            Err(e @ PipelineError::StorageUnavailable { .. }) => {
                error!(channel_id, error = %e, "Failed to persist digest");
                outcome.status = SourceStatus::Failed;
                outcome.errors.push(e.to_string());
            }
            Err(e) => {
                warn!(channel_id, error = %e, "Digest reduction failed, narrative kept for next run");
                outcome.status = SourceStatus::Partial;
                outcome.errors.push(e.to_string());
            }
        }
        outcome
    }

    async fn consume(&self, channel_id: &str, ids: &[String]) {
        if let Err(e) = self.db.mark_consumed(channel_id, ids, Utc::now()).await {
            // Not fatal: the next run re-reads the backlog and skips folded blocks.
            warn!(channel_id, error = %e, "Failed to mark backlog consumed");
        }
    }
}
