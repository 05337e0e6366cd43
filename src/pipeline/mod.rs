//! Digest pipeline.
//!
//! Every source flows through:
//! 1. `Deduplicator::select_new()`: window, seen index, per-source cap
//! 2. Feed sources: `RelevanceFilter::filter()`: batched LLM classification
//! 3. Chat sources: `BlockSummarizer::summarize_channel()`: overlapping
//!    blocks folded into a bounded running narrative, then
//!    `DigestReducer::reduce()`: narrative → channel digest
//!
//! `DigestRunner` drives a whole run and produces a `RunReport`.

pub mod dedup;
pub mod json;
pub mod reducer;
pub mod relevance;
pub mod runner;
pub mod summarizer;
pub mod types;

pub use dedup::Deduplicator;
pub use reducer::{DigestReducer, ReduceInput};
pub use relevance::{FilterOutcome, RelevanceFilter};
pub use runner::DigestRunner;
pub use summarizer::{BlockSummarizer, ChannelFold, SummarizerState, plan_blocks};
