//! AI Digest: daily digests from tweet feeds and chat channels.

pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod store;
