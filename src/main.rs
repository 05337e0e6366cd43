use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing_subscriber::prelude::*;

use ai_digest::config::{DigestConfig, PromptBook};
use ai_digest::ingest;
use ai_digest::llm::{LlmConfig, create_provider};
use ai_digest::pipeline::DigestRunner;
use ai_digest::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Optional daily-rolling file log next to stderr output
    let (file_layer, _log_guard) = match std::env::var("DIGEST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ai-digest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    let config = DigestConfig::from_env()?;

    let input = std::env::var("DIGEST_INPUT").unwrap_or_else(|_| {
        eprintln!("Error: DIGEST_INPUT not set");
        eprintln!("  export DIGEST_INPUT=./fetched.json");
        std::process::exit(1);
    });
    let sources = ingest::load_dump(Path::new(&input))?;

    let prompts = match std::env::var("DIGEST_PROMPTS_PATH") {
        Ok(path) => PromptBook::load(Path::new(&path))?,
        Err(_) => PromptBook::default(),
    };

    let llm_config = LlmConfig::from_env(config.llm_timeout)?;
    let llm = create_provider(&llm_config)?;

    let db_path =
        std::env::var("DIGEST_DB_PATH").unwrap_or_else(|_| "./data/ai-digest.db".to_string());
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(Path::new(&db_path)).await?);

    eprintln!("📰 AI Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Sources: {} from {}", sources.len(), input);
    eprintln!("   Database: {}", db_path);
    eprintln!("   Window: last {}h\n", config.window_hours);

    let runner = DigestRunner::new(config, prompts, db, llm);

    // Ctrl-C stops the run at the next source/channel boundary
    let shutdown = runner.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current step");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let report = runner.run(&sources).await;

    if std::env::var("DIGEST_REPORT_FORMAT").as_deref() == Ok("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    if report.aborted {
        std::process::exit(2);
    }
    Ok(())
}
