//! # Story Downloader
//!
//! Fetches every story of one child profile from a remote story service and
//! downloads the attached photos and videos into a local directory tree. A
//! run can be interrupted at any point; the next run resumes without
//! downloading anything twice.
//!
//! ## Usage
//!
//! ```sh
//! story_downloader --config settings.yaml -d ./stories
//! ```
//!
//! ## Architecture
//!
//! 1. **Session**: reuse the cached login cookies or log in again
//! 2. **Listing**: page through the story listing, one page in memory
//! 3. **Download**: per story, fetch missing media, then mark it complete
//!    in the checkpoint journal

use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod checkpoint;
mod cli;
mod config;
mod dedup;
mod error;
mod fetcher;
mod models;
mod orchestrator;
mod remote;
mod session;
#[cfg(test)]
mod testing;
mod utils;

use checkpoint::CheckpointStore;
use cli::Cli;
use config::Config;
use error::{Error, RunError};
use models::DownloadLayout;
use orchestrator::{Orchestrator, RunReport};
use remote::http::HttpClient;
use session::SessionCache;
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("story_downloader starting up");

    config::load_env_file(None);
    let args = Cli::parse();
    debug!(config = ?args.config, "Parsed CLI arguments");

    match run(args).await {
        Ok(report) => {
            info!(
                stories_processed = report.stories_processed,
                stories_skipped = report.stories_skipped,
                media_downloaded = report.media_downloaded,
                media_skipped = report.media_skipped,
                bytes = report.bytes_downloaded,
                complete_total = report.complete_total,
                logins = report.logins,
                elapsed_s = start_time.elapsed().as_secs(),
                "All stories are downloaded"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            match &e.story_id {
                Some(story_id) => error!(%story_id, error = %e.source, "Run halted"),
                None => error!(error = %e.source, "Run halted"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<RunReport, RunError> {
    let setup = |source: Error| RunError {
        story_id: None,
        source,
    };

    let config = Config::load(args).await.map_err(setup)?;

    // Early check: the download root must be writable before anything is fetched
    if let Err(e) = ensure_writable_dir(&config.download_root).await {
        error!(
            path = %config.download_root.display(),
            error = %e,
            "Download directory is not writable (fix perms or choose a different path)"
        );
        return Err(setup(Error::storage(&config.download_root, e)));
    }

    let client = HttpClient::new(&config).map_err(setup)?;
    let sessions = SessionCache::new(&config.session_cache_path, client.clone());
    let checkpoint = CheckpointStore::open(&config.checkpoint_path)
        .await
        .map_err(setup)?;

    let mut orchestrator = Orchestrator::new(
        sessions,
        client,
        checkpoint,
        DownloadLayout::new(&config.download_root),
        config.retry_policy(),
    )
    .with_request_delay(config.request_delay())
    .with_story_attempts(config.story_attempts);

    orchestrator.run().await
}
