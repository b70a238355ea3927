//! Command-line interface definitions.
//!
//! Every option can be provided as a flag, an environment variable (also
//! read from a `.env` file), or a key in the YAML file given by `--config`,
//! in that order of precedence.

use clap::Parser;
use std::path::PathBuf;

/// Download stories and their media, resuming where the last run stopped.
///
/// # Examples
///
/// ```sh
/// # Everything from the environment
/// API_LOGIN_URL=... API_BASE_URL=... story_downloader
///
/// # Settings file plus an override
/// story_downloader --config settings.yaml --download-path /srv/stories
/// ```
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Login page URL (form with a CSRF token)
    #[arg(long, env = "API_LOGIN_URL")]
    pub login_url: Option<String>,

    /// Base URL of the story API
    #[arg(long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Account username or e-mail
    #[arg(long, env = "API_USERNAME")]
    pub username: Option<String>,

    /// Account password
    #[arg(long, env = "API_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Child whose stories are downloaded
    #[arg(long, env = "CHILD_ID")]
    pub child_id: Option<String>,

    /// Root directory for downloaded stories
    #[arg(short, long, env = "DOWNLOAD_PATH")]
    pub download_path: Option<PathBuf>,

    /// Where the session cookies are cached
    #[arg(long, env = "SESSION_CACHE_PATH")]
    pub session_cache: Option<PathBuf>,

    /// Checkpoint journal location
    #[arg(long, env = "CHECKPOINT_PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Lifetime of a cached session, in seconds
    #[arg(long, env = "SESSION_TTL_SECS")]
    pub session_ttl_secs: Option<u64>,

    /// Retries for a failed request before the run halts
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Initial retry delay in milliseconds (doubles per attempt)
    #[arg(long, env = "BASE_DELAY_MS")]
    pub base_delay_ms: Option<u64>,

    /// Cap on the retry delay in milliseconds
    #[arg(long, env = "MAX_DELAY_MS")]
    pub max_delay_ms: Option<u64>,

    /// Pause before each download and between pages, in milliseconds
    #[arg(long, env = "REQUEST_DELAY_MS")]
    pub request_delay_ms: Option<u64>,

    /// Attempts per story within one run
    #[arg(long, env = "STORY_ATTEMPTS")]
    pub story_attempts: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
}
