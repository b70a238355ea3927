//! Configuration loading and validation.
//!
//! Values are merged from the command line / environment ([`Cli`]) and an
//! optional YAML file ([`FileConfig`]); the command line wins. A `.env` file
//! in the working directory is loaded into the environment first
//! ([`load_env_file`]); variables that are already set keep their value. The result is a
//! validated [`Config`] that the engine consumes as-is.
//!
//! ```yaml
//! login_url: https://app.example.com/users/sign_in
//! api_base_url: https://app.example.com/api/v1/
//! username: parent@example.com
//! password: hunter2
//! child_id: "4711"
//! download_path: /srv/stories
//! max_retries: 3
//! ```

use crate::api::RetryPolicy;
use crate::cli::Cli;
use crate::error::Error;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};
use url::Url;

pub const DEFAULT_SESSION_CACHE: &str = "login_session_cache.json";
pub const DEFAULT_CHECKPOINT: &str = "checkpoint.jsonl";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

/// Load `KEY=value` lines from an environment file into the process
/// environment. Must run before [`Cli`] is parsed.
///
/// # Arguments
///
/// * `path` - Explicit file, or `None` to search for `.env` from the
///   working directory upwards
///
/// # Returns
///
/// The file that was loaded, or `None` when there is none. An unreadable
/// file is logged and ignored.
pub fn load_env_file(path: Option<&Path>) -> Option<PathBuf> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|()| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => {
            info!(path = %path.display(), "Loaded environment file");
            Some(path)
        }
        Err(e) if e.not_found() => None,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable environment file");
            None
        }
    }
}

/// Settings file contents. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub login_url: Option<String>,
    pub api_base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub child_id: Option<String>,
    pub download_path: Option<PathBuf>,
    pub session_cache: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub session_ttl_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub request_delay_ms: Option<u64>,
    pub story_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid settings file: {e}")))
    }

    pub async fn read(path: &Path) -> Result<Self, Error> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }
}

/// Validated runtime configuration.
#[derive(Clone)]
pub struct Config {
    pub login_url: Url,
    pub api_base_url: Url,
    pub username: String,
    pub password: String,
    pub child_id: String,
    pub download_root: PathBuf,
    pub session_cache_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub session_ttl_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_delay_ms: u64,
    pub story_attempts: u32,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("login_url", &self.login_url.as_str())
            .field("api_base_url", &self.api_base_url.as_str())
            .field("username", &self.username)
            .field("password", &"********")
            .field("child_id", &self.child_id)
            .field("download_root", &self.download_root)
            .field("session_cache_path", &self.session_cache_path)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("request_delay_ms", &self.request_delay_ms)
            .field("story_attempts", &self.story_attempts)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn required<T>(name: &str, value: Option<T>) -> Result<T, Error> {
    value.ok_or_else(|| Error::Config(format!("missing required setting: {name}")))
}

fn required_text(name: &str, value: Option<String>) -> Result<String, Error> {
    let value = required(name, value)?;
    if value.trim().is_empty() {
        return Err(Error::Config(format!("setting {name} must not be empty")));
    }
    Ok(value)
}

fn required_url(name: &str, value: Option<String>) -> Result<Url, Error> {
    let raw = required_text(name, value)?;
    Url::parse(raw.trim()).map_err(|e| Error::Config(format!("setting {name} is not a URL: {e}")))
}

impl Config {
    /// Load the settings file named on the command line (if any) and merge.
    #[instrument(level = "info", skip_all, fields(config = ?cli.config))]
    pub async fn load(cli: Cli) -> Result<Self, Error> {
        let file = match &cli.config {
            Some(path) => FileConfig::read(path).await?,
            None => FileConfig::default(),
        };
        let config = Self::merge(cli, file)?;
        info!(?config, "Configuration validated");
        Ok(config)
    }

    /// Merge with command-line precedence, fill defaults, validate.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, Error> {
        let config = Self {
            login_url: required_url("login_url", cli.login_url.or(file.login_url))?,
            api_base_url: required_url("api_base_url", cli.api_base_url.or(file.api_base_url))?,
            username: required_text("username", cli.username.or(file.username))?,
            password: required_text("password", cli.password.or(file.password))?,
            child_id: required_text("child_id", cli.child_id.or(file.child_id))?,
            download_root: required("download_path", cli.download_path.or(file.download_path))?,
            session_cache_path: cli
                .session_cache
                .or(file.session_cache)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_CACHE)),
            checkpoint_path: cli
                .checkpoint
                .or(file.checkpoint)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT)),
            session_ttl_secs: cli
                .session_ttl_secs
                .or(file.session_ttl_secs)
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
            max_retries: cli.max_retries.or(file.max_retries).unwrap_or(5),
            base_delay_ms: cli.base_delay_ms.or(file.base_delay_ms).unwrap_or(1_000),
            max_delay_ms: cli.max_delay_ms.or(file.max_delay_ms).unwrap_or(30_000),
            request_delay_ms: cli.request_delay_ms.or(file.request_delay_ms).unwrap_or(1_000),
            story_attempts: cli.story_attempts.or(file.story_attempts).unwrap_or(1),
            timeout_secs: cli.timeout_secs.or(file.timeout_secs).unwrap_or(30),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.download_root.as_os_str().is_empty() {
            return Err(Error::Config("setting download_path must not be empty".into()));
        }
        if self.session_ttl_secs == 0 {
            return Err(Error::Config("session_ttl_secs must be positive".into()));
        }
        if self.story_attempts == 0 {
            return Err(Error::Config("story_attempts must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(
                "max_delay_ms must not be smaller than base_delay_ms".into(),
            ));
        }
        let separate = [
            (&self.session_cache_path, "session_cache"),
            (&self.checkpoint_path, "checkpoint"),
        ];
        for (path, name) in separate {
            if path.starts_with(&self.download_root) {
                return Err(Error::Config(format!(
                    "{name} must live outside the download directory"
                )));
            }
        }
        if self.session_cache_path == self.checkpoint_path {
            return Err(Error::Config(
                "session_cache and checkpoint must be different files".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_cli() -> Cli {
        Cli {
            login_url: Some("https://app.example.com/users/sign_in".into()),
            api_base_url: Some("https://app.example.com/api/".into()),
            username: Some("parent@example.com".into()),
            password: Some("hunter2".into()),
            child_id: Some("4711".into()),
            download_path: Some(PathBuf::from("/srv/stories")),
            ..Cli::default()
        }
    }

    #[test]
    fn test_defaults_are_filled() {
        let config = Config::merge(full_cli(), FileConfig::default()).unwrap();
        assert_eq!(config.session_cache_path, PathBuf::from(DEFAULT_SESSION_CACHE));
        assert_eq!(config.checkpoint_path, PathBuf::from(DEFAULT_CHECKPOINT));
        assert_eq!(config.session_ttl_secs, 86_400);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.story_attempts, 1);
        assert_eq!(config.retry_policy().max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig::from_yaml(
            "child_id: \"1\"\nmax_retries: 9\nrequest_delay_ms: 0\n",
        )
        .unwrap();
        let config = Config::merge(full_cli(), file).unwrap();
        assert_eq!(config.child_id, "4711");
        assert_eq!(config.max_retries, 9);
        assert_eq!(config.request_delay(), Duration::ZERO);
    }

    #[test]
    fn test_file_supplies_required_values() {
        let file = FileConfig::from_yaml(
            r#"
login_url: https://app.example.com/users/sign_in
api_base_url: https://app.example.com/api/
username: parent@example.com
password: hunter2
child_id: "4711"
download_path: /srv/stories
"#,
        )
        .unwrap();
        let config = Config::merge(Cli::default(), file).unwrap();
        assert_eq!(config.username, "parent@example.com");
        assert_eq!(config.download_root, PathBuf::from("/srv/stories"));
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let mut cli = full_cli();
        cli.password = None;
        let err = Config::merge(cli, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("password"));

        let mut cli = full_cli();
        cli.login_url = Some("not a url".into());
        assert!(matches!(
            Config::merge(cli, FileConfig::default()),
            Err(Error::Config(_))
        ));

        let mut cli = full_cli();
        cli.story_attempts = Some(0);
        assert!(Config::merge(cli, FileConfig::default()).is_err());

        let mut cli = full_cli();
        cli.checkpoint = Some(PathBuf::from("/srv/stories/checkpoint.jsonl"));
        assert!(Config::merge(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn test_env_file_fills_unset_variables_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "STORY_DOWNLOADER_TEST_CHILD=4711\nPATH=/overridden\n",
        )
        .unwrap();

        assert_eq!(load_env_file(Some(&path)), Some(path.clone()));
        assert_eq!(std::env::var("STORY_DOWNLOADER_TEST_CHILD").unwrap(), "4711");
        assert_ne!(std::env::var("PATH").unwrap(), "/overridden");

        assert_eq!(load_env_file(Some(&dir.path().join("missing.env"))), None);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(FileConfig::from_yaml("colour: blue\n").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::merge(full_cli(), FileConfig::default()).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("********"));
    }
}
