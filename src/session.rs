//! Session cache: reuse an authenticated session across runs.
//!
//! The cache holds at most one [`SessionRecord`], in memory and in a JSON file
//! next to (never inside) the download tree. A record is handed out only
//! while it is inside its TTL; otherwise it is discarded and a fresh login
//! is performed through the [`Authenticator`].
//!
//! Callers never keep a session around on their own: every request-making
//! call receives the record explicitly, via [`SessionCache::authorized`].

use crate::api::Exhausted;
use crate::error::{Error, RemoteError};
use crate::models::SessionRecord;
use crate::remote::Authenticator;
use crate::utils::write_atomic;
use chrono::Utc;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument, warn};

pub struct SessionCache<A> {
    path: PathBuf,
    authenticator: A,
    current: Option<SessionRecord>,
    logins: u32,
}

impl<A> std::fmt::Debug for SessionCache<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("path", &self.path)
            .field("current", &self.current)
            .field("logins", &self.logins)
            .finish_non_exhaustive()
    }
}

impl<A: Authenticator> SessionCache<A> {
    pub fn new(path: impl Into<PathBuf>, authenticator: A) -> Self {
        Self {
            path: path.into(),
            authenticator,
            current: None,
            logins: 0,
        }
    }

    /// Number of full logins performed by this cache instance.
    pub fn logins(&self) -> u32 {
        self.logins
    }

    /// Return a usable session, logging in (and persisting the result) when
    /// nothing valid is cached.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn get_session(&mut self) -> Result<SessionRecord, Error> {
        let now = Utc::now();
        if let Some(record) = &self.current {
            if record.is_usable_at(now) {
                return Ok(record.clone());
            }
            info!(expired_at = %record.expires_at(), "Cached session has expired");
            self.current = None;
            self.remove_file().await;
        }

        if let Some(record) = self.load_cached().await {
            info!(cookies = record.cookies.len(), "Authenticated session loaded from cache");
            self.current = Some(record.clone());
            return Ok(record);
        }

        info!("No valid cached session found; performing a fresh login");
        self.logins += 1;
        let record = self.authenticator.authenticate().await?;
        self.persist(&record).await;
        self.current = Some(record.clone());
        Ok(record)
    }

    /// Forget the cached session so the next [`get_session`](Self::get_session)
    /// logs in again.
    pub async fn invalidate(&mut self) {
        info!("Invalidating cached session");
        self.current = None;
        self.remove_file().await;
    }

    /// Run a request with the current session. If the server rejects the
    /// session, invalidate it, log in once more and repeat the request a
    /// single time; a second rejection is fatal.
    pub async fn authorized<T, F, Fut>(&mut self, what: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut(SessionRecord) -> Fut,
        Fut: Future<Output = Result<T, Exhausted>>,
    {
        let session = self.get_session().await?;
        match op(session).await {
            Ok(value) => Ok(value),
            Err(Exhausted {
                error: RemoteError::Unauthorized,
                ..
            }) => {
                warn!(what, "Session rejected; re-authenticating once");
                self.invalidate().await;
                let session = self.get_session().await?;
                op(session).await.map_err(|e| match e.error {
                    RemoteError::Unauthorized => Error::Authentication(format!(
                        "{what} was rejected again after re-authentication"
                    )),
                    _ => e.into_error(what),
                })
            }
            Err(e) => Err(e.into_error(what)),
        }
    }

    async fn load_cached(&self) -> Option<SessionRecord> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "Cannot read session cache; ignoring it");
                return None;
            }
        };

        match serde_json::from_str::<SessionRecord>(&text) {
            Ok(record) if record.is_usable_at(Utc::now()) => Some(record),
            Ok(record) => {
                info!(expired_at = %record.expires_at(), "Cached session has expired; deleting cache file");
                self.remove_file().await;
                None
            }
            Err(e) => {
                error!(error = %e, "Session cache is corrupt; deleting cache file");
                self.remove_file().await;
                None
            }
        }
    }

    /// A failed write only costs an extra login next run, so it is logged
    /// rather than propagated.
    async fn persist(&self, record: &SessionRecord) {
        let json = match serde_json::to_vec_pretty(record) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize session");
                return;
            }
        };
        match write_atomic(&self.path, &json).await {
            Ok(()) => {
                restrict_permissions(&self.path).await;
                info!("Session cookies saved to cache");
            }
            Err(e) => error!(error = %e, "Failed to save session cache"),
        }
    }

    async fn remove_file(&self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to delete session cache file");
            }
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        warn!(error = %e, "Could not restrict session cache permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
