//! Download orchestrator: the top-level driver of a run.
//!
//! Each story goes through
//!
//! ```text
//! Pending ──► InProgress ──► Complete
//!                 │
//!                 └──► Failed ──► Pending   (retried next run)
//! ```
//!
//! `InProgress` is checkpointed before the first asset is touched, every
//! confirmed asset is recorded with `record_media_done`, and `Complete` is
//! written only after all assets and the `story.json` sidecar are on disk.
//! Any fatal error halts the run; the checkpoint then holds only confirmed
//! completions.

use crate::api::RetryPolicy;
use crate::checkpoint::CheckpointStore;
use crate::dedup::Deduplicator;
use crate::error::{Error, RemoteError, RunError};
use crate::fetcher::{Listing, StoryFetcher};
use crate::models::{DownloadLayout, MediaRef, Story, StoryStatus};
use crate::remote::{AssetBody, Authenticator, Remote};
use crate::session::SessionCache;
use crate::utils::{partial_path, sync_parent_dir, write_atomic};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

const PART_SUFFIX: &str = ".part";

/// Counters reported at the end of a successful run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub pages_fetched: u32,
    /// Stories taken to `Complete` during this run.
    pub stories_processed: usize,
    /// Stories that were already complete.
    pub stories_skipped: usize,
    pub media_downloaded: usize,
    /// Assets already present on disk.
    pub media_skipped: usize,
    pub bytes_downloaded: u64,
    /// Fresh logins performed during the run.
    pub logins: u32,
    /// Stories complete in the checkpoint once the run ended.
    pub complete_total: usize,
}

/// Drives one run over the whole listing.
///
/// Owns every collaborator of the engine: the session cache, the remote,
/// the checkpoint store and the deduplicator. It is the only writer of the
/// checkpoint and of the download tree.
pub struct Orchestrator<A, R> {
    sessions: SessionCache<A>,
    remote: R,
    checkpoint: CheckpointStore,
    dedup: Deduplicator,
    layout: DownloadLayout,
    retry: RetryPolicy,
    request_delay: Duration,
    story_attempts: u32,
}

impl<A: Authenticator, R: Remote> Orchestrator<A, R> {
    /// Assemble an orchestrator with no request delay and one attempt per story.
    ///
    /// # Arguments
    ///
    /// * `sessions` - Session cache used for every remote call
    /// * `remote` - Listing and asset source
    /// * `checkpoint` - Opened checkpoint journal; holds the resume cursor
    /// * `layout` - Mapping of stories onto the download tree
    /// * `retry` - Backoff policy applied to each request
    pub fn new(
        sessions: SessionCache<A>,
        remote: R,
        checkpoint: CheckpointStore,
        layout: DownloadLayout,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions,
            remote,
            checkpoint,
            dedup: Deduplicator,
            layout,
            retry,
            request_delay: Duration::ZERO,
            story_attempts: 1,
        }
    }

    /// Pause before every asset download and between listing pages.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Attempts per story within one run; values below 1 are treated as 1.
    pub fn with_story_attempts(mut self, attempts: u32) -> Self {
        self.story_attempts = attempts.max(1);
        self
    }

    /// Walk the whole listing once, resuming from the checkpoint cursor.
    ///
    /// # Returns
    ///
    /// A [`RunReport`] with what was downloaded and skipped. On a fatal
    /// error the [`RunError`] names the story that was in flight, if any;
    /// the checkpoint then holds only confirmed completions.
    #[instrument(level = "info", skip_all, fields(root = %self.layout.root().display()))]
    pub async fn run(&mut self) -> Result<RunReport, RunError> {
        let t0 = Instant::now();
        let Self {
            sessions,
            remote,
            checkpoint,
            dedup,
            layout,
            retry,
            request_delay,
            story_attempts,
        } = self;

        let recovered = checkpoint.load();
        let unfinished = recovered
            .values()
            .filter(|entry| entry.status != StoryStatus::Complete)
            .count();
        info!(
            tracked = recovered.len(),
            already_complete = recovered.len() - unfinished,
            unfinished,
            "Starting download run"
        );

        let mut fetcher = StoryFetcher::new(
            &*remote,
            layout.clone(),
            retry.clone(),
            *request_delay,
            checkpoint.cursor().map(str::to_owned),
        );
        let mut worker = Worker {
            sessions,
            remote: &*remote,
            checkpoint,
            dedup: *dedup,
            retry,
            request_delay: *request_delay,
            story_attempts: *story_attempts,
            report: RunReport::default(),
        };

        loop {
            let item = fetcher
                .next(worker.sessions)
                .await
                .map_err(|source| RunError {
                    story_id: None,
                    source,
                })?;
            match item {
                Some(Listing::Story(story)) => {
                    worker.process(&story).await.map_err(|source| RunError {
                        story_id: Some(story.story_id.clone()),
                        source,
                    })?;
                }
                // Every story of the page is complete, otherwise the run
                // would have halted before reaching the page end.
                Some(Listing::PageEnd { next_page_token }) => {
                    worker
                        .checkpoint
                        .set_cursor(next_page_token)
                        .await
                        .map_err(|source| RunError {
                            story_id: None,
                            source,
                        })?;
                }
                None => break,
            }
        }

        let mut report = worker.report;
        report.pages_fetched = fetcher.pages_fetched();
        report.logins = worker.sessions.logins();
        report.complete_total = worker.checkpoint.completed_count();
        info!(
            pages = report.pages_fetched,
            stories_processed = report.stories_processed,
            stories_skipped = report.stories_skipped,
            media_downloaded = report.media_downloaded,
            media_skipped = report.media_skipped,
            bytes = report.bytes_downloaded,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Download run finished"
        );
        Ok(report)
    }
}

/// Borrowed view of the orchestrator used while the fetcher holds the remote.
struct Worker<'a, A, R> {
    sessions: &'a mut SessionCache<A>,
    remote: &'a R,
    checkpoint: &'a mut CheckpointStore,
    dedup: Deduplicator,
    retry: &'a RetryPolicy,
    request_delay: Duration,
    story_attempts: u32,
    report: RunReport,
}

impl<A: Authenticator, R: Remote> Worker<'_, A, R> {
    #[instrument(level = "info", skip_all, fields(story_id = %story.story_id))]
    async fn process(&mut self, story: &Story) -> Result<(), Error> {
        if self.checkpoint.is_complete(&story.story_id) {
            info!("Story already complete; skipping");
            self.report.stories_skipped += 1;
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            match self.attempt(story).await {
                Ok(()) => {
                    self.report.stories_processed += 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Story failed");
                    if let Err(pending) = self.checkpoint.mark_pending(&story.story_id).await {
                        error!(error = %pending, "Could not return story to pending");
                    }
                    let retryable = matches!(e, Error::Fetch { .. });
                    if retryable && attempt < self.story_attempts {
                        attempt += 1;
                        info!(attempt, "Retrying story");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&mut self, story: &Story) -> Result<(), Error> {
        if let Some(previous) = self.checkpoint.entry(&story.story_id) {
            info!(
                status = ?previous.status,
                media_done = previous.completed_media_count,
                "Story was started by an earlier run; re-checking all media"
            );
        }
        self.checkpoint.mark_in_progress(&story.story_id).await?;
        info!(
            title = %story.title,
            media = story.media_refs.len(),
            "Processing story"
        );

        for media in &story.media_refs {
            self.ensure_present(&story.story_id, media).await?;
            self.checkpoint
                .record_media_done(&story.story_id, media.index)
                .await?;
        }

        let metadata = serde_json::to_vec_pretty(&story.metadata)
            .map_err(|e| Error::storage(&story.metadata_path, io::Error::other(e)))?;
        write_atomic(&story.metadata_path, &metadata)
            .await
            .map_err(|e| Error::storage(&story.metadata_path, e))?;

        self.checkpoint.mark_complete(&story.story_id).await?;
        info!("Story complete");
        Ok(())
    }

    /// Make sure one asset is on disk with the right size, downloading it at
    /// most twice. The body is streamed into `<dest>.part`, which is renamed
    /// over `dest` only once its size has been confirmed.
    async fn ensure_present(&mut self, story_id: &str, media: &MediaRef) -> Result<(), Error> {
        if !self.dedup.needs_download(media).await {
            self.report.media_skipped += 1;
            return Ok(());
        }

        let dest = &media.destination_path;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(parent, e))?;
        }
        let part = partial_path(dest, PART_SUFFIX);

        let mut redownloaded = false;
        loop {
            let actual = match self.download(story_id, media, &part).await {
                Ok(actual) => actual,
                Err(e) => {
                    discard(&part).await;
                    return Err(e);
                }
            };
            if let Some(expected) = media.expected_size.filter(|&e| e != actual) {
                discard(&part).await;
                if redownloaded {
                    return Err(Error::IntegrityMismatch {
                        path: dest.clone(),
                        expected,
                        actual,
                    });
                }
                warn!(
                    index = media.index,
                    expected, actual, "Downloaded size differs from expected; downloading again"
                );
                redownloaded = true;
                continue;
            }

            if let Err(e) = fs::rename(&part, dest).await {
                discard(&part).await;
                return Err(Error::storage(dest, e));
            }
            sync_parent_dir(dest).await;
            info!(
                index = media.index,
                bytes = actual,
                path = %dest.display(),
                "Downloaded media"
            );
            self.report.media_downloaded += 1;
            self.report.bytes_downloaded += actual;
            return Ok(());
        }
    }

    /// Stream one asset into `part`, returning the number of bytes written.
    async fn download(&mut self, story_id: &str, media: &MediaRef, part: &Path) -> Result<u64, Error> {
        if !self.request_delay.is_zero() {
            sleep(self.request_delay).await;
        }

        let remote = self.remote;
        let retry = self.retry;
        let url = media.source_url.as_str();
        let what = format!("media {} ({}) of story {story_id}", media.index, media.media_id);
        let what = what.as_str();

        let landed = self
            .sessions
            .authorized(what, |session| async move {
                let session = &session;
                retry
                    .run(what, move || async move {
                        let body = remote.fetch_asset(session, url).await?;
                        stream_to_part(body, part).await
                    })
                    .await
            })
            .await?;
        landed.map_err(|e| Error::storage(part, e))
    }
}

/// Outcome of writing a body to disk. Local write failures travel in the
/// inner `Result` so the retry loop never repeats them.
type Landed = Result<u64, io::Error>;

/// Copy `body` chunk by chunk into a fresh `part` file and sync it. A body
/// shorter or longer than its announced length is a transient
/// [`RemoteError::Truncated`].
async fn stream_to_part<B: AssetBody>(mut body: B, part: &Path) -> Result<Landed, RemoteError> {
    let announced = body.content_length();
    let mut file = match fs::File::create(part).await {
        Ok(file) => file,
        Err(e) => return Ok(Err(e)),
    };

    let mut written = 0u64;
    while let Some(chunk) = body.next_chunk().await? {
        if let Err(e) = file.write_all(&chunk).await {
            return Ok(Err(e));
        }
        written += chunk.len() as u64;
    }
    if let Some(expected) = announced.filter(|&n| n != written) {
        return Err(RemoteError::Truncated {
            expected,
            actual: written,
        });
    }

    let synced = async {
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    Ok(synced.map(|()| written))
}

async fn discard(part: &Path) {
    if let Err(e) = fs::remove_file(part).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %part.display(), error = %e, "Could not remove partial download");
        }
    }
}
