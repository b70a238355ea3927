//! Durable per-story progress.
//!
//! # Journal format
//!
//! The checkpoint is an append-only JSON Lines file. Each mutation appends
//! one event and syncs it before the call returns:
//!
//! ```text
//! {"event":"in_progress","story_id":"S2","at":"2025-05-06T10:00:00Z"}
//! {"event":"media_done","story_id":"S2","index":0,"at":"2025-05-06T10:00:01Z"}
//! {"event":"complete","story_id":"S1","media_count":2,"at":"2025-05-06T09:59:00Z"}
//! {"event":"cursor","page_token":"tok-3","at":"2025-05-06T10:00:02Z"}
//! ```
//!
//! On [`CheckpointStore::open`] the journal is replayed and rewritten as a
//! compact snapshot. A torn trailing line from a crash mid-append is ignored.
//!
//! # Recovery
//!
//! Entries left `in_progress` by a crashed run are not complete. The next
//! run reprocesses them from the first asset; files already on disk are
//! skipped by the deduplicator.

use crate::error::Error;
use crate::models::{CheckpointEntry, StoryStatus};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    InProgress {
        story_id: String,
        at: DateTime<Utc>,
    },
    MediaDone {
        story_id: String,
        index: usize,
        at: DateTime<Utc>,
    },
    Complete {
        story_id: String,
        media_count: usize,
        at: DateTime<Utc>,
    },
    Pending {
        story_id: String,
        at: DateTime<Utc>,
    },
    Cursor {
        page_token: Option<String>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Progress {
    status: StoryStatus,
    completed_media: BTreeSet<usize>,
    /// Media count recorded at completion; replaces the set once complete.
    media_count: usize,
    last_updated_at: DateTime<Utc>,
}

impl Progress {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            status: StoryStatus::Pending,
            completed_media: BTreeSet::new(),
            media_count: 0,
            last_updated_at: at,
        }
    }

    fn entry(&self) -> CheckpointEntry {
        CheckpointEntry {
            status: self.status,
            completed_media_count: match self.status {
                StoryStatus::Complete => self.media_count,
                _ => self.completed_media.len(),
            },
            last_updated_at: self.last_updated_at,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    stories: BTreeMap<String, Progress>,
    cursor: Option<String>,
}

impl State {
    fn apply(&mut self, event: Event) {
        match event {
            Event::InProgress { story_id, at } => {
                let p = self.stories.entry(story_id).or_insert_with(|| Progress::new(at));
                p.status = StoryStatus::InProgress;
                p.completed_media.clear();
                p.last_updated_at = at;
            }
            Event::MediaDone {
                story_id,
                index,
                at,
            } => {
                let p = self.stories.entry(story_id).or_insert_with(|| Progress::new(at));
                if p.status != StoryStatus::Complete {
                    p.status = StoryStatus::InProgress;
                    p.completed_media.insert(index);
                    p.last_updated_at = at;
                }
            }
            Event::Complete {
                story_id,
                media_count,
                at,
            } => {
                let p = self.stories.entry(story_id).or_insert_with(|| Progress::new(at));
                p.status = StoryStatus::Complete;
                p.completed_media.clear();
                p.media_count = media_count;
                p.last_updated_at = at;
            }
            Event::Pending { story_id, at } => {
                let p = self.stories.entry(story_id).or_insert_with(|| Progress::new(at));
                p.status = StoryStatus::Pending;
                p.completed_media.clear();
                p.last_updated_at = at;
            }
            Event::Cursor { page_token, .. } => self.cursor = page_token,
        }
    }

    /// Minimal event sequence reproducing this state.
    fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.stories.len() + 1);
        for (story_id, p) in &self.stories {
            let story_id = story_id.clone();
            let at = p.last_updated_at;
            match p.status {
                StoryStatus::Complete => events.push(Event::Complete {
                    story_id,
                    media_count: p.media_count,
                    at,
                }),
                StoryStatus::Pending => events.push(Event::Pending { story_id, at }),
                StoryStatus::InProgress => {
                    events.push(Event::InProgress {
                        story_id: story_id.clone(),
                        at,
                    });
                    events.extend(p.completed_media.iter().map(|&index| Event::MediaDone {
                        story_id: story_id.clone(),
                        index,
                        at,
                    }));
                }
            }
        }
        if self.cursor.is_some() {
            events.push(Event::Cursor {
                page_token: self.cursor.clone(),
                at: Utc::now(),
            });
        }
        events
    }
}

fn encode(event: &Event) -> Vec<u8> {
    // Plain strings, integers and timestamps only; cannot fail.
    let mut line = serde_json::to_vec(event).unwrap_or_default();
    line.push(b'\n');
    line
}

/// Durable checkpoint of story progress, backed by a JSON Lines journal.
///
/// The orchestrator is the only writer.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    journal: File,
    state: State,
}

impl CheckpointStore {
    /// Open (or create) the journal, replay it and compact it.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let state = Self::replay(&path).await?;

        let snapshot: Vec<u8> = state.snapshot().iter().flat_map(encode).collect();
        write_atomic(&path, &snapshot)
            .await
            .map_err(|e| Error::storage(&path, e))?;

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::storage(&path, e))?;

        let interrupted: Vec<&str> = state
            .stories
            .iter()
            .filter(|(_, p)| p.status == StoryStatus::InProgress)
            .map(|(id, _)| id.as_str())
            .collect();
        let complete = state
            .stories
            .values()
            .filter(|p| p.status == StoryStatus::Complete)
            .count();
        if !interrupted.is_empty() {
            warn!(
                stories = ?interrupted,
                "Found stories interrupted by a previous run; they will be re-checked"
            );
        }
        info!(
            tracked = state.stories.len(),
            complete,
            cursor = ?state.cursor,
            "Checkpoint loaded"
        );

        Ok(Self {
            path,
            journal,
            state,
        })
    }

    async fn replay(path: &Path) -> Result<State, Error> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(State::default()),
            Err(e) => return Err(Error::storage(path, e)),
        };

        let mut state = State::default();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let last = lines.len().saturating_sub(1);
        for (n, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => state.apply(event),
                Err(e) if n == last => {
                    warn!(line = n + 1, error = %e, "Ignoring torn final checkpoint line");
                }
                Err(e) => {
                    warn!(line = n + 1, error = %e, "Skipping unreadable checkpoint line");
                }
            }
        }
        Ok(state)
    }

    async fn append(&mut self, event: Event) -> Result<(), Error> {
        let line = encode(&event);
        let journal = &mut self.journal;
        let written = async {
            journal.write_all(&line).await?;
            journal.flush().await?;
            journal.sync_data().await
        }
        .await;
        written.map_err(|e| Error::storage(&self.path, e))?;
        debug!(?event, "Checkpoint event recorded");
        self.state.apply(event);
        Ok(())
    }

    /// All tracked stories, for startup recovery and reporting.
    pub fn load(&self) -> BTreeMap<String, CheckpointEntry> {
        self.state
            .stories
            .iter()
            .map(|(id, p)| (id.clone(), p.entry()))
            .collect()
    }

    /// Current row for one story.
    ///
    /// # Returns
    ///
    /// `None` for a story never seen before. For a complete story
    /// `completed_media_count` is the count recorded at completion.
    pub fn entry(&self, story_id: &str) -> Option<CheckpointEntry> {
        self.state.stories.get(story_id).map(Progress::entry)
    }

    pub fn is_complete(&self, story_id: &str) -> bool {
        self.state
            .stories
            .get(story_id)
            .is_some_and(|p| p.status == StoryStatus::Complete)
    }

    pub fn completed_count(&self) -> usize {
        self.state
            .stories
            .values()
            .filter(|p| p.status == StoryStatus::Complete)
            .count()
    }

    /// Start (or restart from scratch) work on a story.
    pub async fn mark_in_progress(&mut self, story_id: &str) -> Result<(), Error> {
        self.append(Event::InProgress {
            story_id: story_id.to_string(),
            at: Utc::now(),
        })
        .await
    }

    pub async fn record_media_done(&mut self, story_id: &str, media_index: usize) -> Result<(), Error> {
        self.append(Event::MediaDone {
            story_id: story_id.to_string(),
            index: media_index,
            at: Utc::now(),
        })
        .await
    }

    /// Idempotent: a story that is already complete is left untouched.
    pub async fn mark_complete(&mut self, story_id: &str) -> Result<(), Error> {
        if self.is_complete(story_id) {
            return Ok(());
        }
        let media_count = self
            .state
            .stories
            .get(story_id)
            .map_or(0, |p| p.completed_media.len());
        self.append(Event::Complete {
            story_id: story_id.to_string(),
            media_count,
            at: Utc::now(),
        })
        .await
    }

    /// Return a failed story to `pending` so the next run retries it.
    pub async fn mark_pending(&mut self, story_id: &str) -> Result<(), Error> {
        if self.is_complete(story_id) {
            return Ok(());
        }
        self.append(Event::Pending {
            story_id: story_id.to_string(),
            at: Utc::now(),
        })
        .await
    }

    /// Page token of the first listing page not yet fully complete.
    pub fn cursor(&self) -> Option<&str> {
        self.state.cursor.as_deref()
    }

    pub async fn set_cursor(&mut self, page_token: Option<String>) -> Result<(), Error> {
        if self.state.cursor == page_token {
            return Ok(());
        }
        self.append(Event::Cursor {
            page_token,
            at: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path().join("checkpoint.jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_progress_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cp = store(&dir).await;
            cp.mark_in_progress("S1").await.unwrap();
            cp.record_media_done("S1", 0).await.unwrap();
            cp.record_media_done("S1", 1).await.unwrap();
            cp.mark_complete("S1").await.unwrap();

            cp.mark_in_progress("S2").await.unwrap();
            cp.record_media_done("S2", 0).await.unwrap();
            // dropped without completing S2: simulated crash
        }

        let cp = store(&dir).await;
        assert!(cp.is_complete("S1"));
        assert!(!cp.is_complete("S2"));

        let entries = cp.load();
        assert_eq!(entries["S1"].status, StoryStatus::Complete);
        assert_eq!(entries["S1"].completed_media_count, 2);
        assert_eq!(entries["S2"].status, StoryStatus::InProgress);
        assert_eq!(entries["S2"].completed_media_count, 1);
    }

    #[tokio::test]
    async fn test_mark_complete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = store(&dir).await;
        cp.mark_in_progress("S1").await.unwrap();
        cp.mark_complete("S1").await.unwrap();

        let before = std::fs::read_to_string(dir.path().join("checkpoint.jsonl")).unwrap();
        cp.mark_complete("S1").await.unwrap();
        let after = std::fs::read_to_string(dir.path().join("checkpoint.jsonl")).unwrap();

        assert_eq!(before, after);
        assert!(cp.is_complete("S1"));
    }

    #[tokio::test]
    async fn test_restart_clears_partial_media() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = store(&dir).await;
        cp.mark_in_progress("S2").await.unwrap();
        cp.record_media_done("S2", 0).await.unwrap();
        cp.record_media_done("S2", 1).await.unwrap();

        cp.mark_in_progress("S2").await.unwrap();
        assert_eq!(cp.entry("S2").unwrap().completed_media_count, 0);
    }

    #[tokio::test]
    async fn test_every_call_is_on_disk_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");
        let mut cp = CheckpointStore::open(&path).await.unwrap();

        cp.mark_in_progress("S9").await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"in_progress\""));

        cp.record_media_done("S9", 3).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_torn_final_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");
        {
            let mut cp = CheckpointStore::open(&path).await.unwrap();
            cp.mark_in_progress("S1").await.unwrap();
            cp.mark_complete("S1").await.unwrap();
        }
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str(r#"{"event":"complete","story_id":"S2","med"#);
        std::fs::write(&path, text).unwrap();

        let cp = CheckpointStore::open(&path).await.unwrap();
        assert!(cp.is_complete("S1"));
        assert!(!cp.is_complete("S2"));

        // compaction dropped the torn line
        let compacted = std::fs::read_to_string(&path).unwrap();
        assert_eq!(compacted.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_pending_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cp = store(&dir).await;
            cp.mark_in_progress("S3").await.unwrap();
            cp.mark_pending("S3").await.unwrap();
            cp.set_cursor(Some("tok-2".into())).await.unwrap();
        }
        let mut cp = store(&dir).await;
        assert_eq!(cp.entry("S3").unwrap().status, StoryStatus::Pending);
        assert_eq!(cp.cursor(), Some("tok-2"));

        cp.set_cursor(None).await.unwrap();
        drop(cp);
        assert_eq!(store(&dir).await.cursor(), None);
    }

    #[tokio::test]
    async fn test_pending_never_downgrades_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = store(&dir).await;
        cp.mark_in_progress("S1").await.unwrap();
        cp.mark_complete("S1").await.unwrap();
        cp.mark_pending("S1").await.unwrap();
        assert!(cp.is_complete("S1"));
        assert_eq!(cp.completed_count(), 1);
    }
}
