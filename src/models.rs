//! Data models shared by the fetch-and-download engine.
//!
//! - [`StoryDescriptor`] / [`MediaDescriptor`]: what the parsing collaborator
//!   extracts from a listing page, before any local path is attached
//! - [`Story`] / [`MediaRef`]: immutable units of work with deterministic
//!   destination paths, derived through [`DownloadLayout`]
//! - [`CheckpointEntry`] / [`StoryStatus`]: per-story progress
//! - [`SessionRecord`]: cached proof of authentication

use crate::utils::path_component;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the per-story metadata sidecar.
pub const STORY_METADATA_FILE: &str = "story.json";

/// Kind of a media asset; decides the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Anything the API does not call `"video"` is stored as an image.
    pub fn from_api(kind: Option<&str>) -> Self {
        match kind {
            Some("video") => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
        }
    }
}

/// One media asset as described by the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescriptor {
    /// Position in the listing's media array, counting items skipped for
    /// lack of a URL, so later assets keep their names if one gains a URL.
    pub position: usize,
    pub media_id: String,
    pub kind: MediaKind,
    pub source_url: String,
    pub expected_size: Option<u64>,
}

/// One story as described by the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryDescriptor {
    pub story_id: String,
    pub title: String,
    /// The raw listing object, persisted verbatim as the story's metadata.
    pub metadata: serde_json::Value,
    pub media: Vec<MediaDescriptor>,
}

/// A single page of the remote listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoriesPage {
    pub stories: Vec<StoryDescriptor>,
    pub next_page_token: Option<String>,
}

/// Maps story and asset identities onto the local download tree.
///
/// ```text
/// download_root/
/// └── {story_id}/
///     ├── story.json
///     ├── 000_{media_id}.jpg
///     └── 001_{media_id}.mp4
/// ```
///
/// Paths depend only on the story id, the asset position and the asset's
/// own id and kind, so re-listing the same story always yields the same paths.
#[derive(Debug, Clone)]
pub struct DownloadLayout {
    root: PathBuf,
}

impl DownloadLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one story's media and sidecar.
    ///
    /// # Arguments
    ///
    /// * `story_id` - Remote story identifier, any characters allowed
    ///
    /// # Returns
    ///
    /// `{root}/{component}` where the component is the id itself when it is
    /// already a safe file name, otherwise its sanitised form with a short
    /// checksum of the raw id appended (see [`path_component`]).
    pub fn story_dir(&self, story_id: &str) -> PathBuf {
        self.root.join(path_component(story_id, "story"))
    }

    /// Destination of one asset.
    ///
    /// # Arguments
    ///
    /// * `story_id` - Owning story
    /// * `media` - The asset; its `position`, `media_id` and `kind` make up the name
    ///
    /// # Returns
    ///
    /// `{story_dir}/{position:03}_{media_id}.{jpg|mp4}`.
    pub fn media_path(&self, story_id: &str, media: &MediaDescriptor) -> PathBuf {
        let name = format!(
            "{:03}_{}.{}",
            media.position,
            path_component(&media.media_id, "media"),
            media.kind.extension()
        );
        self.story_dir(story_id).join(name)
    }

    pub fn metadata_path(&self, story_id: &str) -> PathBuf {
        self.story_dir(story_id).join(STORY_METADATA_FILE)
    }
}

/// One downloadable asset belonging to a story.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    /// Position within the story's media list, as listed by the remote.
    pub index: usize,
    pub media_id: String,
    pub kind: MediaKind,
    pub source_url: String,
    pub destination_path: PathBuf,
    pub expected_size: Option<u64>,
}

/// One unit of work. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Story {
    pub story_id: String,
    pub title: String,
    pub metadata: serde_json::Value,
    pub media_refs: Vec<MediaRef>,
    pub metadata_path: PathBuf,
}

impl Story {
    pub fn from_descriptor(descriptor: StoryDescriptor, layout: &DownloadLayout) -> Self {
        let story_id = descriptor.story_id;
        let media_refs = descriptor
            .media
            .into_iter()
            .map(|media| MediaRef {
                index: media.position,
                destination_path: layout.media_path(&story_id, &media),
                media_id: media.media_id,
                kind: media.kind,
                source_url: media.source_url,
                expected_size: media.expected_size,
            })
            .collect();

        Self {
            metadata_path: layout.metadata_path(&story_id),
            story_id,
            title: descriptor.title,
            metadata: descriptor.metadata,
            media_refs,
        }
    }
}

/// Checkpoint status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Complete,
}

/// One row of the checkpoint, keyed by story id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub status: StoryStatus,
    pub completed_media_count: usize,
    pub last_updated_at: DateTime<Utc>,
}

/// Cached proof of authentication.
///
/// Usable only while `now < issued_at + ttl`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub cookies: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl SessionRecord {
    pub fn new(cookies: BTreeMap<String, String>, ttl_secs: u64) -> Self {
        Self {
            cookies,
            issued_at: Utc::now(),
            ttl_secs,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.issued_at
            .checked_add_signed(Duration::try_seconds(ttl).unwrap_or(Duration::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Value for a `Cookie` request header.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .join("; ")
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("cookies", &self.cookies.len())
            .field("issued_at", &self.issued_at)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}
