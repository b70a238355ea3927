//! Decides whether a media asset still has to be downloaded.
//!
//! Policy, in order:
//! 1. nothing at the destination path: download
//! 2. a file is there and the expected size is known: download again if the
//!    sizes differ (a corrupt or truncated earlier download)
//! 3. a file is there and no size is known: trust it
//!
//! Tier 3 means a truncated file from a source that advertises no size is
//! accepted as done. Downloads are written to a `.part` sibling and renamed
//! only once complete, so this can only happen to files placed by other tools.

use crate::models::MediaRef;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    Present,
}

impl Verdict {
    pub fn needs_download(self) -> bool {
        !matches!(self, Verdict::Present)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Deduplicator;

impl Deduplicator {
    pub fn check_size(expected: Option<u64>, actual: u64) -> Verdict {
        match expected {
            Some(expected) if expected != actual => Verdict::SizeMismatch { expected, actual },
            _ => Verdict::Present,
        }
    }

    pub async fn check(&self, media: &MediaRef) -> Verdict {
        let verdict = match fs::metadata(&media.destination_path).await {
            Ok(meta) if meta.is_file() => Self::check_size(media.expected_size, meta.len()),
            _ => Verdict::Missing,
        };
        match verdict {
            Verdict::SizeMismatch { expected, actual } => info!(
                path = %media.destination_path.display(),
                expected,
                actual,
                "Existing file has the wrong size; downloading again"
            ),
            Verdict::Present => debug!(
                path = %media.destination_path.display(),
                "File already exists; skipping download"
            ),
            Verdict::Missing => {}
        }
        verdict
    }

    pub async fn needs_download(&self, media: &MediaRef) -> bool {
        self.check(media).await.needs_download()
    }
}
