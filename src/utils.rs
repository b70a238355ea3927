//! Utility functions for path naming, log output and durable file writes.
//!
//! - Path-component sanitising so remote identifiers map onto safe file names
//! - String truncation for logging response bodies
//! - Download-root validation
//! - Atomic, synced file replacement used by the session cache, the
//!   checkpoint compactor and the story metadata sidecar

use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").unwrap());

/// Reduce an arbitrary remote identifier to a single safe path component.
///
/// Runs of characters outside `[a-zA-Z0-9_-]` collapse to one underscore and
/// leading/trailing underscores are stripped. Falls back to `fallback` if
/// nothing survives.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(sanitize_component("My Trip!", "x"), "My_Trip");
/// assert_eq!(sanitize_component("../..", "x"), "x");
/// ```
pub fn sanitize_component(raw: &str, fallback: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(raw, "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Map a remote identifier onto a path component that is unique per id.
///
/// Identifiers that are already safe are used unchanged. Anything else is
/// sanitised and gets the CRC-32 of the raw id appended, so `"a.b"` and
/// `"a_b"` never share a directory.
///
/// # Arguments
///
/// * `raw` - The remote identifier
/// * `fallback` - Name used when nothing of `raw` survives sanitising
///
/// # Returns
///
/// `raw`, or `{sanitised}-{crc32:08x}`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(path_component("12345", "x"), "12345");
/// assert_eq!(path_component("a.b", "x"), "a_b-XXXXXXXX");
/// ```
pub fn path_component(raw: &str, fallback: &str) -> String {
    let sanitized = sanitize_component(raw, fallback);
    if sanitized == raw {
        return sanitized;
    }
    format!("{sanitized}-{:08x}", crc32fast::hash(raw.as_bytes()))
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a char boundary) with an
/// ellipsis and byte count appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and removes a scratch file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path).await?;
    let scratch = path.join("..__write_check__");
    fs::File::create(&scratch).await?;
    let _ = fs::remove_file(&scratch).await;
    info!("Download directory is writable");
    Ok(())
}

/// Sibling path used while a file is being written.
pub fn partial_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `path` with `contents` so that readers see either the old file or
/// the complete new one.
///
/// Writes to a `.tmp` sibling, syncs it, renames it into place and syncs the
/// parent directory where the platform allows.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let tmp = partial_path(path, ".tmp");
    {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp, path).await?;
    sync_parent_dir(path).await;
    Ok(())
}

/// Best effort: directory fsync is not available on every platform.
pub async fn sync_parent_dir(path: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("12345", "x"), "12345");
        assert_eq!(sanitize_component("My Trip!", "x"), "My_Trip");
        assert_eq!(sanitize_component("a/b\\c", "x"), "a_b_c");
        assert_eq!(sanitize_component("../..", "x"), "x");
        assert_eq!(sanitize_component("", "untitled"), "untitled");
    }

    #[test]
    fn test_path_component_keeps_safe_ids_and_disambiguates_others() {
        assert_eq!(path_component("abc-7", "x"), "abc-7");

        let dotted = path_component("a.b", "x");
        assert!(dotted.starts_with("a_b-"));
        assert_eq!(dotted.len(), "a_b-".len() + 8);
        assert_ne!(dotted, path_component("a_b", "x"));
        assert_ne!(path_component("a.b", "x"), path_component("a:b", "x"));
        assert_eq!(path_component("a.b", "x"), dotted);

        assert!(path_component("", "story").starts_with("story-"));
    }

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        let s = "ééé";
        // 'é' is two bytes; cutting at 3 must back off to 2
        assert_eq!(truncate_for_log(s, 3), "é…(+4 bytes)");
    }

    #[test]
    fn test_partial_path() {
        let p = partial_path(Path::new("/x/000_a.jpg"), ".part");
        assert_eq!(p, PathBuf::from("/x/000_a.jpg.part"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert!(!partial_path(&path, ".tmp").exists());
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");
        ensure_writable_dir(&root).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
