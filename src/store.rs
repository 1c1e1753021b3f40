//! Versioned JSON record collections with tolerant reads and atomic writes.
//!
//! A collection file holds `{"version": 1, "records": [...]}`. Reads treat
//! a missing or corrupt file as an empty collection; writes always replace
//! the whole file via a temp-then-rename. All operations against the same
//! file are serialized through the per-path lock table.

use crate::{data_dir, lock};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A collection document as persisted on disk: a format version and an
/// ordered sequence of records whose shape is owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    /// Format version of the collection file. Always a positive integer,
    /// currently 1.
    pub version: u64,
    /// The records themselves. The store never inspects their shape.
    pub records: Vec<T>,
}

impl<T> Default for Document<T> {
    fn default() -> Self {
        Self {
            version: 1,
            records: Vec::new(),
        }
    }
}

impl<T> Document<T> {
    /// An empty collection at the current format version.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Read the named collection.
///
/// A missing or corrupt file reads as an empty collection rather than an
/// error, and malformed fields are normalized: a missing or falsy `version`
/// becomes 1, a non-array `records` becomes empty. The first read of a
/// missing collection seeds the file, so a collection file always exists
/// on disk after it has been read once.
pub fn read_collection<T>(name: &str) -> Result<Document<T>>
where
    T: DeserializeOwned + Serialize,
{
    let path = data_dir::collection_path(name)?;
    let _guard = lock::acquire(&path);

    let existed = path.exists();
    let document = load_document(&path);
    if !existed {
        write_document(&path, &document)?;
    }
    Ok(document)
}

/// Replace the named collection with `document`, atomically.
pub fn write_collection<T: Serialize>(name: &str, document: &Document<T>) -> Result<()> {
    let path = data_dir::collection_path(name)?;
    let _guard = lock::acquire(&path);
    write_document(&path, document)
}

/// Read-modify-write the named collection under a single lock hold.
///
/// 1. Acquires the collection file's lock
/// 2. Reads the current document (empty if missing or corrupt)
/// 3. Applies the mutation function `f`
/// 4. Writes the modified document atomically
/// 5. Releases the lock (via RAII guard drop)
///
/// This is the primary API for concurrent store access: separate read and
/// write calls release the lock in between.
pub fn update_collection<T, F>(name: &str, f: F) -> Result<()>
where
    T: DeserializeOwned + Serialize,
    F: FnOnce(&mut Document<T>),
{
    let path = data_dir::collection_path(name)?;
    let _guard = lock::acquire(&path);

    let mut document = load_document(&path);
    f(&mut document);
    write_document(&path, &document)
}

/// Read and normalize a collection file, treating any failure as an empty
/// collection. The caller must hold the path's lock.
fn load_document<T: DeserializeOwned>(path: &Path) -> Document<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Document::default(),
    };
    match serde_json::from_str(&content) {
        Ok(raw) => normalize_document(path, raw),
        Err(err) => {
            log::warn!(
                "treating corrupt collection file {} as empty: {}",
                path.display(),
                err
            );
            Document::default()
        }
    }
}

/// Normalize a parsed collection file. Guards against manually-edited or
/// partially-written files: `version` must be a positive integer, `records`
/// must be an array of well-formed records.
fn normalize_document<T: DeserializeOwned>(path: &Path, mut raw: Value) -> Document<T> {
    let version = raw
        .get("version")
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
        .unwrap_or(1);

    let records = match raw.get_mut("records").map(Value::take) {
        Some(items @ Value::Array(_)) => match serde_json::from_value(items) {
            Ok(records) => records,
            Err(err) => {
                log::warn!(
                    "discarding malformed records in {}: {}",
                    path.display(),
                    err
                );
                Vec::new()
            }
        },
        Some(_) => {
            log::warn!("records field in {} is not an array", path.display());
            Vec::new()
        }
        None => Vec::new(),
    };

    Document { version, records }
}

/// Write a document atomically: serialize into a uniquely-named temporary
/// file next to the target, then rename over it. Readers never observe a
/// partially-written document, and a failed write leaves the previous
/// document intact. The caller must hold the path's lock.
fn write_document<T: Serialize>(path: &Path, document: &Document<T>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(document)
        .context("Failed to serialize collection document")?;

    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, &json)
        .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err)
            .with_context(|| format!("Failed to replace collection file: {}", path.display()));
    }
    Ok(())
}

/// Unique sibling path for one write attempt. Staying in the target's
/// directory keeps the final rename on a single filesystem.
fn temp_path_for(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let stamp = Utc::now().timestamp_micros();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("{stamp}-{seq}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: String,
        title: String,
    }

    fn post(id: &str, title: &str) -> Post {
        Post {
            id: id.into(),
            title: title.into(),
        }
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nonexistent.json");

        let document: Document<Post> = load_document(&path);
        assert_eq!(document, Document::default());
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");
        fs::write(&path, "{\"version\": 1, \"records\": [{\"id\"").unwrap();

        let document: Document<Post> = load_document(&path);
        assert_eq!(document, Document::default());

        // The corrupt file is left alone; only a write replaces it
        assert!(fs::read_to_string(&path).unwrap().ends_with("[{\"id\""));
    }

    #[test]
    fn test_empty_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");
        fs::write(&path, "").unwrap();

        let document: Document<Post> = load_document(&path);
        assert_eq!(document, Document::default());
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");

        let document = Document {
            version: 1,
            records: vec![post("a", "first"), post("b", "second")],
        };
        write_document(&path, &document).unwrap();

        let reread: Document<Post> = load_document(&path);
        assert_eq!(reread, document);
    }

    #[test]
    fn test_normalizes_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");
        fs::write(&path, "{}").unwrap();

        let document: Document<Post> = load_document(&path);
        assert_eq!(document.version, 1);
        assert!(document.records.is_empty());
    }

    #[test]
    fn test_normalizes_non_array_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");
        fs::write(&path, "{\"version\": 7, \"records\": \"not-an-array\"}").unwrap();

        let document: Document<Post> = load_document(&path);
        assert_eq!(document.version, 7);
        assert!(document.records.is_empty());
    }

    #[test]
    fn test_normalizes_falsy_version() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");

        for bad in ["0", "-3", "null", "\"two\""] {
            fs::write(&path, format!("{{\"version\": {bad}, \"records\": []}}")).unwrap();
            let document: Document<Post> = load_document(&path);
            assert_eq!(document.version, 1, "version {bad} should normalize to 1");
        }
    }

    #[test]
    fn test_discards_records_of_wrong_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");
        fs::write(&path, "{\"version\": 1, \"records\": [{\"count\": 3}]}").unwrap();

        let document: Document<Post> = load_document(&path);
        assert!(document.records.is_empty());
    }

    #[test]
    fn test_write_is_pretty_printed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");

        write_document(&path, &Document::<Post>::default()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\n  \"version\": 1"));
        assert!(content.contains("\n  \"records\": []"));
    }

    #[test]
    fn test_write_cleans_up_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");

        let document = Document {
            version: 1,
            records: vec![post("a", "first")],
        };
        write_document(&path, &document).unwrap();

        // Only the target file remains in the directory
        let entries: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["posts.json"]);
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("dir").join("posts.json");

        write_document(&path, &Document::<Post>::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_interrupted_write_leaves_target_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.json");

        let original = Document {
            version: 1,
            records: vec![post("a", "first")],
        };
        write_document(&path, &original).unwrap();
        let before = fs::read(&path).unwrap();

        // A writer dying after the temp write but before the rename leaves
        // only a stray temp file behind
        let stalled = temp_path_for(&path);
        fs::write(
            &stalled,
            "{\"version\": 1, \"records\": [{\"id\": \"b\", \"title\": \"half\"}]}",
        )
        .unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
        let reread: Document<Post> = load_document(&path);
        assert_eq!(reread, original);
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let path = Path::new("/data/posts.json");
        let first = temp_path_for(path);
        let second = temp_path_for(path);
        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
    }
}
