//! Reference corpus: directory scanning and the in-memory entry set the
//! matcher runs against.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::error::{RecognitionError, Result};
use crate::fingerprint::ImageFingerprint;
use crate::metadata::CardMetadata;

/// Folder key used for images sitting directly in the reference root.
pub const ROOT_FOLDER: &str = ".";

/// A fingerprinted reference card.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEntry {
    /// `/`-separated path relative to the reference root. Unique key.
    pub relative_path: String,
    pub folder: String,
    pub fingerprint: ImageFingerprint,
    pub metadata: Option<CardMetadata>,
}

/// All reference entries of one root, keyed and iterated by relative path.
/// Read-only once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    root: PathBuf,
    entries: BTreeMap<String, ReferenceEntry>,
}

impl ReferenceSet {
    pub fn new(root: impl Into<PathBuf>, entries: BTreeMap<String, ReferenceEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Option<&ReferenceEntry> {
        self.entries.get(relative_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceEntry> {
        self.entries.values()
    }

    pub fn entries(&self) -> &BTreeMap<String, ReferenceEntry> {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a ReferenceSet {
    type Item = &'a ReferenceEntry;
    type IntoIter = std::collections::btree_map::Values<'a, String, ReferenceEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

/// A reference image found on disk, with the file facts its folder
/// signature is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub path: PathBuf,
    pub relative_path: String,
    pub folder: String,
    pub modified_secs: u64,
    pub modified_nanos: u32,
    pub size: u64,
}

/// Accepts names without Windows-forbidden characters and with a jpg, jpeg or
/// png extension, in any case.
pub fn is_valid_image_name(name: &str) -> bool {
    static VALID_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    VALID_NAME
        .get_or_init(|| Regex::new(r#"(?i)^[^\\/?%*:|"<>]+\.(jpg|jpeg|png)$"#).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn folder_of(relative_path: &str) -> String {
    match relative_path.rsplit_once('/') {
        Some((folder, _)) => folder.to_string(),
        None => ROOT_FOLDER.to_string(),
    }
}

/// Every valid reference image under `root`, at any depth, sorted by
/// relative path. Unreadable entries are skipped with a warning.
pub fn scan_reference_root(root: &Path) -> Result<Vec<ReferenceImage>> {
    if !root.is_dir() {
        return Err(RecognitionError::MissingReferenceRoot(root.to_path_buf()));
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable reference entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_valid_image_name(&name) {
            tracing::debug!(file = %entry.path().display(), "skipping file with unsupported name");
            continue;
        }
        let Some(relative_path) = relative_key(root, entry.path()) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(file = %entry.path().display(), error = %e, "skipping reference without metadata");
                continue;
            }
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        images.push(ReferenceImage {
            path: entry.path().to_path_buf(),
            folder: folder_of(&relative_path),
            relative_path,
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
            size: meta.len(),
        });
    }

    images.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(images)
}

pub fn group_by_folder(images: &[ReferenceImage]) -> BTreeMap<String, Vec<&ReferenceImage>> {
    let mut folders: BTreeMap<String, Vec<&ReferenceImage>> = BTreeMap::new();
    for image in images {
        folders.entry(image.folder.clone()).or_default().push(image);
    }
    folders
}

/// Valid image files under a test directory, sorted by path.
pub fn collect_test_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(RecognitionError::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "test directory not found"),
        });
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_valid_image_name(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn name_rule_matches_allow_list() {
        assert!(is_valid_image_name("Pikachu_皮卡丘123.jpg"));
        assert!(is_valid_image_name("card.PNG"));
        assert!(is_valid_image_name("a b.jpeg"));
        assert!(!is_valid_image_name("card.gif"));
        assert!(!is_valid_image_name("what?.png"));
        assert!(!is_valid_image_name("notes.txt"));
        assert!(!is_valid_image_name(".png"));
    }

    #[test]
    fn scan_walks_nested_folders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sv1/promo")).unwrap();
        fs::write(root.join("top.png"), b"x").unwrap();
        fs::write(root.join("sv1/001.jpg"), b"xy").unwrap();
        fs::write(root.join("sv1/promo/p1.JPEG"), b"xyz").unwrap();
        fs::write(root.join("sv1/readme.txt"), b"ignored").unwrap();

        let images = scan_reference_root(root).unwrap();
        let keys: Vec<(&str, &str)> = images
            .iter()
            .map(|i| (i.relative_path.as_str(), i.folder.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("sv1/001.jpg", "sv1"), ("sv1/promo/p1.JPEG", "sv1/promo"), ("top.png", ".")]
        );
        assert_eq!(images[0].size, 2);

        let folders = group_by_folder(&images);
        assert_eq!(folders.keys().collect::<Vec<_>>(), vec![".", "sv1", "sv1/promo"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_reference_root(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, RecognitionError::MissingReferenceRoot(_)));
    }

    #[test]
    fn test_images_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.jpg"), b"x").unwrap();
        fs::write(dir.path().join("a.png"), b"x").unwrap();
        fs::write(dir.path().join("c.bmp"), b"x").unwrap();
        let paths = collect_test_images(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg"]);
    }
}
