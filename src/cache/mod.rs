//! Persistent reference cache.
//!
//! Loading a reference root picks one of four paths:
//! - fast path: the root signature matches the snapshot, nothing is decoded;
//! - partial: only folders whose signature changed are re-fingerprinted;
//! - full: no usable snapshot (missing, unreadable, expired, or built with
//!   other fingerprint parameters);
//! - uncached: caching is disabled, everything is built in memory.
//!
//! Persistence failures are logged and never abort the load.

pub mod signature;
pub mod snapshot;

use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::{CacheError, RecognitionError, Result};
use crate::fingerprint::Fingerprinter;
use crate::metadata::CardCatalog;
use crate::reference::{group_by_folder, scan_reference_root, ReferenceEntry, ReferenceImage, ReferenceSet};

use self::signature::{compute_signatures, root_key, FolderSignatures};
use self::snapshot::{CacheSnapshot, EntryRecord};

const SNAPSHOT_EXTENSION: &str = "refcache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    NoSnapshot,
    Unreadable(String),
    Expired,
    ParametersChanged,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::NoSnapshot => write!(f, "no snapshot"),
            RebuildReason::Unreadable(e) => write!(f, "unreadable snapshot ({e})"),
            RebuildReason::Expired => write!(f, "snapshot expired"),
            RebuildReason::ParametersChanged => write!(f, "fingerprint parameters changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPath {
    Uncached,
    FastPath,
    Partial {
        reused: Vec<String>,
        rebuilt: Vec<String>,
        removed: Vec<String>,
    },
    Full { reason: RebuildReason },
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub path: LoadPath,
    pub entries: usize,
    /// Images decoded and fingerprinted during this load.
    pub fingerprinted: usize,
    /// Images that failed to decode or had too little texture.
    pub skipped: usize,
    pub elapsed: Duration,
}

pub struct ReferenceCache {
    config: CacheConfig,
    fingerprinter: Fingerprinter,
}

impl ReferenceCache {
    pub fn new(config: CacheConfig, fingerprinter: Fingerprinter) -> Self {
        Self {
            config,
            fingerprinter,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.resolved_dir()
    }

    pub fn snapshot_path(&self, root: &Path) -> PathBuf {
        self.cache_dir()
            .join(format!("{}.{}", root_key(root), SNAPSHOT_EXTENSION))
    }

    /// Build the reference set for `root`, reusing whatever the snapshot
    /// still covers. Metadata from `catalog` is attached to every entry; an
    /// empty catalogue keeps the metadata already stored in the snapshot.
    pub fn load(&self, root: &Path, catalog: &CardCatalog) -> Result<(ReferenceSet, LoadReport)> {
        let started = Instant::now();
        let images = scan_reference_root(root)?;
        if images.is_empty() {
            return Err(RecognitionError::EmptyReferenceSet(root.to_path_buf()));
        }
        let signatures = compute_signatures(&images);

        let (mut entries, path, fingerprinted, skipped, created_at) = if !self.config.enabled {
            let (entries, skipped) = self.fingerprint_images(&images.iter().collect::<Vec<_>>());
            (entries, LoadPath::Uncached, images.len(), skipped, Utc::now())
        } else {
            match self.read_usable_snapshot(root) {
                Ok(snapshot) if snapshot.root_signature == signatures.root => {
                    match restore_entries(snapshot.entries) {
                        Some(entries) => (entries, LoadPath::FastPath, 0, 0, snapshot.created_at),
                        None => self.full_build(&images, RebuildReason::Unreadable("invalid entry".into())),
                    }
                }
                Ok(snapshot) => self.partial_build(&images, &signatures, snapshot),
                Err(reason) => self.full_build(&images, reason),
            }
        };

        if !catalog.is_empty() {
            entries.par_iter_mut().for_each(|(_, entry)| {
                entry.metadata = catalog.lookup(&entry.relative_path).cloned();
            });
        }

        if self.config.enabled && path != LoadPath::FastPath {
            let snapshot = CacheSnapshot {
                root_path: canonical_string(root),
                fingerprint_digest: self.fingerprinter.config().digest(),
                root_signature: signatures.root.clone(),
                folder_signatures: signatures.folders.clone(),
                entries: entries.values().map(EntryRecord::from).collect(),
                created_at,
            };
            if let Err(e) = self.write_snapshot(&self.snapshot_path(root), &snapshot) {
                tracing::warn!(error = %e, "failed to persist reference cache, continuing");
            }
        }

        let report = LoadReport {
            entries: entries.len(),
            path,
            fingerprinted,
            skipped,
            elapsed: started.elapsed(),
        };
        log_report(root, &report);
        Ok((ReferenceSet::new(root, entries), report))
    }

    /// Remove the snapshot for one root. Returns whether a file was deleted.
    pub fn clear(&self, root: &Path) -> std::result::Result<bool, CacheError> {
        let path = self.snapshot_path(root);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Remove every snapshot in the cache directory, plus temp files left by
    /// an interrupted save. Returns how many files were deleted.
    pub fn clear_all(&self) -> std::result::Result<usize, CacheError> {
        let dir = self.cache_dir();
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(CacheError::Io { path: dir, source }),
        };
        let mut removed = 0;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if is_snapshot_file(&path) {
                fs::remove_file(&path).map_err(|source| CacheError::Io { path: path.clone(), source })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn read_usable_snapshot(&self, root: &Path) -> std::result::Result<CacheSnapshot, RebuildReason> {
        let path = self.snapshot_path(root);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(RebuildReason::NoSnapshot),
            Err(e) => return Err(RebuildReason::Unreadable(e.to_string())),
        };
        let snapshot = snapshot::decode(&bytes).map_err(|e| {
            tracing::warn!(file = %path.display(), error = %e, "discarding unreadable reference cache");
            RebuildReason::Unreadable(e.to_string())
        })?;
        if snapshot.fingerprint_digest != self.fingerprinter.config().digest() {
            return Err(RebuildReason::ParametersChanged);
        }
        if snapshot.is_expired(Utc::now(), self.config.max_age_days) {
            return Err(RebuildReason::Expired);
        }
        Ok(snapshot)
    }

    fn full_build(
        &self,
        images: &[ReferenceImage],
        reason: RebuildReason,
    ) -> (BTreeMap<String, ReferenceEntry>, LoadPath, usize, usize, chrono::DateTime<Utc>) {
        tracing::info!(%reason, images = images.len(), "building reference cache");
        let (entries, skipped) = self.fingerprint_images(&images.iter().collect::<Vec<_>>());
        (entries, LoadPath::Full { reason }, images.len(), skipped, Utc::now())
    }

    fn partial_build(
        &self,
        images: &[ReferenceImage],
        signatures: &FolderSignatures,
        snapshot: CacheSnapshot,
    ) -> (BTreeMap<String, ReferenceEntry>, LoadPath, usize, usize, chrono::DateTime<Utc>) {
        let mut reused = Vec::new();
        let mut rebuilt = Vec::new();
        let mut to_fingerprint: Vec<&ReferenceImage> = Vec::new();
        for (folder, folder_images) in group_by_folder(images) {
            if snapshot.folder_signatures.get(&folder) == signatures.folders.get(&folder) {
                reused.push(folder);
            } else {
                to_fingerprint.extend(folder_images);
                rebuilt.push(folder);
            }
        }
        let removed: Vec<String> = snapshot
            .folder_signatures
            .keys()
            .filter(|folder| !signatures.folders.contains_key(*folder))
            .cloned()
            .collect();

        let keep: BTreeSet<&str> = reused.iter().map(String::as_str).collect();
        let cached: Vec<EntryRecord> = snapshot
            .entries
            .into_iter()
            .filter(|record| keep.contains(record.folder.as_str()))
            .collect();
        let Some(mut entries) = restore_entries(cached) else {
            return self.full_build(images, RebuildReason::Unreadable("invalid entry".into()));
        };

        tracing::info!(
            reused = reused.len(),
            rebuilt = rebuilt.len(),
            removed = removed.len(),
            "partially rebuilding reference cache"
        );
        let fingerprinted = to_fingerprint.len();
        let (fresh, skipped) = self.fingerprint_images(&to_fingerprint);
        entries.extend(fresh);
        (
            entries,
            LoadPath::Partial {
                reused,
                rebuilt,
                removed,
            },
            fingerprinted,
            skipped,
            snapshot.created_at,
        )
    }

    fn fingerprint_images(&self, images: &[&ReferenceImage]) -> (BTreeMap<String, ReferenceEntry>, usize) {
        let results: Vec<Option<ReferenceEntry>> = images
            .par_iter()
            .map(|image| match self.fingerprinter.fingerprint_path(&image.path) {
                Ok(Some(fingerprint)) => Some(ReferenceEntry {
                    relative_path: image.relative_path.clone(),
                    folder: image.folder.clone(),
                    fingerprint,
                    metadata: None,
                }),
                Ok(None) => {
                    tracing::debug!(file = %image.relative_path, "reference has too little texture, skipped");
                    None
                }
                Err(e) => {
                    tracing::warn!(file = %image.relative_path, error = %e, "failed to fingerprint reference");
                    None
                }
            })
            .collect();

        let skipped = results.iter().filter(|r| r.is_none()).count();
        let entries = results
            .into_iter()
            .flatten()
            .map(|entry| (entry.relative_path.clone(), entry))
            .collect();
        (entries, skipped)
    }

    fn write_snapshot(&self, path: &Path, snapshot: &CacheSnapshot) -> std::result::Result<(), CacheError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let bytes = snapshot::encode(snapshot)?;
        // 先写临时文件再 rename，避免并发读到半截文件
        let tmp = path.with_extension(format!("{}.tmp{}", SNAPSHOT_EXTENSION, std::process::id()));
        if let Err(source) = fs::write(&tmp, &bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io { path: tmp, source });
        }
        if let Err(source) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        tracing::debug!(file = %path.display(), bytes = bytes.len(), "reference cache saved");
        Ok(())
    }
}

/// `<key>.refcache` or a leftover `<key>.refcache.tmp<pid>`.
fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some((_, suffix)) = name.split_once('.') else {
        return false;
    };
    suffix == SNAPSHOT_EXTENSION
        || suffix
            .strip_prefix(SNAPSHOT_EXTENSION)
            .and_then(|rest| rest.strip_prefix(".tmp"))
            .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
}

fn restore_entries(records: Vec<EntryRecord>) -> Option<BTreeMap<String, ReferenceEntry>> {
    records
        .into_iter()
        .map(|record| record.into_entry().map(|entry| (entry.relative_path.clone(), entry)))
        .collect()
}

fn canonical_string(root: &Path) -> String {
    root.canonicalize()
        .unwrap_or_else(|_| root.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn log_report(root: &Path, report: &LoadReport) {
    let elapsed_ms = report.elapsed.as_millis() as u64;
    match &report.path {
        LoadPath::FastPath => {
            tracing::info!(root = %root.display(), entries = report.entries, elapsed_ms, "reference cache hit")
        }
        LoadPath::Partial { rebuilt, .. } => tracing::info!(
            root = %root.display(),
            entries = report.entries,
            rebuilt_folders = rebuilt.len(),
            fingerprinted = report.fingerprinted,
            skipped = report.skipped,
            elapsed_ms,
            "reference cache updated"
        ),
        LoadPath::Full { reason } => tracing::info!(
            root = %root.display(),
            entries = report.entries,
            %reason,
            skipped = report.skipped,
            elapsed_ms,
            "reference cache rebuilt"
        ),
        LoadPath::Uncached => tracing::info!(
            root = %root.display(),
            entries = report.entries,
            skipped = report.skipped,
            elapsed_ms,
            "references fingerprinted without cache"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FingerprintConfig;
    use image::{GrayImage, Luma};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::fs::File;
    use std::time::SystemTime;

    fn textured(seed: u64) -> GrayImage {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let blocks: Vec<u8> = (0..(20 * 28)).map(|_| rng.gen()).collect();
        GrayImage::from_fn(160, 224, |x, y| Luma([blocks[((y / 8) * 20 + x / 8) as usize]]))
    }

    fn write_refs(root: &Path, files: &[(&str, u64)]) {
        for (rel, seed) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            textured(*seed).save(&path).unwrap();
        }
    }

    fn cache_in(dir: &Path) -> ReferenceCache {
        let config = CacheConfig {
            cache_dir: Some(dir.to_path_buf()),
            ..CacheConfig::default()
        };
        ReferenceCache::new(config, Fingerprinter::new(FingerprintConfig::default()))
    }

    fn bump_mtime(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(120);
        File::options().write(true).open(path).unwrap().set_modified(later).unwrap();
    }

    #[test]
    fn second_load_takes_fast_path() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("a/1.png", 1), ("a/2.png", 2), ("b/3.png", 3)]);
        let cache = cache_in(cache_dir.path());

        let (first, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::Full { reason: RebuildReason::NoSnapshot });
        assert_eq!(first.len(), 3);

        let (second, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::FastPath);
        assert_eq!(report.fingerprinted, 0);
        assert_eq!(first.entries(), second.entries());
    }

    #[test]
    fn touched_folder_is_rebuilt_alone() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("a/1.png", 1), ("a/2.png", 2), ("b/3.png", 3)]);
        let cache = cache_in(cache_dir.path());
        let (before, _) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        bump_mtime(&refs.path().join("b/3.png"));
        write_refs(refs.path(), &[("c/4.png", 4)]);
        let (after, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(
            report.path,
            LoadPath::Partial {
                reused: vec!["a".into()],
                rebuilt: vec!["b".into(), "c".into()],
                removed: vec![],
            }
        );
        assert_eq!(report.fingerprinted, 2);
        assert_eq!(after.len(), 4);
        assert_eq!(before.get("a/1.png"), after.get("a/1.png"));
    }

    #[test]
    fn deleted_folder_is_dropped() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("a/1.png", 1), ("b/3.png", 3)]);
        let cache = cache_in(cache_dir.path());
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        fs::remove_dir_all(refs.path().join("b")).unwrap();
        let (set, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert!(matches!(report.path, LoadPath::Partial { ref removed, .. } if removed == &vec!["b".to_string()]));
        assert_eq!(set.len(), 1);
        assert!(set.get("b/3.png").is_none());
    }

    #[test]
    fn corrupt_snapshot_triggers_full_rebuild() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        let cache = cache_in(cache_dir.path());
        let (good, _) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        fs::write(cache.snapshot_path(refs.path()), b"garbage").unwrap();
        let (rebuilt, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert!(matches!(report.path, LoadPath::Full { reason: RebuildReason::Unreadable(_) }));
        assert_eq!(good.entries(), rebuilt.entries());

        let (_, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::FastPath);
    }

    #[test]
    fn expired_snapshot_is_rebuilt() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        let cache = cache_in(cache_dir.path());
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        let path = cache.snapshot_path(refs.path());
        let mut snapshot = snapshot::decode(&fs::read(&path).unwrap()).unwrap();
        snapshot.created_at = Utc::now() - chrono::Duration::days(31);
        fs::write(&path, snapshot::encode(&snapshot).unwrap()).unwrap();

        let (_, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::Full { reason: RebuildReason::Expired });
    }

    #[test]
    fn changed_parameters_invalidate_snapshot() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        cache_in(cache_dir.path()).load(refs.path(), &CardCatalog::empty()).unwrap();

        let other = ReferenceCache::new(
            CacheConfig {
                cache_dir: Some(cache_dir.path().to_path_buf()),
                ..CacheConfig::default()
            },
            Fingerprinter::new(FingerprintConfig {
                max_features: 100,
                ..FingerprintConfig::default()
            }),
        );
        let (_, report) = other.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::Full { reason: RebuildReason::ParametersChanged });
    }

    #[test]
    fn unwritable_cache_dir_is_not_fatal() {
        let refs = tempfile::tempdir().unwrap();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        // a regular file where the cache directory should be
        let cache = cache_in(blocker.path());
        let (set, _) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn clear_removes_snapshots() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        let cache = cache_in(cache_dir.path());
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        assert!(cache.clear(refs.path()).unwrap());
        assert!(!cache.clear(refs.path()).unwrap());
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(cache.clear_all().unwrap(), 1);
        assert!(!cache.snapshot_path(refs.path()).exists());
    }

    #[test]
    fn clear_all_sweeps_interrupted_saves() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        let cache = cache_in(cache_dir.path());
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();

        let stale = cache_dir.path().join("0123abcd.refcache.tmp4242");
        fs::write(&stale, b"half a snapshot").unwrap();
        let unrelated = cache_dir.path().join("notes.txt");
        fs::write(&unrelated, b"keep me").unwrap();

        // saving again must not leave its own temp file behind
        bump_mtime(&refs.path().join("1.png"));
        cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        let temps = fs::read_dir(cache_dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .count();
        assert_eq!(temps, 1);

        assert_eq!(cache.clear_all().unwrap(), 2);
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn snapshot_file_names() {
        assert!(is_snapshot_file(Path::new("/c/abc.refcache")));
        assert!(is_snapshot_file(Path::new("/c/abc.refcache.tmp17")));
        assert!(!is_snapshot_file(Path::new("/c/abc.refcache.tmp")));
        assert!(!is_snapshot_file(Path::new("/c/abc.json")));
        assert!(!is_snapshot_file(Path::new("/c/refcache")));
    }

    #[test]
    fn disabled_cache_writes_nothing() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_refs(refs.path(), &[("1.png", 1), ("2.png", 2)]);
        let cache = ReferenceCache::new(
            CacheConfig {
                cache_dir: Some(cache_dir.path().to_path_buf()),
                enabled: false,
                ..CacheConfig::default()
            },
            Fingerprinter::new(FingerprintConfig::default()),
        );
        let (_, report) = cache.load(refs.path(), &CardCatalog::empty()).unwrap();
        assert_eq!(report.path, LoadPath::Uncached);
        assert_eq!(fs::read_dir(cache_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_root_is_an_error() {
        let refs = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let err = cache_in(cache_dir.path()).load(refs.path(), &CardCatalog::empty()).unwrap_err();
        assert!(matches!(err, RecognitionError::EmptyReferenceSet(_)));
    }
}
