//! Content signatures over reference folders.
//!
//! A folder signature hashes the sorted (relative path, mtime, size) triples
//! of its images, so any added, removed, renamed, touched or resized file
//! changes it. The root signature hashes the sorted folder signatures.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::reference::{group_by_folder, ReferenceImage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSignatures {
    pub root: String,
    pub folders: BTreeMap<String, String>,
}

pub fn compute_signatures(images: &[ReferenceImage]) -> FolderSignatures {
    let folders: BTreeMap<String, String> = group_by_folder(images)
        .into_iter()
        .map(|(folder, images)| {
            let digest = folder_digest(&images);
            (folder, digest)
        })
        .collect();

    let mut hasher = Sha256::new();
    for (folder, digest) in &folders {
        hasher.update(folder.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update([b'\n']);
    }
    FolderSignatures {
        root: format!("{:x}", hasher.finalize()),
        folders,
    }
}

fn folder_digest(images: &[&ReferenceImage]) -> String {
    let mut sorted: Vec<&&ReferenceImage> = images.iter().collect();
    sorted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut hasher = Sha256::new();
    for image in sorted {
        hasher.update(image.relative_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(image.modified_secs.to_le_bytes());
        hasher.update(image.modified_nanos.to_le_bytes());
        hasher.update(image.size.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Stable artifact key for a reference root: the hash of its canonical path.
pub fn root_key(root: &Path) -> String {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn image(rel: &str, secs: u64, size: u64) -> ReferenceImage {
        let folder = rel.rsplit_once('/').map(|(f, _)| f).unwrap_or(".");
        ReferenceImage {
            path: PathBuf::from(rel),
            relative_path: rel.to_string(),
            folder: folder.to_string(),
            modified_secs: secs,
            modified_nanos: 0,
            size,
        }
    }

    #[test]
    fn signatures_are_order_independent() {
        let a = vec![image("x/1.png", 10, 5), image("x/2.png", 11, 6), image("y/3.png", 12, 7)];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(compute_signatures(&a), compute_signatures(&b));
    }

    #[test]
    fn touching_a_file_changes_only_its_folder() {
        let before = vec![image("x/1.png", 10, 5), image("y/3.png", 12, 7)];
        let after = vec![image("x/1.png", 10, 5), image("y/3.png", 99, 7)];
        let (s1, s2) = (compute_signatures(&before), compute_signatures(&after));
        assert_eq!(s1.folders["x"], s2.folders["x"]);
        assert_ne!(s1.folders["y"], s2.folders["y"]);
        assert_ne!(s1.root, s2.root);
    }

    #[test]
    fn resizing_or_renaming_changes_signature() {
        let base = compute_signatures(&[image("x/1.png", 10, 5)]);
        assert_ne!(base, compute_signatures(&[image("x/1.png", 10, 6)]));
        assert_ne!(base, compute_signatures(&[image("x/2.png", 10, 5)]));
    }

    #[test]
    fn root_key_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(root_key(dir.path()), root_key(dir.path()));
        assert_eq!(root_key(dir.path()).len(), 32);
    }
}
