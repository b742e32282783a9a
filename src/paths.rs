//! Working out which folder a detector's recorded paths are relative to.
//!
//! Detector output records paths relative to wherever the detector was pointed.
//! That may be the dataset root, or a subfolder beneath it when the dataset was
//! later opened one level up. `detect_likely_path_base` samples the recorded
//! paths against the file system to decide, and `apply_prefix_to_all_paths`
//! rewrites the paths once a subfolder base is known.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use crate::document::RecognitionDocument;
use crate::progress::{percent, Cadence, CancelStatus, CancelToken, ProgressSink, ProgressUpdate};
use crate::storage::FileIndex;

/// What the recorded paths were found to be relative to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathBase {
    RootRelative,
    SubFolderRelative,
    NoMatch,
    Cancelled,
}

/// Replace `\` with `/`.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Split a recorded path into `(folder, file name)` with `/` separators and
/// no leading or trailing slash on the folder.
pub fn split_recorded_path(path: &str) -> (String, String) {
    let normalized = normalize_separators(path);
    match normalized.rsplit_once('/') {
        Some((folder, name)) => (folder.trim_matches('/').to_string(), name.to_string()),
        None => (String::new(), normalized),
    }
}

/// Case-folded `(folder, file name)` used to match recorded paths against
/// catalog rows. File names compare without regard to case, as on the
/// Windows volumes these datasets are usually collected on.
pub fn location_key(path: &str) -> (String, String) {
    let (folder, name) = split_recorded_path(path);
    (folder.to_lowercase(), name.to_lowercase())
}

fn normalize_prefix(prefix: &str) -> String {
    normalize_separators(prefix).trim_matches('/').to_string()
}

/// Infer whether the document's paths are relative to `root` or to
/// `root/subfolder_prefix`.
///
/// The first image giving evidence either way decides; later images are not
/// consulted. A check that fails with an I/O error counts as no evidence.
pub fn detect_likely_path_base(
    document: &RecognitionDocument,
    root: &Path,
    subfolder_prefix: &str,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
    cadence: Cadence,
) -> PathBase {
    let prefix = normalize_prefix(subfolder_prefix);
    let prefix_with_separator = format!("{}/", prefix);
    let total = document.images.len();

    for (i, image) in document.images.iter().enumerate() {
        if cadence.is_due(i) {
            if cancel.is_cancelled() {
                log::info!("path check cancelled after {} of {} images", i, total);
                return PathBase::Cancelled;
            }
            progress.report(ProgressUpdate::new(
                percent(i, total),
                format!("Checking recognition paths {}/{}...", i, total),
                true,
            ));
            cadence.pause();
        }

        let recorded = image.normalized_file();
        if !prefix.is_empty() && recorded.starts_with(&prefix_with_separator) {
            return PathBase::RootRelative;
        }
        if file_exists(&root.join(&recorded)) {
            return PathBase::RootRelative;
        }
        if !prefix.is_empty() && file_exists(&root.join(&prefix).join(&recorded)) {
            return PathBase::SubFolderRelative;
        }
    }
    PathBase::NoMatch
}

fn file_exists(path: &Path) -> bool {
    match path.try_exists() {
        Ok(found) => found,
        Err(e) => {
            log::debug!("cannot inspect {}: {}", path.display(), e);
            false
        }
    }
}

/// Prepend `prefix` to every recorded path in the document.
pub fn apply_prefix_to_all_paths(
    document: &mut RecognitionDocument,
    prefix: &str,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
    cadence: Cadence,
) -> CancelStatus {
    let prefix = normalize_prefix(prefix);
    if prefix.is_empty() {
        return CancelStatus::Completed;
    }
    let total = document.images.len();
    for (i, image) in document.images.iter_mut().enumerate() {
        if cadence.is_due(i) {
            if cancel.is_cancelled() {
                log::info!("path rewrite cancelled after {} of {} images", i, total);
                return CancelStatus::Cancelled;
            }
            progress.report(ProgressUpdate::new(
                percent(i, total),
                format!("Updating recognition paths {}/{}...", i, total),
                true,
            ));
            cadence.pause();
        }
        image.file = format!("{}/{}", prefix, image.normalized_file());
    }
    CancelStatus::Completed
}

/// Folder of the recognition file relative to the dataset root, with `/`
/// separators. Empty when the file sits in the root itself or outside it.
pub fn subfolder_prefix(root: &Path, recognition_file: &Path) -> String {
    let Some(folder) = recognition_file.parent() else {
        return String::new();
    };
    let Ok(relative) = folder.strip_prefix(root) else {
        return String::new();
    };
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// How the document's folders line up with the catalog's.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FolderComparison {
    pub in_both: BTreeSet<String>,
    pub only_in_catalog: BTreeSet<String>,
    pub only_in_document: BTreeSet<String>,
}

impl FolderComparison {
    pub fn has_common_folder(&self) -> bool {
        !self.in_both.is_empty()
    }
}

pub fn compare_folders(index: &FileIndex, document: &RecognitionDocument) -> FolderComparison {
    let catalog = index.folder_names();
    let mut recorded: BTreeMap<String, String> = BTreeMap::new();
    for image in &document.images {
        let folder = split_recorded_path(&image.file).0;
        recorded.entry(folder.to_lowercase()).or_insert(folder);
    }
    let mut out = FolderComparison::default();
    for (key, name) in catalog {
        if recorded.contains_key(key) {
            out.in_both.insert(name.clone());
        } else {
            out.only_in_catalog.insert(name.clone());
        }
    }
    for (key, name) in recorded {
        if !catalog.contains_key(&key) {
            out.only_in_document.insert(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ImageEntry;
    use crate::progress::NoProgress;
    use crate::storage::FileRecord;
    use std::time::Duration;

    fn doc(paths: &[&str]) -> RecognitionDocument {
        RecognitionDocument {
            images: paths
                .iter()
                .map(|p| ImageEntry {
                    file: p.to_string(),
                    detections: Some(Vec::new()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn quick(every: usize) -> Cadence {
        Cadence::new(every).with_backoff(Duration::ZERO)
    }

    #[test]
    fn split_handles_both_separators() {
        assert_eq!(
            split_recorded_path("a\\b/c.jpg"),
            ("a/b".to_string(), "c.jpg".to_string())
        );
        assert_eq!(
            split_recorded_path("c.jpg"),
            (String::new(), "c.jpg".to_string())
        );
    }

    #[test]
    fn prefix_match_short_circuits_without_touching_disk() {
        let document = doc(&["cam1/x.jpg"]);
        let base = detect_likely_path_base(
            &document,
            Path::new("/nonexistent-root"),
            "cam1",
            &NoProgress,
            &CancelToken::new(),
            quick(10),
        );
        assert_eq!(base, PathBase::RootRelative);
    }

    #[test]
    fn no_evidence_means_no_match() {
        let document = doc(&["a.jpg", "b/c.jpg"]);
        let base = detect_likely_path_base(
            &document,
            Path::new("/nonexistent-root"),
            "sub",
            &NoProgress,
            &CancelToken::new(),
            quick(10),
        );
        assert_eq!(base, PathBase::NoMatch);
    }

    #[test]
    fn cancellation_is_seen_at_the_first_checkpoint() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let document = doc(&["cam1/x.jpg"]);
        let base = detect_likely_path_base(
            &document,
            Path::new("/"),
            "cam1",
            &NoProgress,
            &cancel,
            quick(10),
        );
        assert_eq!(base, PathBase::Cancelled);
    }

    #[test]
    fn prefix_rewrite_prepends_and_normalizes() {
        let mut document = doc(&["a\\b.jpg", "c.jpg"]);
        let status = apply_prefix_to_all_paths(
            &mut document,
            "site1\\",
            &NoProgress,
            &CancelToken::new(),
            quick(30_000),
        );
        assert_eq!(status, CancelStatus::Completed);
        let files: Vec<&str> = document.images.iter().map(|i| i.file.as_str()).collect();
        assert_eq!(files, vec!["site1/a/b.jpg", "site1/c.jpg"]);
    }

    #[test]
    fn cancelled_rewrite_leaves_paths_alone() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut document = doc(&["a.jpg"]);
        let status =
            apply_prefix_to_all_paths(&mut document, "site1", &NoProgress, &cancel, quick(1));
        assert_eq!(status, CancelStatus::Cancelled);
        assert_eq!(document.images[0].file, "a.jpg");
    }

    #[test]
    fn subfolder_prefix_is_relative_to_root() {
        let root = Path::new("/data/survey");
        assert_eq!(
            subfolder_prefix(root, Path::new("/data/survey/site1/cam2/md.json")),
            "site1/cam2"
        );
        assert_eq!(subfolder_prefix(root, Path::new("/data/survey/md.json")), "");
        assert_eq!(subfolder_prefix(root, Path::new("/elsewhere/md.json")), "");
    }

    #[test]
    fn folder_comparison_partitions_folders() {
        let index = FileIndex::from_records(&[
            FileRecord::new(1, "a", "1.jpg"),
            FileRecord::new(2, "b", "2.jpg"),
        ]);
        let comparison = compare_folders(&index, &doc(&["a/1.jpg", "c/3.jpg"]));
        assert!(comparison.has_common_folder());
        assert_eq!(comparison.in_both.len(), 1);
        assert!(comparison.only_in_catalog.contains("b"));
        assert!(comparison.only_in_document.contains("c"));
    }

    #[test]
    fn folder_comparison_ignores_case() {
        let index = FileIndex::from_records(&[
            FileRecord::new(1, "Site1", "IMG_0001.JPG"),
            FileRecord::new(2, "Site2", "IMG_0002.JPG"),
        ]);
        let comparison = compare_folders(&index, &doc(&["site1/IMG_0001.jpg", "Other/x.jpg"]));
        assert_eq!(comparison.in_both.iter().collect::<Vec<_>>(), vec!["Site1"]);
        assert_eq!(comparison.only_in_catalog.iter().collect::<Vec<_>>(), vec!["Site2"]);
        assert_eq!(comparison.only_in_document.iter().collect::<Vec<_>>(), vec!["Other"]);
    }
}
