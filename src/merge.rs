//! Reconciling run metadata and category dictionaries across recognition runs.
//!
//! When a second detector run is imported into a store that already holds
//! recognitions, the stored run info and the incoming one are combined rather
//! than overwritten: identity fields come from whichever side ran the newer
//! detector, and each threshold takes the lower of the two values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::document::{DocumentInfo, RunInfo};
use crate::DETECTOR_VERSION_UNKNOWN;

/// Run info as stored or parsed, before defaults are applied. `None` means
/// the field was absent on that side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredRunInfo {
    pub id: Option<i64>,
    pub detector: Option<String>,
    pub detector_version: Option<String>,
    pub detection_completed_at: Option<String>,
    pub classifier: Option<String>,
    pub classification_completed_at: Option<String>,
    pub typical_detection_threshold: Option<f64>,
    pub conservative_detection_threshold: Option<f64>,
    pub typical_classification_threshold: Option<f64>,
}

impl StoredRunInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Normalize a parsed document header. Missing classifier fields become
    /// empty strings (no classifier was run); everything else takes its sentinel.
    pub fn from_document_info(info: &DocumentInfo) -> Self {
        let resolved = info.run_info();
        Self {
            id: None,
            classifier: Some(info.classifier.clone().unwrap_or_default()),
            classification_completed_at: Some(
                info.classification_completion_time
                    .clone()
                    .unwrap_or_default(),
            ),
            ..Self::from(resolved)
        }
    }

    pub fn resolve(&self) -> RunInfo {
        let defaults = RunInfo::default();
        RunInfo {
            detector: self.detector.clone().unwrap_or(defaults.detector),
            detector_version: self
                .detector_version
                .clone()
                .unwrap_or(defaults.detector_version),
            detection_completed_at: self
                .detection_completed_at
                .clone()
                .unwrap_or(defaults.detection_completed_at),
            classifier: self.classifier.clone().unwrap_or(defaults.classifier),
            classification_completed_at: self
                .classification_completed_at
                .clone()
                .unwrap_or(defaults.classification_completed_at),
            typical_detection_threshold: self
                .typical_detection_threshold
                .unwrap_or(defaults.typical_detection_threshold),
            conservative_detection_threshold: self
                .conservative_detection_threshold
                .unwrap_or(defaults.conservative_detection_threshold),
            typical_classification_threshold: self
                .typical_classification_threshold
                .unwrap_or(defaults.typical_classification_threshold),
        }
    }
}

impl From<RunInfo> for StoredRunInfo {
    fn from(info: RunInfo) -> Self {
        Self {
            id: None,
            detector: Some(info.detector),
            detector_version: Some(info.detector_version),
            detection_completed_at: Some(info.detection_completed_at),
            classifier: Some(info.classifier),
            classification_completed_at: Some(info.classification_completed_at),
            typical_detection_threshold: Some(info.typical_detection_threshold),
            conservative_detection_threshold: Some(info.conservative_detection_threshold),
            typical_classification_threshold: Some(info.typical_classification_threshold),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionComparison {
    /// Byte-wise string order. `"v10"` sorts before `"v9"`.
    #[default]
    Ordinal,
    /// Digit runs compare numerically, so `"v9"` sorts before `"v10"`.
    Natural,
}

impl VersionComparison {
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            VersionComparison::Ordinal => a.cmp(b),
            VersionComparison::Natural => natural_cmp(a, b),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ordinal" => Some(VersionComparison::Ordinal),
            "natural" => Some(VersionComparison::Natural),
            _ => None,
        }
    }
}

// Equal versions favour the incoming side; an unknown or blank version loses.
pub fn incoming_version_preferred(
    existing: &str,
    incoming: &str,
    comparison: VersionComparison,
) -> bool {
    if existing == incoming || is_unknown_version(existing) {
        return true;
    }
    if is_unknown_version(incoming) {
        return false;
    }
    comparison.compare(existing, incoming) == Ordering::Less
}

fn is_unknown_version(version: &str) -> bool {
    version.trim().is_empty() || version == DETECTOR_VERSION_UNKNOWN
}

/// Identity fields come from the preferred side, thresholds are the minimum of
/// both sides and the row id always comes from `existing`. An empty `existing`
/// yields `incoming` unchanged.
pub fn merge_run_info(
    existing: &StoredRunInfo,
    incoming: &StoredRunInfo,
    comparison: VersionComparison,
) -> StoredRunInfo {
    if existing.is_empty() {
        return incoming.clone();
    }
    let old = existing.resolve();
    let new = incoming.resolve();
    let preferred = if incoming_version_preferred(
        &old.detector_version,
        &new.detector_version,
        comparison,
    ) {
        &new
    } else {
        &old
    };
    log::debug!(
        "run info merge: existing {} vs incoming {}, keeping {}",
        old.detector_version,
        new.detector_version,
        preferred.detector_version
    );

    StoredRunInfo {
        id: existing.id,
        detector: Some(preferred.detector.clone()),
        detector_version: Some(preferred.detector_version.clone()),
        detection_completed_at: Some(preferred.detection_completed_at.clone()),
        classifier: Some(preferred.classifier.clone()),
        classification_completed_at: Some(preferred.classification_completed_at.clone()),
        typical_detection_threshold: Some(
            old.typical_detection_threshold
                .min(new.typical_detection_threshold),
        ),
        conservative_detection_threshold: Some(
            old.conservative_detection_threshold
                .min(new.conservative_detection_threshold),
        ),
        typical_classification_threshold: Some(
            old.typical_classification_threshold
                .min(new.typical_classification_threshold),
        ),
    }
}

pub fn merge_with_document_info(
    existing: &StoredRunInfo,
    incoming: &DocumentInfo,
    comparison: VersionComparison,
) -> StoredRunInfo {
    merge_run_info(
        existing,
        &StoredRunInfo::from_document_info(incoming),
        comparison,
    )
}

/// Union of two category dictionaries, or `None` when a shared id carries
/// different labels.
pub fn merge_categories(
    existing: &BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = existing.clone();
    for (id, label) in incoming {
        match merged.get(id) {
            Some(current) if current != label => {
                log::warn!(
                    "category {} is '{}' in the store but '{}' in the import",
                    id,
                    current,
                    label
                );
                return None;
            }
            Some(_) => {}
            None => {
                merged.insert(id.clone(), label.clone());
            }
        }
    }
    Some(merged)
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.as_bytes();
    let mut right = b.as_bytes();
    loop {
        match (left.first(), right.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (ld, lrest) = split_digits(left);
                let (rd, rrest) = split_digits(right);
                let ord = compare_digit_runs(ld, rd);
                if ord != Ordering::Equal {
                    return ord;
                }
                left = lrest;
                right = rrest;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                left = &left[1..];
                right = &right[1..];
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|c| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let a = trim_leading_zeros(a);
    let b = trim_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|c| *c != b'0').unwrap_or(s.len());
    &s[start..]
}
