//! In-memory model of a detector/classifier output document.
//!
//! Field names follow the MegaDetector batch-output JSON so the document can be
//! deserialized directly. Numeric fields are read leniently: a number or a
//! numeric string is accepted, anything else falls back to the field default.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::paths::normalize_separators;
use crate::progress::{percent, CancelToken, ProgressSink, ProgressUpdate};
use crate::{
    CLASSIFICATION_TIME_UNKNOWN, DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD,
    DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD, DEFAULT_TYPICAL_DETECTION_THRESHOLD,
    DETECTION_TIME_UNKNOWN, DETECTOR_UNKNOWN, DETECTOR_VERSION_UNKNOWN,
};

/// Separator between the four serialized bounding-box numbers.
pub const BBOX_SEPARATOR: &str = ", ";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: DocumentInfo,
    #[serde(default, deserialize_with = "null_as_default")]
    pub detection_categories: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub classification_categories: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub classification_category_descriptions: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<ImageEntry>,
}

/// The `info` header exactly as recorded; every field may be absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    #[serde(default)]
    pub detector: Option<String>,
    #[serde(default)]
    pub detection_completion_time: Option<String>,
    #[serde(default)]
    pub classifier: Option<String>,
    #[serde(default)]
    pub classification_completion_time: Option<String>,
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub detector_metadata: Option<DetectorMetadata>,
    #[serde(default)]
    pub classifier_metadata: Option<ClassifierMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorMetadata {
    #[serde(default)]
    pub megadetector_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub typical_detection_threshold: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub conservative_detection_threshold: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierMetadata {
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub typical_classification_threshold: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub file: String,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub frame_rate: Option<f64>,
    /// `None` when the detector failed on this file.
    #[serde(default)]
    pub detections: Option<Vec<DetectionEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub category: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub conf: f64,
    #[serde(default, deserialize_with = "lenient_bbox")]
    pub bbox: Option<Vec<f64>>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub frame_number: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub classifications: Vec<ClassificationEntry>,
}

/// A `[category, confidence]` pair attached to a detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, Value)", into = "(String, f64)")]
pub struct ClassificationEntry {
    pub category: String,
    pub confidence: f64,
}

impl From<(String, Value)> for ClassificationEntry {
    fn from((category, raw): (String, Value)) -> Self {
        let confidence = lenient_number(&raw).unwrap_or_else(|| {
            log::warn!(
                "classification {} has a malformed confidence ({}); treating as 0",
                category,
                raw
            );
            0.0
        });
        Self {
            category,
            confidence,
        }
    }
}

impl From<ClassificationEntry> for (String, f64) {
    fn from(entry: ClassificationEntry) -> Self {
        (entry.category, entry.confidence)
    }
}

/// Resolved run metadata: every field carries a value, never "unset".
#[derive(Clone, Debug, PartialEq)]
pub struct RunInfo {
    pub detector: String,
    pub detector_version: String,
    pub detection_completed_at: String,
    pub classifier: String,
    pub classification_completed_at: String,
    pub typical_detection_threshold: f64,
    pub conservative_detection_threshold: f64,
    pub typical_classification_threshold: f64,
}

impl Default for RunInfo {
    fn default() -> Self {
        Self {
            detector: DETECTOR_UNKNOWN.to_string(),
            detector_version: DETECTOR_VERSION_UNKNOWN.to_string(),
            detection_completed_at: DETECTION_TIME_UNKNOWN.to_string(),
            classifier: crate::CLASSIFIER_UNKNOWN.to_string(),
            classification_completed_at: CLASSIFICATION_TIME_UNKNOWN.to_string(),
            typical_detection_threshold: DEFAULT_TYPICAL_DETECTION_THRESHOLD,
            conservative_detection_threshold: DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD,
            typical_classification_threshold: DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD,
        }
    }
}

impl DocumentInfo {
    /// Replace missing or blank header values with their sentinels so later
    /// stages can rely on them. Classifier fields are left alone: their absence
    /// means no classifier was run.
    pub fn fill_defaults(&mut self) {
        if self.detector.as_deref().map_or(true, is_blank) {
            self.detector = Some(DETECTOR_UNKNOWN.to_string());
        }
        let detector = self.detector_metadata.get_or_insert_with(Default::default);
        if detector.megadetector_version.as_deref().map_or(true, is_blank) {
            detector.megadetector_version = Some(DETECTOR_VERSION_UNKNOWN.to_string());
        }
        detector
            .typical_detection_threshold
            .get_or_insert(DEFAULT_TYPICAL_DETECTION_THRESHOLD);
        detector
            .conservative_detection_threshold
            .get_or_insert(DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD);
        self.classifier_metadata
            .get_or_insert_with(Default::default)
            .typical_classification_threshold
            .get_or_insert(DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD);
    }

    /// Resolve the header into a complete `RunInfo`.
    pub fn run_info(&self) -> RunInfo {
        let detector = self.detector_metadata.clone().unwrap_or_default();
        let classifier = self.classifier_metadata.clone().unwrap_or_default();
        RunInfo {
            detector: non_blank_or(self.detector.as_deref(), DETECTOR_UNKNOWN),
            detector_version: non_blank_or(
                detector.megadetector_version.as_deref(),
                DETECTOR_VERSION_UNKNOWN,
            ),
            detection_completed_at: non_blank_or(
                self.detection_completion_time.as_deref(),
                DETECTION_TIME_UNKNOWN,
            ),
            classifier: self.classifier.clone().unwrap_or_default(),
            classification_completed_at: self
                .classification_completion_time
                .clone()
                .unwrap_or_default(),
            typical_detection_threshold: detector
                .typical_detection_threshold
                .unwrap_or(DEFAULT_TYPICAL_DETECTION_THRESHOLD),
            conservative_detection_threshold: detector
                .conservative_detection_threshold
                .unwrap_or(DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD),
            typical_classification_threshold: classifier
                .typical_classification_threshold
                .unwrap_or(DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD),
        }
    }

    /// Overwrite the header with a resolved `RunInfo`, e.g. after a merge.
    pub fn apply(&mut self, info: &RunInfo) {
        self.detector = Some(info.detector.clone());
        self.detection_completion_time = Some(info.detection_completed_at.clone());
        self.classifier = Some(info.classifier.clone());
        self.classification_completion_time = Some(info.classification_completed_at.clone());
        self.detector_metadata = Some(DetectorMetadata {
            megadetector_version: Some(info.detector_version.clone()),
            typical_detection_threshold: Some(info.typical_detection_threshold),
            conservative_detection_threshold: Some(info.conservative_detection_threshold),
        });
        self.classifier_metadata = Some(ClassifierMetadata {
            typical_classification_threshold: Some(info.typical_classification_threshold),
        });
    }
}

impl RecognitionDocument {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid recognition document: {}", e))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader).map_err(|e| anyhow!("invalid recognition document: {}", e))
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl ImageEntry {
    /// Still images carry no frame information; everything else is treated as video.
    pub fn is_jpeg(&self) -> bool {
        let lower = self.file.to_ascii_lowercase();
        lower.ends_with(".jpg") || lower.ends_with(".jpeg")
    }

    /// Recorded path with `/` as the only separator.
    pub fn normalized_file(&self) -> String {
        normalize_separators(&self.file)
    }
}

impl DetectionEntry {
    /// Bounding box as four decimal numbers, or empty when absent or malformed.
    /// `f64`'s `Display` is locale-independent, so the decimal separator is always `.`.
    pub fn bbox_text(&self) -> String {
        match self.bbox.as_deref() {
            Some([x, y, w, h]) => [x, y, w, h]
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(BBOX_SEPARATOR),
            _ => String::new(),
        }
    }
}

/// Read a recognition document from disk, reporting read progress.
///
/// Returns `Ok(None)` when `cancel` fires while the file is being read.
pub fn load_document(
    path: &Path,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Option<RecognitionDocument>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open recognition file {}", path.display()))?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);
    progress.report(ProgressUpdate::new(0, "Reading recognition file...", true));

    let reader = BufReader::new(ProgressReader {
        inner: file,
        total,
        read: 0,
        last_percent: 0,
        progress,
        cancel,
    });
    match serde_json::from_reader::<_, RecognitionDocument>(reader) {
        Ok(document) => {
            log::info!(
                "read {} image entries from {}",
                document.images.len(),
                path.display()
            );
            Ok(Some(document))
        }
        Err(_) if cancel.is_cancelled() => {
            log::info!("reading {} cancelled", path.display());
            Ok(None)
        }
        Err(e) => Err(anyhow!(
            "invalid recognition file {}: {}",
            path.display(),
            e
        )),
    }
}

struct ProgressReader<'a, R> {
    inner: R,
    total: u64,
    read: u64,
    last_percent: u8,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            // Not `Interrupted`: readers retry on that kind.
            return Err(io::Error::new(io::ErrorKind::Other, "read cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        let pct = percent(self.read as usize, self.total.max(1) as usize);
        if pct > self.last_percent {
            self.last_percent = pct;
            self.progress.report(ProgressUpdate::new(
                pct,
                format!("Reading recognition file ({}%)...", pct),
                true,
            ));
        }
        Ok(n)
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn non_blank_or(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(v) if !is_blank(v) => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// Parse a JSON number or numeric string; non-finite values are rejected.
pub(crate) fn lenient_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(lenient_number))
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?.unwrap_or(0.0))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or(0))
}

fn lenient_bbox<'de, D>(deserializer: D) -> Result<Option<Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => Ok(values.iter().map(lenient_number).collect()),
        _ => Ok(None),
    }
}
