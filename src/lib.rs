//! Camera-trap recognition ingestion.
//!
//! Imports detector/classifier output (MegaDetector batch JSON) into a
//! SQLite file database whose file catalog already lists every image and
//! video, merges run metadata with recognitions already stored there, and
//! turns confidence sliders into range bounds for selection queries.

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};

pub mod config;
pub mod document;
pub mod import;
pub mod ingest;
pub mod merge;
pub mod paths;
pub mod progress;
pub mod schema;
pub mod selection;
pub mod storage;

pub use config::ImportConfig;
pub use document::{load_document, DocumentInfo, RecognitionDocument, RunInfo};
pub use import::{import_document, ImportOptions, ImportOutcome, ImportReport};
pub use ingest::{populate_tables, IdOffsets, IngestSummary};
pub use merge::{merge_categories, merge_run_info, StoredRunInfo, VersionComparison};
pub use paths::{apply_prefix_to_all_paths, detect_likely_path_base, PathBase};
pub use progress::{
    Cadence, CancelStatus, CancelToken, NoProgress, ProgressSink, ProgressUpdate,
};
pub use selection::{
    compute_bounds, ConfidenceBounds, RecognitionSelection, SelectionMode, ThresholdContext,
};
pub use storage::{FileCatalog, FileIndex, FileRecord, InMemoryFileCatalog, SqliteFileCatalog};

// -------------------- Recognizer Values --------------------

/// Detections below this confidence are discarded at ingestion.
pub const MIN_DETECTION_CONFIDENCE: f64 = 0.00001;
/// Classifications below this confidence are discarded at ingestion.
pub const MIN_CLASSIFICATION_CONFIDENCE: f64 = 0.00001;
/// Confidences are stored rounded to this many decimal places.
pub const CONFIDENCE_DECIMAL_PLACES: i32 = 3;

pub const DEFAULT_TYPICAL_DETECTION_THRESHOLD: f64 = 0.8;
pub const DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD: f64 = 0.3;
pub const DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD: f64 = 0.75;

pub const DETECTOR_VERSION_UNKNOWN: &str = "vUnknown";
pub const DETECTOR_UNKNOWN: &str = "megadetector_unknown_version";
pub const CLASSIFIER_UNKNOWN: &str = "ecosystem1_unknown_version";
pub const DETECTION_TIME_UNKNOWN: &str = "unknown";
pub const CLASSIFICATION_TIME_UNKNOWN: &str = "unknown";

pub const NO_DETECTION_CATEGORY: &str = "0";
pub const NO_DETECTION_LABEL: &str = "Empty";

/// Round a confidence to `CONFIDENCE_DECIMAL_PLACES`. The floors apply to the
/// rounded value.
pub fn round_confidence(conf: f64) -> f64 {
    let scale = 10f64.powi(CONFIDENCE_DECIMAL_PLACES);
    (conf * scale).round() / scale
}

/// Open a file database. `file:` URIs are honoured; foreign keys are enabled
/// so deleting a file or detection cascades to its recognitions.
pub fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .with_context(|| format!("failed to configure {}", db_path))?;
    Ok(conn)
}
