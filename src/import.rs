//! End-to-end import of a recognition document into a file database.
//!
//! A fresh import replaces every stored recognition. A merging import keeps
//! recognitions for files the document does not mention, reconciles run info
//! and category dictionaries with what is stored, and replaces recognitions
//! only for the files the document covers.

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

use crate::document::{RecognitionDocument, RunInfo};
use crate::ingest::{populate_tables, IdOffsets, IngestSummary};
use crate::merge::{merge_categories, merge_with_document_info, StoredRunInfo, VersionComparison};
use crate::paths::{compare_folders, FolderComparison};
use crate::progress::{percent, Cadence, CancelToken, ProgressSink, ProgressUpdate};
use crate::schema::{
    detections_exist, prepare_tables, recognition_tables_exist, table_exists,
    CLASSIFICATIONS_TABLE, CLASSIFICATION_CATEGORIES_TABLE, DETECTIONS_TABLE,
    DETECTION_CATEGORIES_TABLE, INFO_TABLE,
};
use crate::selection::ThresholdContext;
use crate::storage::{FileCatalog, FileIndex};
use crate::NO_DETECTION_CATEGORY;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportOptions {
    /// Merge with stored recognitions instead of replacing them.
    pub merge: bool,
    pub version_comparison: VersionComparison,
    pub ingest_cadence: Cadence,
    pub merge_cadence: Cadence,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            merge: true,
            version_comparison: VersionComparison::Ordinal,
            ingest_cadence: Cadence::INGEST,
            merge_cadence: Cadence::MERGE_SCAN,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportReport {
    /// Whether stored recognitions were kept and merged with.
    pub merged: bool,
    /// Run info as written.
    pub run_info: RunInfo,
    pub folders: FolderComparison,
    /// Files whose earlier recognitions were replaced.
    pub files_replaced: usize,
    pub ingest: IngestSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImportOutcome {
    Imported(ImportReport),
    Cancelled,
    /// No folder in the document exists in the catalog; nothing was written.
    NoMatchingFolders(FolderComparison),
    IncompatibleDetectionCategories,
    IncompatibleClassificationCategories,
}

/// Run info and category dictionaries as currently stored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredRecognitions {
    pub info: StoredRunInfo,
    pub detection_categories: BTreeMap<String, String>,
    pub classification_categories: BTreeMap<String, String>,
    pub classification_descriptions: BTreeMap<String, String>,
}

/// Import `document` into the recognition tables of `conn`.
///
/// The document is updated in place with defaults and, when merging, with the
/// merged run info and categories. All writes happen in one transaction when
/// `conn` is in autocommit mode, so a cancelled merge leaves the store as it was.
/// Cancellation is observed before ingestion starts, not during it.
pub fn import_document(
    conn: &Connection,
    document: &mut RecognitionDocument,
    catalog: &dyn FileCatalog,
    options: &ImportOptions,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<ImportOutcome> {
    progress.report(ProgressUpdate::indeterminate(
        "Examining database recognitions...",
        true,
    ));
    options.merge_cadence.pause();
    document.info.fill_defaults();

    let index = FileIndex::build(catalog)?;
    let folders = compare_folders(&index, document);
    if !folders.has_common_folder() {
        log::warn!(
            "none of the {} recognition folders exist in the catalog",
            folders.only_in_document.len()
        );
        return Ok(ImportOutcome::NoMatchingFolders(folders));
    }
    if cancel.is_cancelled() {
        return Ok(ImportOutcome::Cancelled);
    }

    let tables_exist = recognition_tables_exist(conn)?;
    let merging = options.merge && detections_exist(conn)?;
    let tx = if conn.is_autocommit() {
        Some(conn.unchecked_transaction()?)
    } else {
        None
    };

    let mut offsets = IdOffsets::default();
    let mut files_replaced = 0;
    if merging {
        let stored = read_stored_recognitions(conn)?;
        let merged_info =
            merge_with_document_info(&stored.info, &document.info, options.version_comparison);
        if cancel.is_cancelled() {
            return Ok(ImportOutcome::Cancelled);
        }

        // The stored "0" row is synthesized at ingestion, never part of a document.
        let mut stored_detection = stored.detection_categories;
        stored_detection.remove(NO_DETECTION_CATEGORY);
        let Some(detection_categories) =
            merge_categories(&stored_detection, &document.detection_categories)
        else {
            return Ok(ImportOutcome::IncompatibleDetectionCategories);
        };
        let Some(classification_categories) = merge_categories(
            &stored.classification_categories,
            &document.classification_categories,
        ) else {
            return Ok(ImportOutcome::IncompatibleClassificationCategories);
        };

        // The document is only touched once the merge is known to succeed, so a
        // caller can retry it as a replacing import.
        document.info.apply(&merged_info.resolve());
        document.detection_categories = detection_categories;
        document.classification_categories = classification_categories;
        for (category, description) in stored.classification_descriptions {
            document
                .classification_category_descriptions
                .entry(category)
                .or_insert(description);
        }

        offsets = next_ids(conn)?;
        match remove_covered_recognitions(
            conn,
            document,
            &index,
            progress,
            cancel,
            options.merge_cadence,
        )? {
            Some(n) => files_replaced = n,
            None => return Ok(ImportOutcome::Cancelled),
        }
    }

    prepare_tables(conn, tables_exist, !merging)?;
    progress.report(ProgressUpdate::indeterminate("Adding new recognitions...", false));
    let ingest = populate_tables(
        conn,
        document,
        catalog,
        &index,
        "",
        offsets,
        progress,
        options.ingest_cadence,
    )?;
    if let Some(tx) = tx {
        tx.commit().context("failed to commit import")?;
    }

    Ok(ImportOutcome::Imported(ImportReport {
        merged: merging,
        run_info: document.info.run_info(),
        folders,
        files_replaced,
        ingest,
    }))
}

/// Delete stored recognitions for every catalog file the document mentions.
/// Returns the number of files affected, or `None` when cancelled.
fn remove_covered_recognitions(
    conn: &Connection,
    document: &RecognitionDocument,
    index: &FileIndex,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
    cadence: Cadence,
) -> Result<Option<usize>> {
    let mut classifications = conn.prepare(
        "DELETE FROM Classifications WHERE detectionID IN (SELECT detectionID FROM Detections WHERE Id = ?1)",
    )?;
    let mut detections = conn.prepare("DELETE FROM Detections WHERE Id = ?1")?;
    let total = document.images.len();
    let mut replaced = 0;
    for (i, image) in document.images.iter().enumerate() {
        if cadence.is_due(i) {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            progress.report(ProgressUpdate::new(
                percent(i, total),
                format!("Comparing recognitions ({}/{})...", i, total),
                true,
            ));
            cadence.pause();
        }
        for &file_id in index.lookup(&image.file) {
            classifications.execute(params![file_id])?;
            if detections.execute(params![file_id])? > 0 {
                replaced += 1;
            }
        }
    }
    log::info!("replacing recognitions for {} files", replaced);
    Ok(Some(replaced))
}

/// Read the stored run info and category dictionaries. Missing tables read as
/// empty; malformed numeric values read as absent.
pub fn read_stored_recognitions(conn: &Connection) -> Result<StoredRecognitions> {
    let mut out = StoredRecognitions::default();
    if table_exists(conn, INFO_TABLE)? {
        out.info = read_info_row(conn)?;
    }
    if table_exists(conn, DETECTION_CATEGORIES_TABLE)? {
        let mut stmt = conn.prepare("SELECT category, label FROM DetectionCategories")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (category, label) = row?;
            out.detection_categories
                .insert(category, label.unwrap_or_default());
        }
    }
    if table_exists(conn, CLASSIFICATION_CATEGORIES_TABLE)? {
        let mut stmt = conn
            .prepare("SELECT classification, label, description FROM ClassificationCategories")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (category, label, description) = row?;
            if let Some(description) = description.filter(|d| !d.is_empty()) {
                out.classification_descriptions
                    .insert(category.clone(), description);
            }
            out.classification_categories
                .insert(category, label.unwrap_or_default());
        }
    }
    Ok(out)
}

fn read_info_row(conn: &Connection) -> Result<StoredRunInfo> {
    let row = conn
        .query_row(
            r#"
            SELECT infoID, detector, megadetector_version, detection_completion_time,
                   classifier, classification_completion_time, typical_detection_threshold,
                   conservative_detection_threshold, typical_classification_threshold
            FROM Info ORDER BY infoID LIMIT 1
            "#,
            [],
            |row| {
                let mut values = Vec::with_capacity(9);
                for i in 0..9 {
                    values.push(row.get::<_, Value>(i)?);
                }
                Ok(values)
            },
        )
        .optional()
        .context("failed to read run info")?;
    let Some(values) = row else {
        return Ok(StoredRunInfo::default());
    };
    Ok(StoredRunInfo {
        id: match &values[0] {
            Value::Integer(id) => Some(*id),
            _ => None,
        },
        detector: text_value(&values[1]),
        detector_version: text_value(&values[2]),
        detection_completed_at: text_value(&values[3]),
        classifier: text_value(&values[4]),
        classification_completed_at: text_value(&values[5]),
        typical_detection_threshold: real_value("typical_detection_threshold", &values[6]),
        conservative_detection_threshold: real_value(
            "conservative_detection_threshold",
            &values[7],
        ),
        typical_classification_threshold: real_value(
            "typical_classification_threshold",
            &values[8],
        ),
    })
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(n) => Some(n.to_string()),
        Value::Real(n) => Some(n.to_string()),
        _ => None,
    }
}

fn real_value(column: &str, value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Null => return None,
        Value::Real(n) => Some(*n),
        Value::Integer(n) => Some(*n as f64),
        Value::Text(s) => s.trim().parse::<f64>().ok(),
        Value::Blob(_) => None,
    };
    let parsed = parsed.filter(|n| n.is_finite());
    if parsed.is_none() {
        log::warn!("stored {} is malformed; using the default", column);
    }
    parsed
}

/// The store's thresholds, with defaults for anything missing or malformed.
pub fn stored_thresholds(conn: &Connection) -> Result<ThresholdContext> {
    let stored = read_stored_recognitions(conn)?;
    Ok(ThresholdContext::from(&stored.info.resolve()))
}

/// Offsets one past the highest stored detection and classification ids.
pub fn next_ids(conn: &Connection) -> Result<IdOffsets> {
    Ok(IdOffsets {
        detection: max_id(conn, DETECTIONS_TABLE, "detectionID")? + 1,
        classification: max_id(conn, CLASSIFICATIONS_TABLE, "classificationID")? + 1,
    })
}

fn max_id(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    if !table_exists(conn, table)? {
        return Ok(0);
    }
    let max: Option<i64> = conn.query_row(
        &format!("SELECT MAX({}) FROM {}", column, table),
        [],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::create_tables;

    fn store() -> Connection {
        let conn = crate::open_db_connection(":memory:").expect("open");
        conn.execute_batch(
            "CREATE TABLE DataTable (Id INTEGER PRIMARY KEY, File TEXT, RelativePath TEXT);",
        )
        .expect("catalog");
        conn
    }

    #[test]
    fn missing_tables_read_as_empty() {
        let conn = store();
        let stored = read_stored_recognitions(&conn).expect("read");
        assert!(stored.info.is_empty());
        assert_eq!(next_ids(&conn).expect("ids"), IdOffsets::default());
        assert_eq!(stored_thresholds(&conn).expect("thresholds"), ThresholdContext::default());
    }

    #[test]
    fn malformed_thresholds_fall_back_to_defaults() {
        let conn = store();
        create_tables(&conn).expect("tables");
        conn.execute_batch(
            r#"
            INSERT INTO Info (infoID, detector, megadetector_version, typical_detection_threshold,
                              conservative_detection_threshold, typical_classification_threshold)
            VALUES (1, 'md', 'v5a.0.0', 'not a number', '0.05', 0.6);
            INSERT INTO ClassificationCategories VALUES ('10', 'deer', 'Odocoileus');
            "#,
        )
        .expect("seed");
        let stored = read_stored_recognitions(&conn).expect("read");
        assert_eq!(stored.info.id, Some(1));
        assert_eq!(stored.info.typical_detection_threshold, None);
        assert_eq!(stored.info.conservative_detection_threshold, Some(0.05));
        assert_eq!(stored.classification_descriptions["10"], "Odocoileus");

        let context = stored_thresholds(&conn).expect("thresholds");
        assert_eq!(context.typical_detection, crate::DEFAULT_TYPICAL_DETECTION_THRESHOLD);
        assert_eq!(context.typical_classification, 0.6);
    }

    #[test]
    fn next_ids_follow_stored_maxima() {
        let conn = store();
        create_tables(&conn).expect("tables");
        conn.execute_batch(
            r#"
            INSERT INTO DataTable VALUES (1, 'a.jpg', '');
            INSERT INTO Detections (detectionID, category, conf, bbox, Id) VALUES (7, '1', 0.9, '', 1);
            INSERT INTO Classifications VALUES (12, '10', 0.5, 7);
            "#,
        )
        .expect("seed");
        assert_eq!(
            next_ids(&conn).expect("ids"),
            IdOffsets {
                detection: 8,
                classification: 13
            }
        );
    }
}
