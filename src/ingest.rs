//! Writing a recognition document into the recognition tables.
//!
//! Rows are keyed to existing file records through a prebuilt `FileIndex`.
//! Detection and classification ids are assigned sequentially from
//! caller-supplied offsets, so several runs can share one store.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Statement};

use crate::document::{DetectionEntry, ImageEntry, RecognitionDocument};
use crate::progress::{percent, Cadence, ProgressSink, ProgressUpdate};
use crate::schema::INFO_ROW_ID;
use crate::storage::{FileCatalog, FileIndex};
use crate::{
    round_confidence, MIN_CLASSIFICATION_CONFIDENCE, MIN_DETECTION_CONFIDENCE,
    NO_DETECTION_CATEGORY, NO_DETECTION_LABEL,
};

/// First ids to assign in one ingestion run. Both must exceed every id already
/// stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdOffsets {
    pub detection: i64,
    pub classification: i64,
}

impl Default for IdOffsets {
    fn default() -> Self {
        Self {
            detection: 1,
            classification: 1,
        }
    }
}

/// Counts from one ingestion run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub images_total: usize,
    /// Images resolved to at least one file record.
    pub images_matched: usize,
    pub images_unresolved: usize,
    pub images_outside_prefix: usize,
    /// Images the detector failed on (`detections` was null).
    pub images_failed: usize,
    pub detections_written: usize,
    /// No-detection rows, included in `detections_written`.
    pub empty_rows_written: usize,
    pub classifications_written: usize,
    pub next_detection_id: i64,
    pub next_classification_id: i64,
}

/// Write run info, categories, detections and classifications for `document`.
///
/// `path_prefix` is stripped from every recorded path before lookup; images
/// outside it are skipped. When the connection is not already inside a
/// transaction the whole write runs in one. Indexes are requested from the
/// catalog once all rows are in.
#[allow(clippy::too_many_arguments)]
pub fn populate_tables(
    conn: &Connection,
    document: &RecognitionDocument,
    catalog: &dyn FileCatalog,
    file_index: &FileIndex,
    path_prefix: &str,
    start: IdOffsets,
    progress: &dyn ProgressSink,
    cadence: Cadence,
) -> Result<IngestSummary> {
    if start.detection < 1 || start.classification < 1 {
        return Err(anyhow!(
            "id offsets must be positive (detection {}, classification {})",
            start.detection,
            start.classification
        ));
    }
    progress.report(ProgressUpdate::indeterminate(
        format!(
            "Adding {} new recognitions. Please wait...",
            document.images.len()
        ),
        false,
    ));
    cadence.pause();

    let tx = if conn.is_autocommit() {
        Some(conn.unchecked_transaction()?)
    } else {
        None
    };
    write_info(conn, document)?;
    write_detection_categories(conn, document)?;
    write_classification_categories(conn, document)?;
    let summary = write_recognitions(
        conn,
        document,
        file_index,
        path_prefix,
        start,
        progress,
        cadence,
    )?;
    if let Some(tx) = tx {
        tx.commit().context("failed to commit recognitions")?;
    }

    catalog.create_recognition_indexes()?;
    log::info!(
        "ingested {} of {} images: {} detections ({} empty), {} classifications",
        summary.images_matched,
        summary.images_total,
        summary.detections_written,
        summary.empty_rows_written,
        summary.classifications_written
    );
    Ok(summary)
}

fn write_info(conn: &Connection, document: &RecognitionDocument) -> Result<()> {
    let info = document.info.run_info();
    conn.execute(
        r#"
        INSERT OR REPLACE INTO Info (
          infoID, detector, megadetector_version, detection_completion_time,
          classifier, classification_completion_time, typical_detection_threshold,
          conservative_detection_threshold, typical_classification_threshold
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            INFO_ROW_ID,
            info.detector,
            info.detector_version,
            info.detection_completed_at,
            info.classifier,
            info.classification_completed_at,
            info.typical_detection_threshold,
            info.conservative_detection_threshold,
            info.typical_classification_threshold,
        ],
    )
    .context("failed to write run info")?;
    Ok(())
}

fn write_detection_categories(conn: &Connection, document: &RecognitionDocument) -> Result<()> {
    let mut stmt = conn
        .prepare("INSERT OR REPLACE INTO DetectionCategories (category, label) VALUES (?1, ?2)")?;
    if !document
        .detection_categories
        .contains_key(NO_DETECTION_CATEGORY)
    {
        stmt.execute(params![NO_DETECTION_CATEGORY, NO_DETECTION_LABEL])?;
    }
    for (category, label) in &document.detection_categories {
        stmt.execute(params![category, label])?;
    }
    Ok(())
}

fn write_classification_categories(
    conn: &Connection,
    document: &RecognitionDocument,
) -> Result<()> {
    if document.classification_categories.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO ClassificationCategories (classification, label, description) VALUES (?1, ?2, ?3)",
    )?;
    for (category, label) in &document.classification_categories {
        let description = document
            .classification_category_descriptions
            .get(category)
            .map(String::as_str)
            .unwrap_or("");
        stmt.execute(params![category, label, description])?;
    }
    Ok(())
}

struct RowWriter<'c> {
    detection: Statement<'c>,
    classification: Statement<'c>,
    next_detection_id: i64,
    next_classification_id: i64,
}

impl RowWriter<'_> {
    fn detection(
        &mut self,
        file_id: i64,
        image: &ImageEntry,
        detection: &DetectionEntry,
        conf: f64,
    ) -> Result<i64> {
        let id = self.next_detection_id;
        let (frame_number, frame_rate) = if image.is_jpeg() {
            (None, None)
        } else {
            (Some(detection.frame_number), image.frame_rate)
        };
        self.detection.execute(params![
            id,
            detection.category,
            conf,
            detection.bbox_text(),
            file_id,
            frame_number,
            frame_rate,
        ])?;
        self.next_detection_id += 1;
        Ok(id)
    }

    fn empty(&mut self, file_id: i64) -> Result<()> {
        self.detection.execute(params![
            self.next_detection_id,
            NO_DETECTION_CATEGORY,
            0.0_f64,
            "",
            file_id,
            Option::<i64>::None,
            Option::<f64>::None,
        ])?;
        self.next_detection_id += 1;
        Ok(())
    }

    fn classification(&mut self, detection_id: i64, category: &str, conf: f64) -> Result<()> {
        self.classification.execute(params![
            self.next_classification_id,
            category,
            conf,
            detection_id
        ])?;
        self.next_classification_id += 1;
        Ok(())
    }
}

fn write_recognitions(
    conn: &Connection,
    document: &RecognitionDocument,
    file_index: &FileIndex,
    path_prefix: &str,
    start: IdOffsets,
    progress: &dyn ProgressSink,
    cadence: Cadence,
) -> Result<IngestSummary> {
    let prefix = folder_prefix(path_prefix);
    let mut writer = RowWriter {
        detection: conn.prepare(
            r#"
            INSERT INTO Detections (detectionID, category, conf, bbox, Id, frame_number, frame_rate)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )?,
        classification: conn.prepare(
            "INSERT INTO Classifications (classificationID, category, conf, detectionID) VALUES (?1, ?2, ?3, ?4)",
        )?,
        next_detection_id: start.detection,
        next_classification_id: start.classification,
    };
    let total = document.images.len();
    let mut summary = IngestSummary {
        images_total: total,
        ..Default::default()
    };

    for (i, image) in document.images.iter().enumerate() {
        // Report after the first batch rather than before the first image.
        let done = i + 1;
        if cadence.is_due(done) {
            progress.report(ProgressUpdate::new(
                percent(done, total),
                format!("Adding new recognitions ({}/{})...", done, total),
                false,
            ));
            cadence.pause();
        }

        let Some(detections) = image.detections.as_ref() else {
            summary.images_failed += 1;
            continue;
        };
        let recorded = image.normalized_file();
        let relative = match prefix.as_deref() {
            None => recorded.as_str(),
            Some(p) => match recorded.strip_prefix(p) {
                Some(rest) => rest,
                None => {
                    summary.images_outside_prefix += 1;
                    continue;
                }
            },
        };
        let file_ids = file_index.lookup(relative);
        if file_ids.is_empty() {
            log::debug!("no file record for {}", image.file);
            summary.images_unresolved += 1;
            continue;
        }
        summary.images_matched += 1;

        for &file_id in file_ids {
            let mut wrote_detection = false;
            for detection in detections {
                let conf = round_confidence(detection.conf);
                if conf < MIN_DETECTION_CONFIDENCE {
                    continue;
                }
                let detection_id = writer.detection(file_id, image, detection, conf)?;
                summary.detections_written += 1;
                wrote_detection = true;
                for classification in &detection.classifications {
                    let conf = round_confidence(classification.confidence);
                    if conf < MIN_CLASSIFICATION_CONFIDENCE {
                        continue;
                    }
                    writer.classification(detection_id, &classification.category, conf)?;
                    summary.classifications_written += 1;
                }
            }
            if !wrote_detection {
                writer.empty(file_id)?;
                summary.detections_written += 1;
                summary.empty_rows_written += 1;
            }
        }
    }

    summary.next_detection_id = writer.next_detection_id;
    summary.next_classification_id = writer.next_classification_id;
    if summary.images_outside_prefix > 0 {
        log::info!(
            "skipped {} images outside {}",
            summary.images_outside_prefix,
            path_prefix
        );
    }
    if summary.images_unresolved > 0 {
        log::info!(
            "skipped {} images with no matching file record",
            summary.images_unresolved
        );
    }
    Ok(summary)
}

/// Normalized truncation prefix ending in `/`, or `None` for no truncation.
fn folder_prefix(prefix: &str) -> Option<String> {
    let trimmed = crate::paths::normalize_separators(prefix)
        .trim_matches('/')
        .to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("{}/", trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ClassificationEntry;
    use crate::progress::NoProgress;
    use crate::storage::{FileRecord, InMemoryFileCatalog};
    use std::time::Duration;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE DataTable (Id INTEGER PRIMARY KEY, File TEXT, RelativePath TEXT);
            INSERT INTO DataTable VALUES (1, 'a.jpg', 'site1'), (2, 'b.jpg', 'site1'), (3, 'v.mp4', 'site2');
            "#,
        )
        .expect("catalog");
        crate::schema::create_tables(&conn).expect("tables");
        conn
    }

    fn catalog() -> InMemoryFileCatalog {
        InMemoryFileCatalog::new(vec![
            FileRecord::new(1, "site1", "a.jpg"),
            FileRecord::new(2, "site1", "b.jpg"),
            FileRecord::new(3, "site2", "v.mp4"),
        ])
    }

    fn detection(category: &str, conf: f64) -> DetectionEntry {
        DetectionEntry {
            category: category.to_string(),
            conf,
            bbox: Some(vec![0.1, 0.2, 0.3, 0.4]),
            ..Default::default()
        }
    }

    fn image(file: &str, detections: Vec<DetectionEntry>) -> ImageEntry {
        ImageEntry {
            file: file.to_string(),
            detections: Some(detections),
            ..Default::default()
        }
    }

    fn run(conn: &Connection, document: &RecognitionDocument, prefix: &str) -> IngestSummary {
        let catalog = catalog();
        let index = FileIndex::build(&catalog).expect("index");
        let summary = populate_tables(
            conn,
            document,
            &catalog,
            &index,
            prefix,
            IdOffsets::default(),
            &NoProgress,
            Cadence::INGEST.with_backoff(Duration::ZERO),
        )
        .expect("populate");
        assert_eq!(catalog.index_requests(), 1);
        summary
    }

    fn detection_rows(conn: &Connection) -> Vec<(i64, String, f64, i64)> {
        let mut stmt = conn
            .prepare("SELECT detectionID, category, conf, Id FROM Detections ORDER BY detectionID")
            .expect("prepare");
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .expect("query");
        let out = rows.map(|r| r.expect("row")).collect();
        out
    }

    #[test]
    fn below_floor_detections_are_dropped() {
        let conn = store();
        let document = RecognitionDocument {
            images: vec![image(
                "site1/a.jpg",
                vec![detection("2", 0.9), detection("4", 0.00001)],
            )],
            ..Default::default()
        };
        let summary = run(&conn, &document, "");
        assert_eq!(detection_rows(&conn), vec![(1, "2".to_string(), 0.9, 1)]);
        assert_eq!(summary.classifications_written, 0);
        assert_eq!(summary.next_detection_id, 2);
    }

    #[test]
    fn images_without_qualifying_detections_get_one_empty_row() {
        let conn = store();
        let document = RecognitionDocument {
            images: vec![
                image("site1/a.jpg", vec![]),
                image("site1/b.jpg", vec![detection("1", 0.0)]),
            ],
            ..Default::default()
        };
        let summary = run(&conn, &document, "");
        assert_eq!(summary.empty_rows_written, 2);
        assert_eq!(
            detection_rows(&conn),
            vec![
                (1, NO_DETECTION_CATEGORY.to_string(), 0.0, 1),
                (2, NO_DETECTION_CATEGORY.to_string(), 0.0, 2)
            ]
        );
    }

    #[test]
    fn failed_and_unknown_images_are_skipped() {
        let conn = store();
        let document = RecognitionDocument {
            images: vec![
                ImageEntry {
                    file: "site1/a.jpg".to_string(),
                    detections: None,
                    failure: Some("Failure image access".to_string()),
                    ..Default::default()
                },
                image("site9/gone.jpg", vec![detection("1", 0.7)]),
            ],
            ..Default::default()
        };
        let summary = run(&conn, &document, "");
        assert_eq!(summary.images_failed, 1);
        assert_eq!(summary.images_unresolved, 1);
        assert!(detection_rows(&conn).is_empty());
    }

    #[test]
    fn prefix_is_stripped_and_outsiders_skipped() {
        let conn = store();
        let document = RecognitionDocument {
            images: vec![
                image("survey\\site1\\a.jpg", vec![detection("1", 0.7)]),
                image("other/site1/b.jpg", vec![detection("1", 0.7)]),
            ],
            ..Default::default()
        };
        let summary = run(&conn, &document, "survey");
        assert_eq!(summary.images_matched, 1);
        assert_eq!(summary.images_outside_prefix, 1);
        assert_eq!(detection_rows(&conn).len(), 1);
    }

    #[test]
    fn classifications_follow_their_detection() {
        let conn = store();
        let mut first = detection("1", 0.8);
        first.classifications = vec![
            ClassificationEntry {
                category: "10".to_string(),
                confidence: 0.6,
            },
            ClassificationEntry {
                category: "11".to_string(),
                confidence: 0.0001,
            },
        ];
        let mut second = detection("1", 0.5);
        second.classifications = vec![ClassificationEntry {
            category: "12".to_string(),
            confidence: 0.3,
        }];
        let document = RecognitionDocument {
            classification_categories: [("10".to_string(), "deer".to_string())]
                .into_iter()
                .collect(),
            images: vec![image("site1/a.jpg", vec![first, second])],
            ..Default::default()
        };
        let summary = run(&conn, &document, "");
        assert_eq!(summary.classifications_written, 2);
        let rows: Vec<(i64, String, i64)> = {
            let mut stmt = conn
                .prepare("SELECT classificationID, category, detectionID FROM Classifications ORDER BY classificationID")
                .expect("prepare");
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .expect("query");
            let out = rows.map(|r| r.expect("row")).collect();
            out
        };
        assert_eq!(
            rows,
            vec![(1, "10".to_string(), 1), (2, "12".to_string(), 2)]
        );
        let description: String = conn
            .query_row(
                "SELECT description FROM ClassificationCategories WHERE classification = '10'",
                [],
                |row| row.get(0),
            )
            .expect("description");
        assert_eq!(description, "");
    }

    #[test]
    fn empty_category_is_synthesized_once() {
        let conn = store();
        let document = RecognitionDocument {
            detection_categories: [("1".to_string(), "animal".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        run(&conn, &document, "");
        let labels: Vec<(String, String)> = {
            let mut stmt = conn
                .prepare("SELECT category, label FROM DetectionCategories ORDER BY category")
                .expect("prepare");
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .expect("query");
            let out = rows.map(|r| r.expect("row")).collect();
            out
        };
        assert_eq!(
            labels,
            vec![
                ("0".to_string(), "Empty".to_string()),
                ("1".to_string(), "animal".to_string())
            ]
        );
        let classification_categories: i64 = conn
            .query_row("SELECT COUNT(*) FROM ClassificationCategories", [], |row| row.get(0))
            .expect("count");
        assert_eq!(classification_categories, 0);
    }

    #[test]
    fn video_rows_carry_frame_details() {
        let conn = store();
        let mut d = detection("1", 0.9);
        d.frame_number = 42;
        let document = RecognitionDocument {
            images: vec![ImageEntry {
                file: "site2/v.mp4".to_string(),
                frame_rate: Some(29.97),
                detections: Some(vec![d]),
                ..Default::default()
            }],
            ..Default::default()
        };
        run(&conn, &document, "");
        let (frame, rate, bbox): (Option<i64>, Option<f64>, String) = conn
            .query_row(
                "SELECT frame_number, frame_rate, bbox FROM Detections",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("row");
        assert_eq!(frame, Some(42));
        assert_eq!(rate, Some(29.97));
        assert_eq!(bbox, "0.1, 0.2, 0.3, 0.4");
    }

    #[test]
    fn ids_continue_from_the_given_offsets() {
        let conn = store();
        let classified = |category: &str, conf: f64| {
            let mut d = detection("1", conf);
            d.classifications = vec![ClassificationEntry {
                category: category.to_string(),
                confidence: 0.6,
            }];
            d
        };
        let document = RecognitionDocument {
            images: vec![
                image("site1/a.jpg", vec![classified("10", 0.8)]),
                image("site1/b.jpg", vec![classified("11", 0.7)]),
            ],
            ..Default::default()
        };
        let catalog = catalog();
        let index = FileIndex::build(&catalog).expect("index");
        let summary = populate_tables(
            &conn,
            &document,
            &catalog,
            &index,
            "",
            IdOffsets {
                detection: 10,
                classification: 20,
            },
            &NoProgress,
            Cadence::INGEST.with_backoff(Duration::ZERO),
        )
        .expect("populate");

        let detection_ids: Vec<i64> = detection_rows(&conn).iter().map(|row| row.0).collect();
        assert_eq!(detection_ids, vec![10, 11]);
        let classifications: Vec<(i64, i64)> = {
            let mut stmt = conn
                .prepare("SELECT classificationID, detectionID FROM Classifications ORDER BY classificationID")
                .expect("prepare");
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .expect("query");
            let out = rows.map(|r| r.expect("row")).collect();
            out
        };
        assert_eq!(classifications, vec![(20, 10), (21, 11)]);
        assert_eq!(summary.next_detection_id, 12);
        assert_eq!(summary.next_classification_id, 22);
    }

    #[test]
    fn offsets_must_be_positive() {
        let conn = store();
        let catalog = catalog();
        let index = FileIndex::build(&catalog).expect("index");
        let err = populate_tables(
            &conn,
            &RecognitionDocument::default(),
            &catalog,
            &index,
            "",
            IdOffsets {
                detection: 0,
                classification: 1,
            },
            &NoProgress,
            Cadence::INGEST,
        );
        assert!(err.is_err());
        assert_eq!(catalog.index_requests(), 0);
    }
}
