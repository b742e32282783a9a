//! Recognition tables: creation, clearing and existence checks.
//!
//! The file catalog (`DataTable`) belongs to the host application; this module
//! only references it from the `Detections` foreign key.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

pub const FILE_TABLE: &str = "DataTable";
pub const FILE_ID: &str = "Id";
pub const FILE_NAME: &str = "File";
pub const FILE_RELATIVE_PATH: &str = "RelativePath";

pub const INFO_TABLE: &str = "Info";
pub const INFO_ID: &str = "infoID";
pub const INFO_DETECTOR: &str = "detector";
pub const INFO_DETECTOR_VERSION: &str = "megadetector_version";
pub const INFO_DETECTION_COMPLETION_TIME: &str = "detection_completion_time";
pub const INFO_CLASSIFIER: &str = "classifier";
pub const INFO_CLASSIFICATION_COMPLETION_TIME: &str = "classification_completion_time";
pub const INFO_TYPICAL_DETECTION_THRESHOLD: &str = "typical_detection_threshold";
pub const INFO_CONSERVATIVE_DETECTION_THRESHOLD: &str = "conservative_detection_threshold";
pub const INFO_TYPICAL_CLASSIFICATION_THRESHOLD: &str = "typical_classification_threshold";

pub const DETECTION_CATEGORIES_TABLE: &str = "DetectionCategories";
pub const CLASSIFICATION_CATEGORIES_TABLE: &str = "ClassificationCategories";
pub const DETECTIONS_TABLE: &str = "Detections";
pub const CLASSIFICATIONS_TABLE: &str = "Classifications";

pub const DETECTION_ID: &str = "detectionID";
pub const CLASSIFICATION_ID: &str = "classificationID";

pub const DETECTION_FILE_INDEX: &str = "IndexDetectionID";
pub const CLASSIFICATION_DETECTION_INDEX: &str = "IndexClassificationID";

pub const INFO_ROW_ID: i64 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearSelection {
    pub info: bool,
    pub detection_categories: bool,
    pub classification_categories: bool,
    pub detections: bool,
    pub classifications: bool,
}

impl ClearSelection {
    pub const ALL: ClearSelection = ClearSelection {
        info: true,
        detection_categories: true,
        classification_categories: true,
        detections: true,
        classifications: true,
    };

    /// Run info and both category dictionaries, leaving detection data in place.
    pub const METADATA: ClearSelection = ClearSelection {
        info: true,
        detection_categories: true,
        classification_categories: true,
        detections: false,
        classifications: false,
    };
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE Info (
          infoID INTEGER PRIMARY KEY,
          detector TEXT,
          megadetector_version TEXT DEFAULT 'vUnknown',
          detection_completion_time TEXT,
          classifier TEXT,
          classification_completion_time TEXT,
          typical_detection_threshold REAL DEFAULT 0.8,
          conservative_detection_threshold REAL DEFAULT 0.3,
          typical_classification_threshold REAL DEFAULT 0.75
        );

        CREATE TABLE DetectionCategories (
          category TEXT PRIMARY KEY,
          label TEXT
        );

        CREATE TABLE ClassificationCategories (
          classification TEXT PRIMARY KEY,
          label TEXT,
          description TEXT DEFAULT ''
        );

        CREATE TABLE Detections (
          detectionID INTEGER PRIMARY KEY,
          category TEXT,
          conf REAL,
          bbox TEXT,
          Id INTEGER,
          frame_number INTEGER,
          frame_rate REAL,
          FOREIGN KEY (Id) REFERENCES DataTable (Id) ON DELETE CASCADE
        );

        CREATE TABLE Classifications (
          classificationID INTEGER PRIMARY KEY,
          category TEXT,
          conf REAL,
          detectionID INTEGER,
          FOREIGN KEY (detectionID) REFERENCES Detections (detectionID) ON DELETE CASCADE
        );
        "#,
    )
    .context("failed to create recognition tables")?;
    log::debug!("created recognition tables");
    Ok(())
}

/// Delete all rows (not the schema) from the selected tables.
///
/// Classifications are cleared before detections so the cascade has nothing
/// left to do.
pub fn clear_tables(conn: &Connection, which: ClearSelection) -> Result<()> {
    let ordered = [
        (which.info, INFO_TABLE),
        (which.detection_categories, DETECTION_CATEGORIES_TABLE),
        (which.classification_categories, CLASSIFICATION_CATEGORIES_TABLE),
        (which.classifications, CLASSIFICATIONS_TABLE),
        (which.detections, DETECTIONS_TABLE),
    ];
    for (selected, table) in ordered {
        if selected {
            conn.execute(&format!("DELETE FROM {}", table), [])
                .with_context(|| format!("failed to clear {}", table))?;
        }
    }
    Ok(())
}

/// Get the recognition tables ready for an import.
///
/// Existing tables always lose their run info and category dictionaries;
/// detections and classifications are only dropped when `clear_detection_data`.
pub fn prepare_tables(
    conn: &Connection,
    tables_exist: bool,
    clear_detection_data: bool,
) -> Result<()> {
    if !tables_exist {
        return create_tables(conn);
    }
    let which = if clear_detection_data {
        ClearSelection::ALL
    } else {
        ClearSelection::METADATA
    };
    clear_tables(conn, which)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn recognition_tables_exist(conn: &Connection) -> Result<bool> {
    for table in [
        INFO_TABLE,
        DETECTION_CATEGORIES_TABLE,
        CLASSIFICATION_CATEGORIES_TABLE,
        DETECTIONS_TABLE,
        CLASSIFICATIONS_TABLE,
    ] {
        if !table_exists(conn, table)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn detections_exist(conn: &Connection) -> Result<bool> {
    if !table_exists(conn, DETECTIONS_TABLE)? {
        return Ok(false);
    }
    let any: Option<i64> = conn
        .query_row("SELECT 1 FROM Detections LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(any.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE DataTable (Id INTEGER PRIMARY KEY, File TEXT, RelativePath TEXT);
            INSERT INTO DataTable (Id, File, RelativePath) VALUES (1, 'a.jpg', 'site1');
            "#,
        )
        .expect("catalog");
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .expect("count")
    }

    fn seed(conn: &Connection) {
        conn.execute_batch(
            r#"
            INSERT INTO Info (infoID, detector) VALUES (1, 'md');
            INSERT INTO DetectionCategories VALUES ('1', 'animal');
            INSERT INTO ClassificationCategories (classification, label) VALUES ('10', 'deer');
            INSERT INTO Detections (detectionID, category, conf, bbox, Id) VALUES (1, '1', 0.9, '', 1);
            INSERT INTO Classifications VALUES (1, '10', 0.8, 1);
            "#,
        )
        .expect("seed");
    }

    #[test]
    fn prepare_creates_missing_tables() {
        let conn = catalog_db();
        assert!(!recognition_tables_exist(&conn).expect("existence check"));
        prepare_tables(&conn, false, false).expect("prepare");
        assert!(recognition_tables_exist(&conn).expect("existence check"));
        assert!(!detections_exist(&conn).expect("existence check"));
    }

    #[test]
    fn prepare_keeps_detection_data_unless_asked() {
        let conn = catalog_db();
        create_tables(&conn).expect("create");
        seed(&conn);

        prepare_tables(&conn, true, false).expect("prepare");
        assert_eq!(count(&conn, INFO_TABLE), 0);
        assert_eq!(count(&conn, DETECTION_CATEGORIES_TABLE), 0);
        assert_eq!(count(&conn, CLASSIFICATION_CATEGORIES_TABLE), 0);
        assert_eq!(count(&conn, DETECTIONS_TABLE), 1);
        assert_eq!(count(&conn, CLASSIFICATIONS_TABLE), 1);

        prepare_tables(&conn, true, true).expect("prepare");
        assert_eq!(count(&conn, DETECTIONS_TABLE), 0);
        assert_eq!(count(&conn, CLASSIFICATIONS_TABLE), 0);
    }

    #[test]
    fn deleting_a_file_cascades_to_recognitions() {
        let conn = catalog_db();
        create_tables(&conn).expect("create");
        seed(&conn);
        conn.execute("DELETE FROM DataTable WHERE Id = 1", [])
            .expect("delete");
        assert_eq!(count(&conn, DETECTIONS_TABLE), 0);
        assert_eq!(count(&conn, CLASSIFICATIONS_TABLE), 0);
    }

    #[test]
    fn clear_tables_honours_each_flag() {
        let conn = catalog_db();
        create_tables(&conn).expect("create");
        seed(&conn);
        clear_tables(
            &conn,
            ClearSelection {
                classifications: true,
                ..Default::default()
            },
        )
        .expect("clear");
        assert_eq!(count(&conn, CLASSIFICATIONS_TABLE), 0);
        assert_eq!(count(&conn, DETECTIONS_TABLE), 1);
        assert_eq!(count(&conn, INFO_TABLE), 1);
    }
}
