use anyhow::{Context, Result};
use rusqlite::Connection;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::paths::{location_key, normalize_separators};
use crate::schema::{
    CLASSIFICATIONS_TABLE, CLASSIFICATION_DETECTION_INDEX, DETECTIONS_TABLE, DETECTION_FILE_INDEX,
    DETECTION_ID, FILE_ID, FILE_NAME, FILE_RELATIVE_PATH, FILE_TABLE,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    /// Folder relative to the dataset root, empty for files in the root itself.
    pub relative_path: String,
    pub file_name: String,
}

impl FileRecord {
    pub fn new(id: i64, relative_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id,
            relative_path: relative_path.into(),
            file_name: file_name.into(),
        }
    }
}

pub trait FileCatalog {
    fn file_records(&self) -> Result<Vec<FileRecord>>;

    /// Build the indexes used to join recognitions back to files. Called once
    /// after a bulk insert.
    fn create_recognition_indexes(&self) -> Result<()>;
}

pub struct SqliteFileCatalog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteFileCatalog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl FileCatalog for SqliteFileCatalog<'_> {
    fn file_records(&self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {}, {}, {} FROM {}",
            FILE_ID, FILE_RELATIVE_PATH, FILE_NAME, FILE_TABLE
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to read file catalog")?;
        let rows = stmt.query_map([], |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                relative_path: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                file_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn create_recognition_indexes(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS {} ON {}({});
            CREATE INDEX IF NOT EXISTS {} ON {}({});
            "#,
            DETECTION_FILE_INDEX,
            DETECTIONS_TABLE,
            FILE_ID,
            CLASSIFICATION_DETECTION_INDEX,
            CLASSIFICATIONS_TABLE,
            DETECTION_ID
        ))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileCatalog {
    records: Vec<FileRecord>,
    index_requests: Cell<usize>,
}

impl InMemoryFileCatalog {
    pub fn new(records: Vec<FileRecord>) -> Self {
        Self {
            records,
            index_requests: Cell::new(0),
        }
    }

    pub fn index_requests(&self) -> usize {
        self.index_requests.get()
    }
}

impl FileCatalog for InMemoryFileCatalog {
    fn file_records(&self) -> Result<Vec<FileRecord>> {
        Ok(self.records.clone())
    }

    fn create_recognition_indexes(&self) -> Result<()> {
        self.index_requests.set(self.index_requests.get() + 1);
        Ok(())
    }
}

// -------------------- File Index --------------------

/// Lookup from `(relative folder, file name)` to file record ids.
///
/// Built once before ingestion. Separators are normalized to `/` and case is
/// ignored on both the catalog and the lookup side. A key may map to several
/// ids when the catalog holds duplicate rows for one file.
#[derive(Clone, Debug, Default)]
pub struct FileIndex {
    by_location: HashMap<(String, String), Vec<i64>>,
    // case-folded folder -> folder as first spelled in the catalog
    folder_names: BTreeMap<String, String>,
}

impl FileIndex {
    pub fn build(catalog: &dyn FileCatalog) -> Result<Self> {
        let records = catalog.file_records()?;
        Ok(Self::from_records(&records))
    }

    pub fn from_records(records: &[FileRecord]) -> Self {
        let mut by_location: HashMap<(String, String), Vec<i64>> = HashMap::new();
        let mut folder_names = BTreeMap::new();
        let mut duplicates = 0usize;
        for record in records {
            let folder = normalize_folder(&record.relative_path);
            let key = (folder.to_lowercase(), record.file_name.to_lowercase());
            folder_names.entry(key.0.clone()).or_insert(folder);
            let ids = by_location.entry(key).or_default();
            if !ids.is_empty() {
                duplicates += 1;
            }
            ids.push(record.id);
        }
        if duplicates > 0 {
            log::warn!(
                "file catalog holds {} duplicate file rows; each will receive recognitions",
                duplicates
            );
        }
        Self {
            by_location,
            folder_names,
        }
    }

    pub fn lookup(&self, recorded_path: &str) -> &[i64] {
        self.by_location
            .get(&location_key(recorded_path))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn folders(&self) -> BTreeSet<String> {
        self.folder_names.values().cloned().collect()
    }

    pub(crate) fn folder_names(&self) -> &BTreeMap<String, String> {
        &self.folder_names
    }

    pub fn len(&self) -> usize {
        self.by_location.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }
}

fn normalize_folder(folder: &str) -> String {
    normalize_separators(folder).trim_matches('/').to_string()
}
