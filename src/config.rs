use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::import::ImportOptions;
use crate::merge::VersionComparison;
use crate::progress::{Cadence, DEFAULT_BACKOFF};

const DEFAULT_DB_PATH: &str = "timelapse.ddb";
const DEFAULT_MERGE: bool = true;

#[derive(Debug, Deserialize, Default)]
struct ImportConfigFile {
    db_path: Option<PathBuf>,
    root_folder: Option<PathBuf>,
    merge: Option<bool>,
    version_order: Option<String>,
    progress: Option<ProgressConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ProgressConfigFile {
    ingest_every: Option<usize>,
    path_check_every: Option<usize>,
    prefix_rewrite_every: Option<usize>,
    merge_scan_every: Option<usize>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportConfig {
    pub db_path: PathBuf,
    /// Dataset root; defaults to the folder holding the database.
    pub root_folder: Option<PathBuf>,
    pub merge: bool,
    pub version_comparison: VersionComparison,
    pub cadences: CadenceSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceSettings {
    pub ingest: Cadence,
    pub path_check: Cadence,
    pub prefix_rewrite: Cadence,
    pub merge_scan: Cadence,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            ingest: Cadence::INGEST,
            path_check: Cadence::PATH_CHECK,
            prefix_rewrite: Cadence::PREFIX_REWRITE,
            merge_scan: Cadence::MERGE_SCAN,
        }
    }
}

impl CadenceSettings {
    fn set_backoff(&mut self, backoff: Duration) {
        for cadence in [
            &mut self.ingest,
            &mut self.path_check,
            &mut self.prefix_rewrite,
            &mut self.merge_scan,
        ] {
            *cadence = cadence.with_backoff(backoff);
        }
    }
}

impl ImportConfig {
    /// Defaults, then the file named by `TRAPCAM_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAPCAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ImportConfigFile) -> Result<Self> {
        let version_comparison = match file.version_order.as_deref() {
            Some(raw) => parse_version_order(raw)?,
            None => VersionComparison::default(),
        };
        let progress = file.progress.unwrap_or_default();
        let mut cadences = CadenceSettings::default();
        if let Some(every) = progress.ingest_every {
            cadences.ingest.every = every;
        }
        if let Some(every) = progress.path_check_every {
            cadences.path_check.every = every;
        }
        if let Some(every) = progress.prefix_rewrite_every {
            cadences.prefix_rewrite.every = every;
        }
        if let Some(every) = progress.merge_scan_every {
            cadences.merge_scan.every = every;
        }
        cadences.set_backoff(
            progress
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF),
        );
        Ok(Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            root_folder: file.root_folder,
            merge: file.merge.unwrap_or(DEFAULT_MERGE),
            version_comparison,
            cadences,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TRAPCAM_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("TRAPCAM_ROOT_FOLDER") {
            if !path.trim().is_empty() {
                self.root_folder = Some(PathBuf::from(path));
            }
        }
        if let Ok(merge) = std::env::var("TRAPCAM_MERGE") {
            self.merge = parse_bool(&merge)
                .ok_or_else(|| anyhow!("TRAPCAM_MERGE must be true or false"))?;
        }
        if let Ok(order) = std::env::var("TRAPCAM_VERSION_ORDER") {
            self.version_comparison = parse_version_order(&order)?;
        }
        if let Ok(every) = std::env::var("TRAPCAM_PROGRESS_EVERY") {
            self.cadences.ingest.every = every
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRAPCAM_PROGRESS_EVERY must be a positive integer"))?;
        }
        if let Ok(backoff) = std::env::var("TRAPCAM_BACKOFF_MS") {
            let ms: u64 = backoff.trim().parse().map_err(|_| {
                anyhow!("TRAPCAM_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.cadences.set_backoff(Duration::from_millis(ms));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        let c = &self.cadences;
        for (name, cadence) in [
            ("ingest", c.ingest),
            ("path check", c.path_check),
            ("prefix rewrite", c.prefix_rewrite),
            ("merge scan", c.merge_scan),
        ] {
            if cadence.every == 0 {
                return Err(anyhow!("{} progress cadence must be greater than zero", name));
            }
        }
        Ok(())
    }

    /// The dataset root: the configured folder, else the database's folder.
    pub fn root_folder(&self) -> PathBuf {
        if let Some(root) = &self.root_folder {
            return root.clone();
        }
        match self.db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            merge: self.merge,
            version_comparison: self.version_comparison,
            ingest_cadence: self.cadences.ingest,
            merge_cadence: self.cadences.merge_scan,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ImportConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_version_order(raw: &str) -> Result<VersionComparison> {
    VersionComparison::parse(raw)
        .ok_or_else(|| anyhow!("version order must be 'ordinal' or 'natural', got '{}'", raw))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
