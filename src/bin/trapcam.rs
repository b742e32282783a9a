//! trapcam - import camera-trap recognition results into a file database.
//!
//! Subcommands:
//! - `import`: read a detector output file, fix up its paths and merge it into
//!   the database's recognition tables
//! - `detect-paths`: report which folder a recognition file's paths are relative to
//! - `bounds`: print the confidence range a selection would query
//! - `info`: show the stored run info and category dictionaries

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use trapcam_recognition::import::{next_ids, read_stored_recognitions, stored_thresholds};
use trapcam_recognition::paths::subfolder_prefix;
use trapcam_recognition::{
    apply_prefix_to_all_paths, compute_bounds, detect_likely_path_base, import_document,
    load_document, open_db_connection, CancelStatus, CancelToken, ImportConfig, ImportOutcome,
    ImportReport, PathBase, RecognitionSelection, SelectionMode, SqliteFileCatalog,
    VersionComparison,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "trapcam",
    about = "Import camera-trap recognition results into a file database"
)]
struct Cli {
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE", global = true)]
    ui: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a recognition file into the database
    Import(ImportArgs),
    /// Report whether a recognition file's paths are root- or subfolder-relative
    DetectPaths(DetectPathsArgs),
    /// Print the confidence bounds a selection would use
    Bounds(BoundsArgs),
    /// Show stored run info and categories
    Info(InfoArgs),
}

#[derive(Args, Debug)]
struct DatabaseArgs {
    /// Path to the file database
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Dataset root folder (defaults to the database's folder)
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Recognition JSON produced by the detector
    #[arg(value_name = "JSON")]
    json: PathBuf,

    #[command(flatten)]
    database: DatabaseArgs,

    /// Replace all stored recognitions instead of merging
    #[arg(long)]
    replace: bool,

    /// Fall back to replacing stored recognitions when categories conflict
    #[arg(long)]
    replace_on_conflict: bool,

    /// Keep recorded paths as-is even when they look subfolder-relative
    #[arg(long)]
    keep_paths: bool,

    /// Detector version ordering used when merging run info
    #[arg(long, value_enum)]
    version_order: Option<VersionOrder>,
}

#[derive(Args, Debug)]
struct DetectPathsArgs {
    #[arg(value_name = "JSON")]
    json: PathBuf,

    #[command(flatten)]
    database: DatabaseArgs,

    /// Subfolder to test against (defaults to the recognition file's folder)
    #[arg(long, value_name = "FOLDER")]
    subfolder: Option<String>,
}

#[derive(Args, Debug)]
struct BoundsArgs {
    #[arg(long, value_enum, default_value = "specific")]
    mode: Mode,

    /// Lower slider; defaults to the stored typical detection threshold
    #[arg(long)]
    low: Option<f64>,

    /// Upper slider
    #[arg(long, default_value_t = 1.0)]
    high: f64,

    /// Read default thresholds from this database
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    database: DatabaseArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VersionOrder {
    Ordinal,
    Natural,
}

impl From<VersionOrder> for VersionComparison {
    fn from(order: VersionOrder) -> Self {
        match order {
            VersionOrder::Ordinal => VersionComparison::Ordinal,
            VersionOrder::Natural => VersionComparison::Natural,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Specific,
    All,
    Empty,
}

impl From<Mode> for SelectionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Specific => SelectionMode::SpecificCategory,
            Mode::All => SelectionMode::AllDetections,
            Mode::Empty => SelectionMode::InterpretAsEmpty,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let ui = ui::Ui::from_args(&cli.ui, std::io::stderr().is_terminal());

    match cli.command {
        Command::Import(args) => run_import(&ui, args),
        Command::DetectPaths(args) => run_detect_paths(&ui, args),
        Command::Bounds(args) => run_bounds(args),
        Command::Info(args) => run_info(args),
    }
}

fn load_config(database: &DatabaseArgs) -> Result<ImportConfig> {
    let mut cfg = ImportConfig::load()?;
    if let Some(db) = &database.db {
        cfg.db_path = db.clone();
    }
    if let Some(root) = &database.root {
        cfg.root_folder = Some(root.clone());
    }
    Ok(cfg)
}

fn cancel_on_ctrlc() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("cancel requested; stopping at the next checkpoint");
        handler.cancel();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    Ok(cancel)
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn run_import(ui: &ui::Ui, args: ImportArgs) -> Result<()> {
    let mut cfg = load_config(&args.database)?;
    if args.replace {
        cfg.merge = false;
    }
    if let Some(order) = args.version_order {
        cfg.version_comparison = order.into();
    }
    let cancel = cancel_on_ctrlc()?;
    let root = absolute(&cfg.root_folder());

    let conn = {
        let _stage = ui.stage("Open database");
        open_db_connection(&cfg.db_path.to_string_lossy())?
    };

    let document = {
        let stage = ui.progress("Read recognition file");
        load_document(&args.json, &stage, &cancel)?
    };
    let Some(mut document) = document else {
        println!("import cancelled");
        return Ok(());
    };

    let prefix = subfolder_prefix(&root, &absolute(&args.json));
    let base = {
        let stage = ui.progress("Check recognition paths");
        detect_likely_path_base(
            &document,
            &root,
            &prefix,
            &stage,
            &cancel,
            cfg.cadences.path_check,
        )
    };
    match base {
        PathBase::Cancelled => {
            println!("import cancelled");
            return Ok(());
        }
        PathBase::SubFolderRelative if !args.keep_paths => {
            log::info!("recorded paths are relative to {}; adding that prefix", prefix);
            let stage = ui.progress("Add subfolder prefix");
            let status = apply_prefix_to_all_paths(
                &mut document,
                &prefix,
                &stage,
                &cancel,
                cfg.cadences.prefix_rewrite,
            );
            if status == CancelStatus::Cancelled {
                println!("import cancelled");
                return Ok(());
            }
        }
        PathBase::SubFolderRelative => {
            log::warn!(
                "recorded paths look relative to {} but --keep-paths was given",
                prefix
            );
        }
        PathBase::NoMatch => {
            let sample = document
                .images
                .first()
                .map(|image| image.file.as_str())
                .unwrap_or("");
            log::warn!(
                "no recorded path matched a file under {} (first entry: '{}')",
                root.display(),
                sample
            );
        }
        PathBase::RootRelative => {}
    }

    let catalog = SqliteFileCatalog::new(&conn);
    let mut options = cfg.import_options();
    let mut outcome = {
        let stage = ui.progress("Import recognitions");
        import_document(&conn, &mut document, &catalog, &options, &stage, &cancel)?
    };
    let conflict = matches!(
        outcome,
        ImportOutcome::IncompatibleDetectionCategories
            | ImportOutcome::IncompatibleClassificationCategories
    );
    if conflict && args.replace_on_conflict {
        log::warn!("stored categories conflict with the import; replacing stored recognitions");
        options.merge = false;
        let stage = ui.progress("Replace recognitions");
        outcome = import_document(&conn, &mut document, &catalog, &options, &stage, &cancel)?;
    }

    match outcome {
        ImportOutcome::Imported(report) => {
            print_report(&report);
            Ok(())
        }
        ImportOutcome::Cancelled => {
            println!("import cancelled; the database was not changed");
            Ok(())
        }
        ImportOutcome::NoMatchingFolders(folders) => {
            for folder in &folders.only_in_document {
                println!("  not in database: {}", display_folder(folder));
            }
            Err(anyhow!(
                "no folder in {} matches a folder in the database",
                args.json.display()
            ))
        }
        ImportOutcome::IncompatibleDetectionCategories => Err(anyhow!(
            "detection categories conflict with the stored ones; rerun with --replace-on-conflict or --replace"
        )),
        ImportOutcome::IncompatibleClassificationCategories => Err(anyhow!(
            "classification categories conflict with the stored ones; rerun with --replace-on-conflict or --replace"
        )),
    }
}

fn display_folder(folder: &str) -> &str {
    if folder.is_empty() {
        "(root)"
    } else {
        folder
    }
}

fn print_report(report: &ImportReport) {
    let ingest = &report.ingest;
    println!(
        "imported {} of {} images ({})",
        ingest.images_matched,
        ingest.images_total,
        if report.merged { "merged" } else { "replaced" }
    );
    println!(
        "  detections: {} ({} empty)",
        ingest.detections_written, ingest.empty_rows_written
    );
    println!("  classifications: {}", ingest.classifications_written);
    if report.merged {
        println!("  files with replaced recognitions: {}", report.files_replaced);
    }
    if ingest.images_failed > 0 {
        println!("  detector failures skipped: {}", ingest.images_failed);
    }
    if ingest.images_unresolved > 0 {
        println!("  not found in database: {}", ingest.images_unresolved);
    }
    if !report.folders.only_in_catalog.is_empty() {
        println!("  database folders without recognitions:");
        for folder in &report.folders.only_in_catalog {
            println!("    {}", display_folder(folder));
        }
    }
    let info = &report.run_info;
    println!(
        "  detector {} ({}), typical threshold {}",
        info.detector, info.detector_version, info.typical_detection_threshold
    );
}

fn run_detect_paths(ui: &ui::Ui, args: DetectPathsArgs) -> Result<()> {
    let cfg = load_config(&args.database)?;
    let cancel = cancel_on_ctrlc()?;
    let root = absolute(&cfg.root_folder());
    let document = {
        let stage = ui.progress("Read recognition file");
        load_document(&args.json, &stage, &cancel)?
    };
    let Some(document) = document else {
        println!("cancelled");
        return Ok(());
    };
    let prefix = args
        .subfolder
        .unwrap_or_else(|| subfolder_prefix(&root, &absolute(&args.json)));
    let base = {
        let stage = ui.progress("Check recognition paths");
        detect_likely_path_base(
            &document,
            &root,
            &prefix,
            &stage,
            &cancel,
            cfg.cadences.path_check,
        )
    };
    match base {
        PathBase::RootRelative => println!("root-relative ({})", root.display()),
        PathBase::SubFolderRelative => println!("subfolder-relative ({})", prefix),
        PathBase::NoMatch => println!("no match under {}", root.display()),
        PathBase::Cancelled => println!("cancelled"),
    }
    Ok(())
}

fn run_bounds(args: BoundsArgs) -> Result<()> {
    let context = match &args.db {
        Some(db) => stored_thresholds(&open_db_connection(&db.to_string_lossy())?)?,
        None => Default::default(),
    };
    let bounds = match args.low {
        Some(low) => compute_bounds(args.mode.into(), low, args.high),
        None => {
            let mut selection = RecognitionSelection::new(context);
            selection.mode = args.mode.into();
            selection.upper_threshold = args.high;
            selection.detection_bounds()
        }
    };
    println!("{} {}", bounds.lower, bounds.upper);
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    let cfg = load_config(&args.database)?;
    let conn = open_db_connection(&cfg.db_path.to_string_lossy())?;
    let stored = read_stored_recognitions(&conn)?;
    if stored.info.is_empty() {
        println!("no recognition data in {}", cfg.db_path.display());
        return Ok(());
    }
    let info = stored.info.resolve();
    println!("detector: {} ({})", info.detector, info.detector_version);
    println!("detection completed: {}", info.detection_completed_at);
    println!(
        "classifier: {} (completed {})",
        info.classifier, info.classification_completed_at
    );
    println!(
        "thresholds: typical {} / conservative {} / classification {}",
        info.typical_detection_threshold,
        info.conservative_detection_threshold,
        info.typical_classification_threshold
    );
    println!("detection categories:");
    for (id, label) in &stored.detection_categories {
        println!("  {}: {}", id, label);
    }
    if !stored.classification_categories.is_empty() {
        println!("classification categories:");
        for (id, label) in &stored.classification_categories {
            match stored.classification_descriptions.get(id) {
                Some(description) => println!("  {}: {} ({})", id, label, description),
                None => println!("  {}: {}", id, label),
            }
        }
    }
    let next = next_ids(&conn)?;
    println!(
        "next ids: detection {}, classification {}",
        next.detection, next.classification
    );
    Ok(())
}
