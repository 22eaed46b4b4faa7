use crate::{
    archiver::{self, BackupRequest},
    catalog::BackupCatalog,
    config::AppConfig,
    game::GameDescriptor,
    install_log::InstallLog,
    model::BackupCategory,
    overlay::Overlay,
    profile,
    progress::{Phase, ProgressCallback, ProgressReporter},
    purge::{self, PurgeOptions},
    restorer::{self, RestoreMode, RestoreRequest},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    game: Option<String>,
    root: Option<PathBuf>,
}

enum CliCommand {
    Create {
        categories: Vec<BackupCategory>,
        out: Option<PathBuf>,
    },
    Inspect {
        archive: PathBuf,
    },
    Restore {
        archive: PathBuf,
        purge: bool,
    },
    Purge {
        no_backup: bool,
    },
    Paths,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, global) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modvault v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliCommand::Create { categories, out } => run_create(&global, categories, out),
        CliCommand::Inspect { archive } => run_inspect(&global, &archive),
        CliCommand::Restore { archive, purge } => run_restore(&global, &archive, purge),
        CliCommand::Purge { no_backup } => run_purge(&global, no_backup),
        CliCommand::Paths => run_paths(&global),
    }
}

fn parse_args(args: &[String]) -> Result<(CliCommand, GlobalOptions)> {
    let mut global = GlobalOptions {
        format: OutputFormat::Text,
        game: None,
        root: None,
    };

    let mut iter = args.iter().peekable();
    let Some(first) = iter.next() else {
        return Ok((CliCommand::Help, global));
    };

    let mut positional: Vec<String> = Vec::new();
    let mut categories: Option<Vec<BackupCategory>> = None;
    let mut out: Option<PathBuf> = None;
    let mut purge_flag = false;
    let mut no_backup = false;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" | "-f" => {
                let value = iter.next().context("--format requires a value")?;
                global.format =
                    OutputFormat::parse(value).with_context(|| format!("unknown format {value:?}"))?;
            }
            "--game" | "-g" => {
                let value = iter.next().context("--game requires a game id")?;
                global.game = Some(value.clone());
            }
            "--root" => {
                let value = iter.next().context("--root requires a directory")?;
                global.root = Some(PathBuf::from(value));
            }
            "--categories" | "-c" => {
                let value = iter.next().context("--categories requires a list")?;
                categories = Some(parse_categories(value)?);
            }
            "--out" | "-o" => {
                let value = iter.next().context("--out requires a directory")?;
                out = Some(PathBuf::from(value));
            }
            "--purge" => purge_flag = true,
            "--no-backup" => no_backup = true,
            other if other.starts_with('-') => bail!("unknown option {other:?}"),
            other => positional.push(other.to_string()),
        }
    }

    let command = match first.as_str() {
        "create" => CliCommand::Create {
            categories: categories.unwrap_or_else(|| BackupCategory::ALL.to_vec()),
            out,
        },
        "inspect" => CliCommand::Inspect {
            archive: PathBuf::from(
                positional
                    .first()
                    .context("inspect requires an archive path")?,
            ),
        },
        "restore" => CliCommand::Restore {
            archive: PathBuf::from(
                positional
                    .first()
                    .context("restore requires an archive path")?,
            ),
            purge: purge_flag,
        },
        "purge" => CliCommand::Purge { no_backup },
        "paths" => CliCommand::Paths,
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("unknown command {other:?}; try `modvault help`"),
    };
    Ok((command, global))
}

fn parse_categories(value: &str) -> Result<Vec<BackupCategory>> {
    if value == "all" {
        return Ok(BackupCategory::ALL.to_vec());
    }
    let mut categories = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let category = BackupCategory::parse(part).with_context(|| {
            format!("unknown category {part:?}; expected base, mods, link, loose, archives, cache")
        })?;
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    if categories.is_empty() {
        bail!("no categories selected");
    }
    Ok(categories)
}

fn load_game(global: &GlobalOptions) -> Result<GameDescriptor> {
    let game_id = match &global.game {
        Some(id) => id.clone(),
        None => AppConfig::load_or_create()?.active_game,
    };
    let game = match &global.root {
        Some(root) => GameDescriptor::load_or_create_at(root, &game_id)?,
        None => GameDescriptor::load_or_create(&game_id)?,
    };
    if !game.is_configured() {
        bail!(
            "game {:?} is not configured; edit {:?} and set install_path and plugin_dir",
            game_id,
            game.data_dir.join("game.json")
        );
    }
    Ok(game)
}

/// Full scan across every category; selection narrows what gets archived,
/// not what gets cataloged.
fn build_catalog(
    game: &GameDescriptor,
    overlay: Option<&Overlay>,
    install_log: &InstallLog,
    include_link_files: bool,
) -> Result<BackupCatalog> {
    let mut catalog = BackupCatalog::new();
    catalog.reset();
    catalog.scan_loose_files(game, overlay, install_log, include_link_files)?;
    catalog.scan_mod_archives(game)?;
    Ok(catalog)
}

fn progress_printer() -> ProgressCallback {
    let last: Mutex<Option<Phase>> = Mutex::new(None);
    Arc::new(move |event| {
        let mut last = last.lock().unwrap();
        if *last != Some(event.phase) {
            eprintln!("  {}...", event.phase.label());
            *last = Some(event.phase);
        }
    })
}

#[derive(Serialize)]
struct CreateOutput {
    archive: String,
    profile_id: String,
    categories: Vec<&'static str>,
    files: usize,
    bytes: u64,
    warnings: Vec<String>,
}

fn run_create(
    global: &GlobalOptions,
    categories: Vec<BackupCategory>,
    out: Option<PathBuf>,
) -> Result<()> {
    let config = AppConfig::load_or_create()?;
    let game = load_game(global)?;
    let overlay = Overlay::load(&game)?;
    let install_log = InstallLog::load(&game.install_log_path())?;
    let catalog = build_catalog(&game, overlay.as_ref(), &install_log, config.include_link_files)?;

    let destination_dir = out
        .or(config.backup_dir.clone())
        .unwrap_or_else(|| game.backups_dir());
    let profile_name = if game.active_profile.is_empty() {
        "Default".to_string()
    } else {
        game.active_profile.clone()
    };
    let snapshot = profile::live_snapshot(&game, &install_log, overlay.as_ref());
    let category_labels: Vec<&'static str> =
        categories.iter().map(|category| category.label()).collect();

    let request = BackupRequest {
        game: &game,
        catalog: &catalog,
        categories,
        destination_dir,
        profile_name,
        snapshot,
        staging_base: None,
        fallback_staging_root: None,
    };
    let reporter = ProgressReporter::new(Some(progress_printer()), None);
    let report = archiver::create_backup(&request, &reporter)?;

    match global.format {
        OutputFormat::Json => {
            let output = CreateOutput {
                archive: report.archive_path.display().to_string(),
                profile_id: report.profile_id,
                categories: category_labels,
                files: report.file_count,
                bytes: report.total_bytes,
                warnings: report.warnings,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Backup written to {}", report.archive_path.display());
            println!("  categories: {}", category_labels.join(","));
            println!("  files:  {}", report.file_count);
            println!("  bytes:  {}", report.total_bytes);
            for warning in &report.warnings {
                println!("  warning: {warning}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct InspectOutput {
    archive: String,
    valid: bool,
    has_plugin_folder: bool,
    has_virtual_install: bool,
    files: usize,
    bytes: u64,
    folders: Vec<FolderOutput>,
    profile: Option<ProfileOutput>,
}

#[derive(Serialize)]
struct FolderOutput {
    name: String,
    bytes: u64,
}

#[derive(Serialize)]
struct ProfileOutput {
    id: String,
    name: String,
    game: String,
    mod_count: u32,
}

fn run_inspect(global: &GlobalOptions, archive: &std::path::Path) -> Result<()> {
    let game = load_game(global)?;
    let inspection = restorer::inspect(archive, &game)?;
    let valid = inspection.validate().is_ok();

    match global.format {
        OutputFormat::Json => {
            let output = InspectOutput {
                archive: archive.display().to_string(),
                valid,
                has_plugin_folder: inspection.has_plugin_folder,
                has_virtual_install: inspection.has_virtual_install,
                files: inspection.file_count,
                bytes: inspection.total_bytes,
                folders: inspection
                    .folder_totals
                    .iter()
                    .map(|(name, bytes)| FolderOutput {
                        name: name.clone(),
                        bytes: *bytes,
                    })
                    .collect(),
                profile: inspection.profile.as_ref().map(|record| ProfileOutput {
                    id: record.profile_id.clone(),
                    name: record.profile_name.clone(),
                    game: record.game_mode_id.clone(),
                    mod_count: record.mod_count,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Archive {}", archive.display());
            println!("  plugin folder:   {}", inspection.has_plugin_folder);
            println!("  virtual install: {}", inspection.has_virtual_install);
            println!("  files: {}  bytes: {}", inspection.file_count, inspection.total_bytes);
            for (name, bytes) in &inspection.folder_totals {
                println!("    {name}: {bytes}");
            }
            if let Some(record) = &inspection.profile {
                println!(
                    "  profile: {} ({}, {} mods)",
                    record.profile_name, record.profile_id, record.mod_count
                );
            }
        }
    }

    inspection.validate()
}

#[derive(Serialize)]
struct RestoreOutput {
    files_restored: usize,
    profile_id: Option<String>,
    warnings: Vec<String>,
}

fn run_restore(global: &GlobalOptions, archive: &std::path::Path, purge: bool) -> Result<()> {
    let mut game = load_game(global)?;
    let request = RestoreRequest {
        game: &game,
        archive_path: archive.to_path_buf(),
        mode: if purge {
            RestoreMode::PurgeAndReplace
        } else {
            RestoreMode::Merge
        },
        staging_base: None,
    };
    let reporter = ProgressReporter::new(Some(progress_printer()), None);
    let outcome = restorer::restore(&request, &reporter)?;

    if let Some(record) = &outcome.profile {
        game.active_profile = record.profile_id.clone();
        game.save()?;
    }

    match global.format {
        OutputFormat::Json => {
            let output = RestoreOutput {
                files_restored: outcome.files_restored,
                profile_id: outcome.profile.as_ref().map(|r| r.profile_id.clone()),
                warnings: outcome.warnings,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Restored {} files", outcome.files_restored);
            if let Some(record) = &outcome.profile {
                println!("  profile: {} ({})", record.profile_name, record.profile_id);
            }
            for warning in &outcome.warnings {
                println!("  warning: {warning}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PurgeOutput {
    deleted: usize,
    reclaimed_bytes: u64,
    backup: Option<String>,
}

fn run_purge(global: &GlobalOptions, no_backup: bool) -> Result<()> {
    let config = AppConfig::load_or_create()?;
    let game = load_game(global)?;
    let overlay = Overlay::load(&game)?;
    let install_log = InstallLog::load(&game.install_log_path())?;
    let catalog = build_catalog(&game, overlay.as_ref(), &install_log, config.include_link_files)?;

    let options = PurgeOptions {
        backup_first: config.backup_before_purge && !no_backup,
        backup_dir: config.backup_dir.clone(),
    };
    let reporter = ProgressReporter::new(Some(progress_printer()), None);
    let report = purge::purge_loose(&game, &catalog, &options, &reporter)?;

    match global.format {
        OutputFormat::Json => {
            let output = PurgeOutput {
                deleted: report.deleted,
                reclaimed_bytes: report.reclaimed_bytes,
                backup: report.backup.as_ref().map(|path| path.display().to_string()),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!(
                "Purged {} loose files ({} bytes)",
                report.deleted, report.reclaimed_bytes
            );
            if let Some(backup) = &report.backup {
                println!("  backed up first to {}", backup.display());
            }
        }
    }
    Ok(())
}

fn run_paths(global: &GlobalOptions) -> Result<()> {
    let game_id = match &global.game {
        Some(id) => id.clone(),
        None => AppConfig::load_or_create()?.active_game,
    };
    let game = match &global.root {
        Some(root) => GameDescriptor::load_or_create_at(root, &game_id)?,
        None => GameDescriptor::load_or_create(&game_id)?,
    };
    println!("game:            {}", game.game_id);
    println!("data dir:        {}", game.data_dir.display());
    println!("install path:    {}", game.install_path.display());
    println!("plugin dir:      {}", game.plugin_dir.display());
    println!("mod dir:         {}", game.mod_dir.display());
    println!("mod cache:       {}", game.mod_cache_dir.display());
    println!("virtual install: {}", game.virtual_install_dir.display());
    match &game.link_dir {
        Some(link_dir) => println!("link dir:        {}", link_dir.display()),
        None => println!("link dir:        (not configured)"),
    }
    println!("profile store:   {}", game.profile_store().display());
    println!("backups:         {}", game.backups_dir().display());
    println!("install log:     {}", game.install_log_path().display());
    Ok(())
}

fn print_help() {
    println!("modvault - backup and restore engine for modded game installations");
    println!();
    println!("Usage: modvault <command> [options]");
    println!();
    println!("Commands:");
    println!("  create              Snapshot the managed installation into a zip backup");
    println!("  inspect <archive>   Report what a backup contains without extracting it");
    println!("  restore <archive>   Replay a backup onto the live installation");
    println!("  purge               Delete loose files (backs them up first by default)");
    println!("  paths               Print the directories configured for the active game");
    println!("  help, version");
    println!();
    println!("Options:");
    println!("  -g, --game <id>        Game to operate on (default: configured active game)");
    println!("      --root <dir>       Use <dir> instead of the per-user data directory");
    println!("  -f, --format <fmt>     Output format: text or json");
    println!("  -c, --categories <set> create: comma list of base,mods,link,loose,archives,cache");
    println!("  -o, --out <dir>        create: destination directory for the archive");
    println!("      --purge            restore: purge-and-replace instead of merge");
    println!("      --no-backup        purge: skip the safety backup");
    println!();
    println!("Exit codes: 0 ok, 2 validation, 3 space, 4 canceled, 5 partial failure");
}
