use crate::{
    catalog::BackupCatalog,
    error::EngineError,
    game::GameDescriptor,
    model::{self, BackupCategory},
    profile::{ProfileManager, ProfileRecord, ProfileSnapshot},
    progress::{Phase, ProgressReporter},
};
use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};
use time::macros::format_description;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Staged paths longer than this hit the legacy Windows MAX_PATH ceiling
/// once the OS appends a filename buffer; staging relocates below it.
const MAX_STAGED_PATH: usize = 248;

const FALLBACK_STAGING_NAME: &str = "NMMTemp";

pub struct BackupRequest<'a> {
    pub game: &'a GameDescriptor,
    pub catalog: &'a BackupCatalog,
    pub categories: Vec<BackupCategory>,
    pub destination_dir: PathBuf,
    pub profile_name: String,
    pub snapshot: ProfileSnapshot,
    /// Base directory for the staging mirror; the system temp dir if unset.
    pub staging_base: Option<PathBuf>,
    /// Where staging relocates when a staged path exceeds the path-length
    /// ceiling; `<drive root>/NMMTemp` if unset.
    pub fallback_staging_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BackupReport {
    pub archive_path: PathBuf,
    pub profile_id: String,
    pub file_count: usize,
    pub total_bytes: u64,
    pub warnings: Vec<String>,
}

/// Stages the selected categories into a mirror tree, appends the profile
/// snapshot and install log, and compresses the lot into one zip at the
/// destination. The staging root is deleted on success and failure alike.
pub fn create_backup(request: &BackupRequest, reporter: &ProgressReporter) -> Result<BackupReport> {
    reporter.report(Phase::Preflight, 0, 1, None);

    let needed = request.catalog.selected_total(&request.categories);
    let staging_base = request
        .staging_base
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    ensure_free_space(&staging_base, needed)?;

    let mut warnings = Vec::new();
    let staging_root = resolve_staging_root(request, &staging_base, &mut warnings)?;

    fs::create_dir_all(&staging_root).context("create staging root")?;
    let result = build_and_compress(request, reporter, &staging_root, &mut warnings);
    reporter.report(Phase::Cleanup, 0, 1, None);
    if let Err(err) = fs::remove_dir_all(&staging_root) {
        warn!(path = ?staging_root, "could not remove staging root: {err}");
    }
    result.map(|(archive_path, profile_id, file_count)| BackupReport {
        archive_path,
        profile_id,
        file_count,
        total_bytes: needed,
        warnings,
    })
}

fn build_and_compress(
    request: &BackupRequest,
    reporter: &ProgressReporter,
    staging_root: &Path,
    warnings: &mut Vec<String>,
) -> Result<(PathBuf, String, usize)> {
    let plugin_dir_name = request.game.plugin_dir_name();
    let entries = request.catalog.selected_entries(&request.categories);
    let total = entries.len();

    for (index, entry) in entries.iter().enumerate() {
        if reporter.is_canceled() {
            return Err(EngineError::Canceled.into());
        }
        let staged = staging_root
            .join(entry.category.archive_dir(&plugin_dir_name))
            .join(entry.staged_rel_path());
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).context("create staging dir")?;
        }
        match fs::copy(&entry.real_path, &staged) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Removed between scan and copy; the backup proceeds without it.
                debug!(path = ?entry.real_path, "source vanished before copy");
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("copy {:?} into staging", entry.real_path));
            }
        }
        reporter.report(
            Phase::Staging,
            index + 1,
            total,
            Some(entry.virtual_path.clone()),
        );
    }

    reporter.report(Phase::Profile, 0, 1, None);
    let profile_id = write_profile_snapshot(request, staging_root, warnings)?;

    let live_log = request.game.install_log_path();
    if live_log.is_file() {
        fs::copy(&live_log, staging_root.join(model::INSTALL_LOG_NAME))
            .context("copy install log into staging")?;
    }

    if reporter.is_canceled() {
        return Err(EngineError::Canceled.into());
    }

    fs::create_dir_all(&request.destination_dir).context("create destination dir")?;
    let archive_path = request
        .destination_dir
        .join(archive_file_name(&request.game.game_id)?);
    let file_count = match compress_staging(staging_root, &archive_path, reporter) {
        Ok(count) => count,
        Err(err) => {
            let _ = fs::remove_file(&archive_path);
            return Err(err);
        }
    };

    Ok((archive_path, profile_id, file_count))
}

fn write_profile_snapshot(
    request: &BackupRequest,
    staging_root: &Path,
    warnings: &mut Vec<String>,
) -> Result<String> {
    let profiles = ProfileManager::new(request.game.profile_store());
    let profile_id = profiles.allocate_profile_id(&request.profile_name);
    let record = ProfileRecord {
        profile_id: profile_id.clone(),
        profile_name: request.profile_name.clone(),
        game_mode_id: request.game.game_id.clone(),
        mod_count: installed_mod_count(request.catalog),
    };
    let profile_dir = staging_root.join(model::PROFILE_DIR).join(&profile_id);
    profiles.write_snapshot(&profile_dir, &record, &request.snapshot)?;

    if !request.game.active_profile.is_empty() {
        match profiles.copy_scripted_logs(&request.game.active_profile, &profile_dir) {
            Ok(_) => {}
            Err(err) => warnings.push(format!("scripted install logs not copied: {err}")),
        }
    }
    Ok(profile_id)
}

fn installed_mod_count(catalog: &BackupCatalog) -> u32 {
    let owners: HashSet<&str> = catalog
        .entries(BackupCategory::InstalledMod)
        .iter()
        .filter_map(|entry| entry.owner_id.as_deref())
        .collect();
    owners.len() as u32
}

fn compress_staging(
    staging_root: &Path,
    archive_path: &Path,
    reporter: &ProgressReporter,
) -> Result<usize> {
    let mut files = Vec::new();
    for entry in WalkDir::new(staging_root).follow_links(false) {
        let entry = entry.context("walk staging tree")?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();

    let out = fs::File::create(archive_path).context("create backup archive")?;
    let mut zip = zip::ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let total = files.len();
    for (index, path) in files.iter().enumerate() {
        if reporter.is_canceled() {
            return Err(EngineError::Canceled.into());
        }
        let rel = path.strip_prefix(staging_root).context("staging rel path")?;
        let name = model::archive_path(rel);
        zip.start_file(name.clone(), options).context("start zip entry")?;
        let mut source = fs::File::open(path).context("open staged file")?;
        io::copy(&mut source, &mut zip).context("write zip entry")?;
        reporter.report(Phase::Compressing, index + 1, total, Some(name));
    }
    zip.finish().context("finalize archive")?.flush().ok();
    Ok(total)
}

/// `<gameId>_NMM_BACKUP_<sortable timestamp>.zip`
fn archive_file_name(game_id: &str) -> Result<String> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    let stamp = time::OffsetDateTime::now_utc()
        .format(&format)
        .context("format backup timestamp")?;
    Ok(format!("{game_id}_NMM_BACKUP_{stamp}.zip"))
}

/// Default staging lives under the temp dir; when any staged path would
/// exceed the path-length ceiling the whole staging root moves to a short
/// directory at the drive root instead of letting deep copies fail.
fn resolve_staging_root(
    request: &BackupRequest,
    staging_base: &Path,
    warnings: &mut Vec<String>,
) -> Result<PathBuf> {
    let leaf = staging_leaf_name(&request.game.game_id)?;
    let staging_root = staging_base.join(&leaf);

    let plugin_dir_name = request.game.plugin_dir_name();
    let longest = request
        .catalog
        .selected_entries(&request.categories)
        .iter()
        .map(|entry| {
            staging_root
                .join(entry.category.archive_dir(&plugin_dir_name))
                .join(entry.staged_rel_path())
                .as_os_str()
                .len()
        })
        .max()
        .unwrap_or(0);

    if longest <= MAX_STAGED_PATH {
        return Ok(staging_root);
    }

    let fallback_root = request
        .fallback_staging_root
        .clone()
        .unwrap_or_else(|| drive_root(staging_base).join(FALLBACK_STAGING_NAME));
    let relocated = fallback_root.join(&leaf);
    warnings.push(format!(
        "staged path length {longest} exceeds {MAX_STAGED_PATH}; staging relocated to {}",
        relocated.display()
    ));
    warn!(path = ?relocated, "staging relocated to avoid path-length limit");
    Ok(relocated)
}

fn staging_leaf_name(game_id: &str) -> Result<String> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    let stamp = time::OffsetDateTime::now_utc()
        .format(&format)
        .context("format staging timestamp")?;
    Ok(format!("{game_id}_stage_{stamp}_{}", std::process::id()))
}

fn drive_root(path: &Path) -> PathBuf {
    let root: PathBuf = path
        .components()
        .take_while(|component| matches!(component, Component::Prefix(_) | Component::RootDir))
        .collect();
    if root.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        root
    }
}

/// Preflight: refuse to start a backup the staging drive cannot hold.
fn ensure_free_space(path: &Path, needed: u64) -> Result<()> {
    let Some(available) = available_space_for(path) else {
        debug!(path = ?path, "no disk match for staging path, skipping space check");
        return Ok(());
    };
    if available < needed {
        return Err(EngineError::InsufficientSpace { needed, available }.into());
    }
    Ok(())
}

fn available_space_for(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(seen, _)| depth > seen).unwrap_or(true) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, space)| space)
}
