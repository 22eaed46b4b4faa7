use crate::{
    archiver::{self, BackupRequest},
    catalog::BackupCatalog,
    error::EngineError,
    game::GameDescriptor,
    model::BackupCategory,
    profile::ProfileSnapshot,
    progress::{Phase, ProgressReporter},
};
use anyhow::{Context, Result};
use std::{fs, path::{Path, PathBuf}};
use tracing::warn;

pub struct PurgeOptions {
    /// Archive the loose files before deleting them.
    pub backup_first: bool,
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct PurgeReport {
    pub deleted: usize,
    pub reclaimed_bytes: u64,
    pub backup: Option<PathBuf>,
}

/// Deletes every loose file the catalog found, meaning files under the
/// plugin dir the manager cannot attribute to the base game or an installed
/// mod, and prunes the directories that empty out. By default the loose
/// category is backed up first, so a purge is always reversible.
pub fn purge_loose(
    game: &GameDescriptor,
    catalog: &BackupCatalog,
    options: &PurgeOptions,
    reporter: &ProgressReporter,
) -> Result<PurgeReport> {
    let entries = catalog.entries(BackupCategory::LooseFile);
    let mut backup = None;

    if options.backup_first && !entries.is_empty() {
        let destination_dir = options
            .backup_dir
            .clone()
            .unwrap_or_else(|| game.backups_dir());
        let profile_name = if game.active_profile.is_empty() {
            "Default".to_string()
        } else {
            game.active_profile.clone()
        };
        let request = BackupRequest {
            game,
            catalog,
            categories: vec![BackupCategory::LooseFile],
            destination_dir,
            profile_name,
            snapshot: ProfileSnapshot::default(),
            staging_base: None,
            fallback_staging_root: None,
        };
        let report = archiver::create_backup(&request, reporter)
            .context("back up loose files before purge")?;
        backup = Some(report.archive_path);
    }

    let total = entries.len();
    let mut deleted = 0usize;
    let mut reclaimed_bytes = 0u64;
    for (index, entry) in entries.iter().enumerate() {
        if reporter.is_canceled() {
            return Err(EngineError::Canceled.into());
        }
        match fs::remove_file(&entry.real_path) {
            Ok(()) => {
                deleted += 1;
                reclaimed_bytes += entry.size;
                prune_empty_dirs(&entry.real_path, &game.plugin_dir);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = ?entry.real_path, "could not purge file: {err}");
            }
        }
        reporter.report(
            Phase::Purging,
            index + 1,
            total,
            Some(entry.virtual_path.clone()),
        );
    }

    Ok(PurgeReport {
        deleted,
        reclaimed_bytes,
        backup,
    })
}

/// Walks back up from a deleted file removing directories as they empty,
/// stopping at the plugin dir itself.
fn prune_empty_dirs(file: &Path, stop: &Path) {
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
