use crate::{
    error::EngineError,
    game::GameDescriptor,
    install_log::InstallLog,
    model,
    profile::{self, ProfileManager, ProfileRecord},
    progress::{Phase, ProgressReporter},
};
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{debug, warn};
use walkdir::WalkDir;

const OLD_SUFFIX: &str = "_oldbkp";
const DELETE_SUFFIX: &str = "_DELETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Merge,
    PurgeAndReplace,
}

/// What a backup archive looks like from the outside: entry names and sizes
/// only, nothing extracted, no live state touched.
#[derive(Debug)]
pub struct BackupInspection {
    pub archive_path: PathBuf,
    pub has_plugin_folder: bool,
    pub has_virtual_install: bool,
    pub folder_totals: Vec<(String, u64)>,
    pub total_bytes: u64,
    pub file_count: usize,
    pub profile: Option<ProfileRecord>,
}

impl BackupInspection {
    pub fn validate(&self) -> Result<()> {
        if !self.has_plugin_folder {
            return Err(EngineError::ArchiveValidation(
                "archive has no plugin-directory folder".to_string(),
            )
            .into());
        }
        if !self.has_virtual_install {
            return Err(EngineError::ArchiveValidation(format!(
                "archive has no {} folder",
                model::VIRTUAL_INSTALL_DIR
            ))
            .into());
        }
        Ok(())
    }
}

pub struct RestoreRequest<'a> {
    pub game: &'a GameDescriptor,
    pub archive_path: PathBuf,
    pub mode: RestoreMode,
    pub staging_base: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub profile: Option<ProfileRecord>,
    pub files_restored: usize,
    pub warnings: Vec<String>,
}

/// Light pre-check: scans entry names, sums per-folder sizes and reads the
/// embedded profile record in memory. Rejects archives built for another
/// game; folder presence is reported as flags and enforced by `validate`.
pub fn inspect(archive_path: &Path, game: &GameDescriptor) -> Result<BackupInspection> {
    let file = fs::File::open(archive_path).context("open backup archive")?;
    let mut archive = zip::ZipArchive::new(file).context("read backup archive")?;

    let plugin_dir_name = game.plugin_dir_name();
    let mut totals: HashMap<String, u64> = HashMap::new();
    let mut file_count = 0usize;
    let mut profile_entry: Option<String> = None;

    for index in 0..archive.len() {
        let entry = archive.by_index(index).context("read zip entry")?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        file_count += 1;
        if let Some(top) = rel.components().next() {
            let top = top.as_os_str().to_string_lossy().to_string();
            *totals.entry(top).or_insert(0) += entry.size();
        }
        if profile_entry.is_none() && is_profile_record_path(&rel) {
            profile_entry = Some(entry.name().to_string());
        }
    }

    let profile = match profile_entry {
        Some(name) => {
            let mut entry = archive.by_name(&name).context("read profile record")?;
            let mut raw = String::new();
            io::Read::read_to_string(&mut entry, &mut raw).context("read profile.xml")?;
            Some(profile::parse_record(&raw))
        }
        None => None,
    };

    if let Some(record) = &profile {
        if !record.game_mode_id.is_empty() && record.game_mode_id != game.game_id {
            return Err(EngineError::ArchiveValidation(format!(
                "archive was created for game {:?}, not {:?}",
                record.game_mode_id, game.game_id
            ))
            .into());
        }
    }

    let mut folder_totals: Vec<(String, u64)> = totals.into_iter().collect();
    folder_totals.sort();
    let total_bytes = folder_totals.iter().map(|(_, bytes)| bytes).sum();
    Ok(BackupInspection {
        archive_path: archive_path.to_path_buf(),
        has_plugin_folder: folder_totals
            .iter()
            .any(|(name, _)| name == &plugin_dir_name),
        has_virtual_install: folder_totals
            .iter()
            .any(|(name, _)| name == model::VIRTUAL_INSTALL_DIR),
        folder_totals,
        total_bytes,
        file_count,
        profile,
    })
}

fn is_profile_record_path(rel: &Path) -> bool {
    let mut components = rel.components();
    let first = components.next().map(|c| c.as_os_str().to_string_lossy().to_string());
    let second = components.next();
    let third = components.next().map(|c| c.as_os_str().to_string_lossy().to_string());
    first.as_deref() == Some(model::PROFILE_DIR)
        && second.is_some()
        && third.as_deref() == Some(profile::PROFILE_FILE)
        && components.next().is_none()
}

/// Replays a backup archive onto the live file system. Merge overwrites in
/// place and leaves unrelated live files alone; purge-and-replace swaps the
/// category directories wholesale and rolls the swap back if anything fails
/// mid-copy, so the live tree is only ever pre-restore or fully restored.
pub fn restore(request: &RestoreRequest, reporter: &ProgressReporter) -> Result<RestoreOutcome> {
    reporter.report(Phase::Validating, 0, 1, None);
    let inspection = inspect(&request.archive_path, request.game)?;
    inspection.validate()?;

    let staging_base = request
        .staging_base
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let staging_root = staging_base.join(format!(
        "{}_restore_{}",
        request.game.game_id,
        std::process::id()
    ));
    fs::create_dir_all(&staging_root).context("create restore staging root")?;

    let result = restore_from_staging(request, reporter, &staging_root);
    reporter.report(Phase::Cleanup, 0, 1, None);
    if let Err(err) = fs::remove_dir_all(&staging_root) {
        warn!(path = ?staging_root, "could not remove restore staging: {err}");
    }
    result
}

fn restore_from_staging(
    request: &RestoreRequest,
    reporter: &ProgressReporter,
    staging_root: &Path,
) -> Result<RestoreOutcome> {
    extract_archive(&request.archive_path, staging_root, reporter)?;

    let mut warnings = Vec::new();
    let targets = replay_targets(request.game, staging_root, &mut warnings);

    let (files_restored, failed) = match request.mode {
        RestoreMode::Merge => replay_merge(&targets, reporter)?,
        RestoreMode::PurgeAndReplace => {
            let restored = replay_purge(&targets, reporter)?;
            (restored, 0)
        }
    };

    let profile = reconstruct_profile(request.game, staging_root, &mut warnings)?;

    let staged_log = staging_root.join(model::INSTALL_LOG_NAME);
    if staged_log.is_file() {
        let mut live_log = InstallLog::load(&request.game.install_log_path())?;
        live_log
            .replace_with(&staged_log)
            .context("replace install log from backup")?;
    }

    if failed > 0 {
        return Err(EngineError::PartialFailure {
            failed,
            total: files_restored + failed,
        }
        .into());
    }

    Ok(RestoreOutcome {
        profile,
        files_restored,
        warnings,
    })
}

struct ReplayTarget {
    staged: PathBuf,
    live: PathBuf,
    files: Vec<PathBuf>,
}

/// Maps extracted top-level folders back to live directories, the same
/// correspondence the catalog uses in the other direction.
fn replay_targets(
    game: &GameDescriptor,
    staging_root: &Path,
    warnings: &mut Vec<String>,
) -> Vec<ReplayTarget> {
    let mut pairs: Vec<(String, PathBuf)> = vec![
        (game.plugin_dir_name(), game.plugin_dir.clone()),
        (
            model::VIRTUAL_INSTALL_DIR.to_string(),
            game.virtual_install_dir.clone(),
        ),
        (model::MODS_DIR.to_string(), game.mod_dir.clone()),
        (model::CACHE_DIR.to_string(), game.mod_cache_dir.clone()),
    ];
    match &game.link_dir {
        Some(link_dir) if !link_dir.as_os_str().is_empty() => {
            pairs.push((model::LINK_DIR.to_string(), link_dir.clone()));
        }
        _ => {
            if staging_root.join(model::LINK_DIR).is_dir() {
                warnings.push(format!(
                    "archive contains a {} folder but no link directory is configured; skipped",
                    model::LINK_DIR
                ));
            }
        }
    }

    let mut targets = Vec::new();
    for (archive_dir, live) in pairs {
        let staged = staging_root.join(&archive_dir);
        if !staged.is_dir() {
            continue;
        }
        if live.as_os_str().is_empty() {
            warnings.push(format!(
                "no live directory configured for {archive_dir:?}; skipped"
            ));
            continue;
        }
        let files = staged_files(&staged);
        targets.push(ReplayTarget {
            staged,
            live,
            files,
        });
    }
    // Parents before children so directory swaps nest correctly.
    targets.sort_by_key(|target| target.live.components().count());
    targets
}

fn staged_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("walk extracted tree: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    files
}

/// Best-effort merge: every extracted file is copied over its live
/// counterpart; per-file errors are counted, not fatal.
fn replay_merge(targets: &[ReplayTarget], reporter: &ProgressReporter) -> Result<(usize, usize)> {
    let total: usize = targets.iter().map(|target| target.files.len()).sum();
    let mut copied = 0usize;
    let mut failed = 0usize;
    let mut index = 0usize;

    for target in targets {
        for rel in &target.files {
            if reporter.is_canceled() {
                return Err(EngineError::Canceled.into());
            }
            index += 1;
            let source = target.staged.join(rel);
            let dest = target.live.join(rel);
            let outcome = dest
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::copy(&source, &dest).map(|_| ()));
            match outcome {
                Ok(()) => copied += 1,
                Err(err) => {
                    warn!(path = ?dest, "restore copy failed: {err}");
                    failed += 1;
                }
            }
            reporter.report(
                Phase::Replaying,
                index,
                total,
                Some(rel.to_string_lossy().to_string()),
            );
        }
    }
    Ok((copied, failed))
}

/// Destructive replace with the two-phase directory swap. Any failure in
/// the copy phase, cancellation included, takes the single rollback path.
fn replay_purge(targets: &[ReplayTarget], reporter: &ProgressReporter) -> Result<usize> {
    let live_dirs: Vec<PathBuf> = targets.iter().map(|target| target.live.clone()).collect();
    let mut swap = DirectorySwap::new(&live_dirs);
    swap.swap()?;

    let total: usize = targets.iter().map(|target| target.files.len()).sum();
    let mut index = 0usize;
    let copy_result = (|| -> Result<()> {
        for target in targets {
            for rel in &target.files {
                if reporter.is_canceled() {
                    return Err(EngineError::Canceled.into());
                }
                index += 1;
                let source = target.staged.join(rel);
                let dest = target.live.join(rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory for {dest:?}"))?;
                }
                fs::copy(&source, &dest).with_context(|| format!("restore {dest:?}"))?;
                reporter.report(
                    Phase::Replaying,
                    index,
                    total,
                    Some(rel.to_string_lossy().to_string()),
                );
            }
        }
        Ok(())
    })();

    match copy_result {
        Ok(()) => {
            swap.commit()?;
            Ok(total)
        }
        Err(err) => {
            if let Err(rollback_err) = swap.rollback() {
                warn!("rollback after failed restore also failed: {rollback_err}");
            }
            Err(err)
        }
    }
}

fn reconstruct_profile(
    game: &GameDescriptor,
    staging_root: &Path,
    warnings: &mut Vec<String>,
) -> Result<Option<ProfileRecord>> {
    let profile_root = staging_root.join(model::PROFILE_DIR);
    if !profile_root.is_dir() {
        warnings.push("archive carries no profile snapshot".to_string());
        return Ok(None);
    }

    let mut subdirs: Vec<PathBuf> = fs::read_dir(&profile_root)
        .context("read extracted PROFILE dir")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    let Some(extracted_dir) = subdirs.into_iter().next() else {
        warnings.push("profile snapshot folder is empty".to_string());
        return Ok(None);
    };

    let mut record = match fs::read_to_string(extracted_dir.join(profile::PROFILE_FILE)) {
        Ok(raw) => profile::parse_record(&raw),
        Err(_) => ProfileRecord::default(),
    };
    if record.profile_id.is_empty() {
        record.profile_id = extracted_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "restored".to_string());
    }
    if record.game_mode_id.is_empty() {
        record.game_mode_id = game.game_id.clone();
    }

    let profiles = ProfileManager::new(game.profile_store());
    let registered = profiles.register(&extracted_dir, &record)?;
    Ok(Some(registered))
}

fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    reporter: &ProgressReporter,
) -> Result<usize> {
    let file = fs::File::open(archive_path).context("open backup archive")?;
    let mut archive = zip::ZipArchive::new(file).context("read backup archive")?;

    let total = archive.len();
    for index in 0..total {
        if reporter.is_canceled() {
            return Err(EngineError::Canceled.into());
        }
        let mut entry = archive.by_index(index).context("zip entry")?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).context("create extracted dir")?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create extracted dir")?;
        }
        let mut out_file = fs::File::create(&out_path).context("write extracted entry")?;
        io::copy(&mut entry, &mut out_file).context("extract entry")?;
        if let Some(dt) = entry.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
            }
        }
        reporter.report(
            Phase::Extracting,
            index + 1,
            total,
            Some(entry.name().to_string()),
        );
    }
    Ok(total)
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapState {
    Staged,
    Swapped,
    Committed,
}

struct SwapPair {
    live: PathBuf,
    aside: PathBuf,
    existed: bool,
    swapped: bool,
}

/// Rename-based two-phase replace for a set of live directories.
///
/// `swap` moves each live directory to a `_oldbkp` sibling and creates a
/// fresh one in its place; `commit` deletes the `_oldbkp` copies; `rollback`
/// removes whatever was written into the fresh directories (via a `_DELETE`
/// rename) and puts the originals back. Valid from any failure point after
/// `swap`: the live tree ends up exactly as it started.
pub struct DirectorySwap {
    pairs: Vec<SwapPair>,
    state: SwapState,
}

impl DirectorySwap {
    pub fn new(dirs: &[PathBuf]) -> Self {
        let mut deduped: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            if !deduped.contains(dir) {
                deduped.push(dir.clone());
            }
        }
        Self {
            pairs: deduped
                .into_iter()
                .map(|live| SwapPair {
                    aside: sibling(&live, OLD_SUFFIX),
                    live,
                    existed: false,
                    swapped: false,
                })
                .collect(),
            state: SwapState::Staged,
        }
    }

    pub fn swap(&mut self) -> Result<()> {
        for index in 0..self.pairs.len() {
            let step = {
                let pair = &mut self.pairs[index];
                clean_leftovers(&pair.live);
                let mut step = || -> Result<()> {
                    if pair.live.exists() {
                        fs::rename(&pair.live, &pair.aside)
                            .with_context(|| format!("set aside {:?}", pair.live))?;
                        pair.existed = true;
                    }
                    fs::create_dir_all(&pair.live)
                        .with_context(|| format!("create fresh {:?}", pair.live))?;
                    pair.swapped = true;
                    Ok(())
                };
                step()
            };
            if let Err(err) = step {
                self.state = SwapState::Swapped;
                let _ = self.rollback_in_place();
                return Err(err);
            }
        }
        self.state = SwapState::Swapped;
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        if self.state != SwapState::Swapped {
            return Ok(());
        }
        for pair in &self.pairs {
            if pair.aside.exists() {
                fs::remove_dir_all(&pair.aside)
                    .with_context(|| format!("remove {:?}", pair.aside))?;
            }
        }
        self.state = SwapState::Committed;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<()> {
        if self.state != SwapState::Swapped {
            return Ok(());
        }
        // Children before parents: undo in reverse swap order.
        for pair in self.pairs.iter_mut().rev() {
            if !pair.swapped {
                continue;
            }
            if pair.live.exists() {
                let doomed = sibling(&pair.live, DELETE_SUFFIX);
                match fs::rename(&pair.live, &doomed) {
                    Ok(()) => {
                        if let Err(err) = fs::remove_dir_all(&doomed) {
                            warn!(path = ?doomed, "could not delete partial restore: {err}");
                        }
                    }
                    Err(err) => {
                        warn!(path = ?pair.live, "could not set aside partial restore: {err}");
                        let _ = fs::remove_dir_all(&pair.live);
                    }
                }
            }
            if pair.existed {
                fs::rename(&pair.aside, &pair.live)
                    .with_context(|| format!("restore original {:?}", pair.live))?;
            }
            pair.swapped = false;
        }
        self.state = SwapState::Staged;
        Ok(())
    }
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "dir".to_string());
    dir.with_file_name(format!("{name}{suffix}"))
}

/// Stale `_oldbkp`/`_DELETE` siblings from an interrupted earlier run are
/// swept before a new swap claims the same names.
fn clean_leftovers(live: &Path) {
    for suffix in [OLD_SUFFIX, DELETE_SUFFIX] {
        let leftover = sibling(live, suffix);
        if leftover.exists() {
            debug!(path = ?leftover, "removing stale swap leftover");
            let _ = fs::remove_dir_all(&leftover);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn swap_commit_replaces_directory() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("Data");
        write(&live.join("old.txt"), "old");

        let mut swap = DirectorySwap::new(&[live.clone()]);
        swap.swap().unwrap();
        assert!(live.join("old.txt").exists() == false);
        write(&live.join("new.txt"), "new");
        swap.commit().unwrap();

        assert!(live.join("new.txt").exists());
        assert!(!sibling(&live, OLD_SUFFIX).exists());
    }

    #[test]
    fn rollback_restores_original_tree() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("Data");
        write(&live.join("keep/original.txt"), "original");

        let mut swap = DirectorySwap::new(&[live.clone()]);
        swap.swap().unwrap();
        write(&live.join("partial.txt"), "partial");
        swap.rollback().unwrap();

        assert_eq!(
            fs::read_to_string(live.join("keep/original.txt")).unwrap(),
            "original"
        );
        assert!(!live.join("partial.txt").exists());
        assert!(!sibling(&live, OLD_SUFFIX).exists());
        assert!(!sibling(&live, DELETE_SUFFIX).exists());
    }

    #[test]
    fn rollback_handles_directory_that_did_not_exist() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("NMMLINK");

        let mut swap = DirectorySwap::new(&[live.clone()]);
        swap.swap().unwrap();
        write(&live.join("file.txt"), "x");
        swap.rollback().unwrap();

        assert!(!live.exists());
    }

    #[test]
    fn nested_targets_swap_and_roll_back() {
        let temp = tempfile::tempdir().unwrap();
        let mods = temp.path().join("mods");
        let cache = mods.join("cache");
        write(&mods.join("a.zip"), "a");
        write(&cache.join("c.txt"), "c");

        let mut swap = DirectorySwap::new(&[mods.clone(), cache.clone()]);
        swap.swap().unwrap();
        write(&mods.join("b.zip"), "b");
        swap.rollback().unwrap();

        assert!(mods.join("a.zip").exists());
        assert!(cache.join("c.txt").exists());
        assert!(!mods.join("b.zip").exists());
    }
}
