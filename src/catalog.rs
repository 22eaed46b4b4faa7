use crate::{
    error::EngineError,
    game::GameDescriptor,
    install_log::InstallLog,
    model::{archive_path, path_key, path_key_str, BackupCategory, BackupEntry},
    overlay::Overlay,
};
use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;
use walkdir::WalkDir;

/// Classifies every file under a game's managed directories into disjoint
/// backup categories. Pure planning: nothing here writes to the live tree.
///
/// A catalog is created empty, populated by one scan call per category, and
/// discarded at the end of the operation. Scanning a category twice without
/// `reset()` is an error; the silent alternative is duplicate entries and
/// inflated size totals.
#[derive(Debug, Default)]
pub struct BackupCatalog {
    entries: [Vec<BackupEntry>; 6],
    totals: [u64; 6],
    scanned: [bool; 6],
}

fn slot(category: BackupCategory) -> usize {
    BackupCategory::ALL
        .iter()
        .position(|&candidate| candidate == category)
        .unwrap_or(0)
}

impl BackupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn entries(&self, category: BackupCategory) -> &[BackupEntry] {
        &self.entries[slot(category)]
    }

    pub fn total(&self, category: BackupCategory) -> u64 {
        self.totals[slot(category)]
    }

    pub fn selected_total(&self, categories: &[BackupCategory]) -> u64 {
        categories
            .iter()
            .map(|&category| self.total(category))
            .sum()
    }

    pub fn selected_entries(&self, categories: &[BackupCategory]) -> Vec<&BackupEntry> {
        categories
            .iter()
            .flat_map(|&category| self.entries(category).iter())
            .collect()
    }

    fn mark_scanned(&mut self, category: BackupCategory) -> Result<()> {
        let index = slot(category);
        if self.scanned[index] {
            return Err(EngineError::CatalogReuse(category).into());
        }
        self.scanned[index] = true;
        Ok(())
    }

    fn is_scanned(&self, category: BackupCategory) -> bool {
        self.scanned[slot(category)]
    }

    fn push(&mut self, entry: BackupEntry) {
        let index = slot(entry.category);
        self.totals[index] += entry.size;
        self.entries[index].push(entry);
    }

    /// Base-game files: every manifest path that exists under the plugin
    /// dir, sized from disk.
    pub fn scan_base_game(&mut self, game: &GameDescriptor) -> Result<()> {
        self.mark_scanned(BackupCategory::BaseGame)?;
        for rel in &game.base_file_manifest {
            let real_path = game.plugin_dir.join(rel);
            let meta = match fs::metadata(&real_path) {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            self.push(BackupEntry::new(
                rel.replace('\\', "/"),
                real_path,
                None,
                BackupCategory::BaseGame,
                meta.len(),
            ));
        }
        Ok(())
    }

    /// Installed-mod files. Overlay mode enumerates the link table, the
    /// overlay config and the `_overwrites` subtree; legacy mode locates
    /// each install-log file under the live plugin dir. Multi-drive link
    /// installs additionally contribute the link-folder tree.
    pub fn scan_installed_mods(
        &mut self,
        game: &GameDescriptor,
        overlay: Option<&Overlay>,
        install_log: &InstallLog,
    ) -> Result<()> {
        self.mark_scanned(BackupCategory::InstalledMod)?;
        self.mark_scanned(BackupCategory::LinkedInstall)?;

        match overlay {
            Some(overlay) => {
                for link in overlay.links() {
                    let meta = match fs::metadata(&link.real_path) {
                        Ok(meta) if meta.is_file() => meta,
                        _ => {
                            warn!(path = ?link.real_path, "overlay link target missing, skipping");
                            continue;
                        }
                    };
                    self.push(BackupEntry::new(
                        link.virtual_path.replace('\\', "/"),
                        link.real_path,
                        Some(link.owner_id),
                        BackupCategory::InstalledMod,
                        meta.len(),
                    ));
                }

                if overlay.config_path.is_file() {
                    let size = fs::metadata(&overlay.config_path)
                        .context("stat overlay config")?
                        .len();
                    self.push(BackupEntry::new(
                        "VirtualModConfig.xml",
                        overlay.config_path.clone(),
                        None,
                        BackupCategory::InstalledMod,
                        size,
                    ));
                }

                let overwrites = overlay.overwrites_dir();
                if overwrites.is_dir() {
                    self.scan_tree(&overwrites, BackupCategory::InstalledMod, None, |rel| {
                        format!("_overwrites/{}", archive_path(rel))
                    });
                }
            }
            None => {
                for logged in install_log.active_mods() {
                    for rel in &logged.files {
                        let real_path = game.plugin_dir.join(rel);
                        let meta = match fs::metadata(&real_path) {
                            Ok(meta) if meta.is_file() => meta,
                            _ => continue,
                        };
                        self.push(BackupEntry::new(
                            rel.replace('\\', "/"),
                            real_path,
                            Some(logged.id.clone()),
                            BackupCategory::InstalledMod,
                            meta.len(),
                        ));
                    }
                }
            }
        }

        if game.multi_drive() {
            if let Some(link_dir) = &game.link_dir {
                if link_dir.is_dir() {
                    self.scan_tree(link_dir, BackupCategory::LinkedInstall, None, |rel| {
                        archive_path(rel)
                    });
                }
            }
        }

        Ok(())
    }

    /// Loose files: everything under the plugin dir that is neither a
    /// base-game file (by real path) nor an installed-mod file (by virtual
    /// path). Scans the other two categories first when needed.
    pub fn scan_loose_files(
        &mut self,
        game: &GameDescriptor,
        overlay: Option<&Overlay>,
        install_log: &InstallLog,
        include_link_files: bool,
    ) -> Result<()> {
        if !self.is_scanned(BackupCategory::BaseGame) {
            self.scan_base_game(game)?;
        }
        if !self.is_scanned(BackupCategory::InstalledMod) {
            self.scan_installed_mods(game, overlay, install_log)?;
        }
        self.mark_scanned(BackupCategory::LooseFile)?;

        let base_set: HashSet<String> = self
            .entries(BackupCategory::BaseGame)
            .iter()
            .map(|entry| path_key(&entry.real_path))
            .collect();
        let installed_set: HashSet<String> = self
            .entries(BackupCategory::InstalledMod)
            .iter()
            .map(|entry| path_key_str(&entry.virtual_path))
            .collect();

        if !game.plugin_dir.is_dir() {
            return Ok(());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&game.plugin_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_ignored_path(entry.path()))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable directory branch: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !include_link_files && is_link_marker(entry.path(), entry.path_is_symlink()) {
                continue;
            }
            if base_set.contains(&path_key(entry.path())) {
                continue;
            }
            let rel = match entry.path().strip_prefix(&game.plugin_dir) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if installed_set.contains(&path_key(&rel)) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!(path = ?entry.path(), "stat failed, skipping: {err}");
                    continue;
                }
            };
            found.push(BackupEntry::new(
                archive_path(&rel),
                entry.path().to_path_buf(),
                None,
                BackupCategory::LooseFile,
                size,
            ));
        }
        for entry in found {
            self.push(entry);
        }
        Ok(())
    }

    /// Mod source archives under the mod directory (managed subtrees
    /// excluded), plus the entire mod cache tree.
    pub fn scan_mod_archives(&mut self, game: &GameDescriptor) -> Result<()> {
        self.mark_scanned(BackupCategory::ModArchive)?;
        self.mark_scanned(BackupCategory::ModCache)?;

        let excluded = game.managed_subtrees();
        if game.mod_dir.is_dir() {
            let mod_dir = game.mod_dir.clone();
            for entry in WalkDir::new(&mod_dir)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| {
                    !is_ignored_path(entry.path())
                        && !excluded.iter().any(|subtree| entry.path() == subtree)
                })
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("skipping unreadable directory branch: {err}");
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !is_archive_file(entry.path()) {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&mod_dir) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => continue,
                };
                let size = match entry.metadata() {
                    Ok(meta) => meta.len(),
                    Err(_) => continue,
                };
                self.push(BackupEntry::new(
                    archive_path(&rel),
                    entry.path().to_path_buf(),
                    None,
                    BackupCategory::ModArchive,
                    size,
                ));
            }
        }

        if game.mod_cache_dir.is_dir() {
            let cache_dir = game.mod_cache_dir.clone();
            self.scan_tree(&cache_dir, BackupCategory::ModCache, None, |rel| {
                archive_path(rel)
            });
        }

        Ok(())
    }

    fn scan_tree(
        &mut self,
        root: &Path,
        category: BackupCategory,
        owner_id: Option<String>,
        virtual_path_for: impl Fn(&Path) -> String,
    ) {
        let mut found = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_ignored_path(entry.path()))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable directory branch: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel: PathBuf = match entry.path().strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!(path = ?entry.path(), "stat failed, skipping: {err}");
                    continue;
                }
            };
            found.push(BackupEntry::new(
                virtual_path_for(&rel),
                entry.path().to_path_buf(),
                owner_id.clone(),
                category,
                size,
            ));
        }
        for entry in found {
            self.push(entry);
        }
    }
}

pub fn is_archive_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).unwrap_or(""),
        "zip" | "ZIP" | "7z" | "7Z" | "rar" | "RAR"
    )
}

/// Windows shortcut files and symlinks are link markers: they point at
/// content rather than being it, and are only backed up on request.
fn is_link_marker(path: &Path, is_symlink: bool) -> bool {
    if is_symlink {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("lnk"))
        .unwrap_or(false)
}

pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
            || part == ".vscode"
    })
}
