use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const VIRTUAL_INSTALL_DIR: &str = "VIRTUAL INSTALL";
pub const LINK_DIR: &str = "NMMLINK";
pub const MODS_DIR: &str = "MODS";
pub const CACHE_DIR: &str = "cache";
pub const PROFILE_DIR: &str = "PROFILE";
pub const INSTALL_LOG_NAME: &str = "InstallLog.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCategory {
    BaseGame,
    InstalledMod,
    LinkedInstall,
    LooseFile,
    ModArchive,
    ModCache,
}

impl BackupCategory {
    pub const ALL: [BackupCategory; 6] = [
        BackupCategory::BaseGame,
        BackupCategory::InstalledMod,
        BackupCategory::LinkedInstall,
        BackupCategory::LooseFile,
        BackupCategory::ModArchive,
        BackupCategory::ModCache,
    ];

    /// Top-level folder this category occupies inside a backup archive.
    /// Base-game and loose files share the plugin-directory folder.
    pub fn archive_dir(self, plugin_dir_name: &str) -> String {
        match self {
            BackupCategory::BaseGame | BackupCategory::LooseFile => plugin_dir_name.to_string(),
            BackupCategory::InstalledMod => VIRTUAL_INSTALL_DIR.to_string(),
            BackupCategory::LinkedInstall => LINK_DIR.to_string(),
            BackupCategory::ModArchive => MODS_DIR.to_string(),
            BackupCategory::ModCache => CACHE_DIR.to_string(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BackupCategory::BaseGame => "base",
            BackupCategory::InstalledMod => "mods",
            BackupCategory::LinkedInstall => "link",
            BackupCategory::LooseFile => "loose",
            BackupCategory::ModArchive => "archives",
            BackupCategory::ModCache => "cache",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "base" => Some(BackupCategory::BaseGame),
            "mods" => Some(BackupCategory::InstalledMod),
            "link" => Some(BackupCategory::LinkedInstall),
            "loose" => Some(BackupCategory::LooseFile),
            "archives" => Some(BackupCategory::ModArchive),
            "cache" => Some(BackupCategory::ModCache),
            _ => None,
        }
    }
}

/// One file to be backed up or restored. `virtual_path` is the
/// category-rooted relative path the file occupies inside the archive;
/// `real_path` is where it sits on disk right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub virtual_path: String,
    pub real_path: PathBuf,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub category: BackupCategory,
    pub size: u64,
}

impl BackupEntry {
    pub fn new(
        virtual_path: impl Into<String>,
        real_path: impl Into<PathBuf>,
        owner_id: Option<String>,
        category: BackupCategory,
        size: u64,
    ) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            real_path: real_path.into(),
            owner_id,
            category,
            size,
        }
    }

    /// Path of this entry relative to its category folder, including the
    /// per-mod subfolder when the entry has an owner.
    pub fn staged_rel_path(&self) -> PathBuf {
        let virtual_path = Path::new(&self.virtual_path);
        match &self.owner_id {
            Some(owner) => Path::new(owner).join(virtual_path),
            None => virtual_path.to_path_buf(),
        }
    }
}

/// Relative path as it appears in zip entry names: forward slashes only.
pub fn archive_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Case-insensitive, separator-normalized key for membership checks across
/// the category sets. Mod-manager trees come from case-insensitive file
/// systems, so `Data/Foo.esp` and `data\foo.esp` are the same file.
pub fn path_key(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        for ch in component.as_os_str().to_string_lossy().chars() {
            if ch == '\\' {
                out.push('/');
            } else {
                out.extend(ch.to_lowercase());
            }
        }
    }
    out
}

pub fn path_key_str(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let trimmed = normalized.trim_matches('/');
    trimmed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_dir_mapping() {
        assert_eq!(BackupCategory::BaseGame.archive_dir("Data"), "Data");
        assert_eq!(BackupCategory::LooseFile.archive_dir("Data"), "Data");
        assert_eq!(
            BackupCategory::InstalledMod.archive_dir("Data"),
            "VIRTUAL INSTALL"
        );
        assert_eq!(BackupCategory::LinkedInstall.archive_dir("Data"), "NMMLINK");
        assert_eq!(BackupCategory::ModArchive.archive_dir("Data"), "MODS");
        assert_eq!(BackupCategory::ModCache.archive_dir("Data"), "cache");
    }

    #[test]
    fn staged_rel_path_includes_owner() {
        let entry = BackupEntry::new(
            "Interface/map.swf",
            "/tmp/x",
            Some("mod-12".to_string()),
            BackupCategory::InstalledMod,
            4,
        );
        assert_eq!(
            entry.staged_rel_path(),
            Path::new("mod-12").join("Interface/map.swf")
        );
    }

    #[test]
    fn path_keys_fold_case_and_separators() {
        assert_eq!(path_key_str("Data\\Foo.ESP"), "data/foo.esp");
        assert_eq!(path_key(Path::new("Data/Foo.ESP")), "data/foo.esp");
    }
}
