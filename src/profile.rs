use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub const PROFILE_FILE: &str = "profile.xml";
pub const SCRIPTED_DIR: &str = "Scripted";

/// The minimal profile record a backup carries: `PROFILE/<id>/profile.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "profile")]
pub struct ProfileRecord {
    #[serde(rename = "@profileId", default)]
    pub profile_id: String,
    #[serde(rename = "@profileName", default)]
    pub profile_name: String,
    #[serde(rename = "@gameModeId", default)]
    pub game_mode_id: String,
    #[serde(rename = "@modCount", default)]
    pub mod_count: u32,
}

/// Per-mod optional-file selection, stored as `optional/<modId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModOptionalFiles {
    pub mod_id: String,
    pub files: Vec<String>,
}

/// Everything beyond the record that a profile snapshot captures.
#[derive(Debug, Clone, Default)]
pub struct ProfileSnapshot {
    pub load_order: Vec<u8>,
    pub mod_list: Vec<String>,
    pub ini: Option<Vec<u8>>,
    pub optional_files: Vec<ModOptionalFiles>,
}

/// Allocates profile ids and owns the on-disk profile store.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    store_root: PathBuf,
}

impl ProfileManager {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
        }
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Fresh id derived from the profile name and the current instant, the
    /// same shape mod ids take elsewhere: short blake3 hex.
    pub fn allocate_profile_id(&self, name: &str) -> String {
        let stamp = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&stamp.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        hex[..12].to_string()
    }

    /// Writes the record plus the snapshot files into `dir`:
    /// `profile.xml`, `loadorder.txt`, `modlist.txt`, `ini_backup.ini`,
    /// `optional/<modId>.json`.
    pub fn write_snapshot(
        &self,
        dir: &Path,
        record: &ProfileRecord,
        snapshot: &ProfileSnapshot,
    ) -> Result<()> {
        fs::create_dir_all(dir).context("create profile snapshot dir")?;
        write_record(&dir.join(PROFILE_FILE), record)?;
        fs::write(dir.join("loadorder.txt"), &snapshot.load_order).context("write load order")?;
        fs::write(dir.join("modlist.txt"), snapshot.mod_list.join("\n"))
            .context("write mod list")?;
        if let Some(ini) = &snapshot.ini {
            fs::write(dir.join("ini_backup.ini"), ini).context("write ini snapshot")?;
        }
        if !snapshot.optional_files.is_empty() {
            let optional_dir = dir.join("optional");
            fs::create_dir_all(&optional_dir).context("create optional dir")?;
            for entry in &snapshot.optional_files {
                let raw =
                    serde_json::to_string_pretty(entry).context("serialize optional files")?;
                fs::write(optional_dir.join(format!("{}.json", entry.mod_id)), raw)
                    .context("write optional files")?;
            }
        }
        Ok(())
    }

    /// Copies the active profile's scripted-install logs into `dest`.
    /// Returns how many files were copied; none is not an error.
    pub fn copy_scripted_logs(&self, profile_id: &str, dest: &Path) -> Result<usize> {
        let source = self.store_root.join(profile_id).join(SCRIPTED_DIR);
        if !source.is_dir() {
            return Ok(0);
        }
        let mut copied = 0;
        for entry in WalkDir::new(&source).follow_links(false) {
            let entry = entry.context("walk scripted logs")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&source)
                .context("scripted rel path")?;
            let target = dest.join(SCRIPTED_DIR).join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create scripted dir")?;
            }
            fs::copy(entry.path(), &target).context("copy scripted log")?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Installs an extracted profile tree into the store under its id and
    /// returns the registered record.
    pub fn register(&self, extracted_dir: &Path, record: &ProfileRecord) -> Result<ProfileRecord> {
        let target = self.store_root.join(&record.profile_id);
        fs::create_dir_all(&target).context("create profile dir")?;
        for entry in WalkDir::new(extracted_dir).follow_links(false) {
            let entry = entry.context("walk extracted profile")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(extracted_dir)
                .context("profile rel path")?;
            let dest = target.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).context("create profile subdir")?;
            }
            fs::copy(entry.path(), &dest).context("copy profile file")?;
        }
        write_record(&target.join(PROFILE_FILE), record)?;
        Ok(record.clone())
    }

    pub fn load_record(&self, profile_id: &str) -> Result<ProfileRecord> {
        let path = self.store_root.join(profile_id).join(PROFILE_FILE);
        let raw = fs::read_to_string(&path).context("read profile.xml")?;
        Ok(parse_record(&raw))
    }
}

/// Snapshot of the live profile state for inclusion in a backup: load-order
/// bytes and any ini snapshot come from the active profile's store entry
/// when one exists, the mod list from the overlay (or install log in legacy
/// mode).
pub fn live_snapshot(
    game: &crate::game::GameDescriptor,
    install_log: &crate::install_log::InstallLog,
    overlay: Option<&crate::overlay::Overlay>,
) -> ProfileSnapshot {
    let store = game.profile_store().join(&game.active_profile);
    let load_order = fs::read(store.join("loadorder.txt")).unwrap_or_default();
    let ini = fs::read(store.join("ini_backup.ini")).ok();

    let mod_list = match overlay {
        Some(overlay) => {
            let mut seen = Vec::new();
            for link in overlay.links() {
                if !seen.contains(&link.owner_id) {
                    seen.push(link.owner_id);
                }
            }
            seen
        }
        None => install_log
            .active_mods()
            .iter()
            .map(|logged| logged.name.clone())
            .collect(),
    };

    let mut optional_files = Vec::new();
    let optional_dir = store.join("optional");
    if optional_dir.is_dir() {
        if let Ok(read_dir) = fs::read_dir(&optional_dir) {
            for entry in read_dir.flatten() {
                if let Ok(raw) = fs::read_to_string(entry.path()) {
                    if let Ok(parsed) = serde_json::from_str::<ModOptionalFiles>(&raw) {
                        optional_files.push(parsed);
                    }
                }
            }
        }
    }

    ProfileSnapshot {
        load_order,
        mod_list,
        ini,
        optional_files,
    }
}

pub fn write_record(path: &Path, record: &ProfileRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create profile dir")?;
    }
    let mut xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_string();
    let mut ser = quick_xml::se::Serializer::new(&mut xml);
    ser.indent(' ', 4);
    record.serialize(ser).context("serialize profile.xml")?;
    xml.push('\n');
    fs::write(path, xml).context("write profile.xml")?;
    Ok(())
}

/// A backup's profile record is advisory: malformed or missing fields fall
/// back to an empty/zero record instead of failing the restore.
pub fn parse_record(raw: &str) -> ProfileRecord {
    quick_xml::de::from_str(raw).unwrap_or_default()
}
