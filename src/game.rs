use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Everything the engine needs to know about one managed game: where the
/// game lives, where its plugin (data) directory is, where mod archives and
/// the overlay are kept, and which files belong to the base installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameDescriptor {
    #[serde(default)]
    pub game_id: String,
    pub game_name: String,
    pub install_path: PathBuf,
    pub plugin_dir: PathBuf,
    pub mod_dir: PathBuf,
    pub mod_cache_dir: PathBuf,
    pub virtual_install_dir: PathBuf,
    #[serde(default)]
    pub link_dir: Option<PathBuf>,
    #[serde(default)]
    pub base_file_manifest: Vec<String>,
    #[serde(default)]
    pub active_profile: String,
    pub data_dir: PathBuf,
}

impl GameDescriptor {
    pub fn load_or_create(game_id: &str) -> Result<Self> {
        let base = base_data_dir()?;
        Self::load_or_create_at(&base, game_id)
    }

    /// Same as `load_or_create` but rooted at an explicit directory rather
    /// than the per-user data dir (`--root`, test environments).
    pub fn load_or_create_at(root: &Path, game_id: &str) -> Result<Self> {
        let data_dir = root.join(game_id);
        fs::create_dir_all(&data_dir).context("create game data dir")?;

        let descriptor_path = data_dir.join("game.json");
        if descriptor_path.exists() {
            let raw = fs::read_to_string(&descriptor_path).context("read game.json")?;
            let mut descriptor: GameDescriptor =
                serde_json::from_str(&raw).context("parse game.json")?;
            descriptor.game_id = game_id.to_string();
            descriptor.data_dir = data_dir;
            descriptor.load_manifest_file()?;
            return Ok(descriptor);
        }

        let descriptor = GameDescriptor {
            game_id: game_id.to_string(),
            game_name: game_id.to_string(),
            install_path: PathBuf::new(),
            plugin_dir: PathBuf::new(),
            mod_dir: data_dir.join("mods"),
            mod_cache_dir: data_dir.join("mods").join("cache"),
            virtual_install_dir: data_dir.join(crate::model::VIRTUAL_INSTALL_DIR),
            link_dir: None,
            base_file_manifest: Vec::new(),
            active_profile: String::new(),
            data_dir,
        };
        descriptor.save()?;
        Ok(descriptor)
    }

    pub fn save(&self) -> Result<()> {
        let descriptor_path = self.data_dir.join("game.json");
        let raw = serde_json::to_string_pretty(self).context("serialize game.json")?;
        fs::write(descriptor_path, raw).context("write game.json")?;
        Ok(())
    }

    /// `base_files.txt` next to `game.json` overrides the inline manifest:
    /// one plugin-dir-relative path per line, `#` comments allowed.
    fn load_manifest_file(&mut self) -> Result<()> {
        let manifest_path = self.data_dir.join("base_files.txt");
        if !manifest_path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&manifest_path).context("read base_files.txt")?;
        self.base_file_manifest = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(())
    }

    pub fn plugin_dir_name(&self) -> String {
        self.plugin_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "Data".to_string())
    }

    pub fn profile_store(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.data_dir.join(crate::model::INSTALL_LOG_NAME)
    }

    pub fn overlay_config_path(&self) -> PathBuf {
        self.virtual_install_dir.join("VirtualModConfig.xml")
    }

    /// Multi-drive link installs are on when a link folder is configured.
    pub fn multi_drive(&self) -> bool {
        self.link_dir
            .as_ref()
            .map(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(false)
    }

    /// Subtrees under the mod directory that belong to the manager, not to
    /// mod archives: the overlay store, the cache, profiles and the link
    /// folder must never be swept up by the archive scan.
    pub fn managed_subtrees(&self) -> Vec<PathBuf> {
        let mut subtrees = vec![
            self.virtual_install_dir.clone(),
            self.mod_cache_dir.clone(),
            self.profile_store(),
            self.backups_dir(),
        ];
        if let Some(link_dir) = &self.link_dir {
            subtrees.push(link_dir.clone());
        }
        subtrees
    }

    pub fn is_configured(&self) -> bool {
        !self.plugin_dir.as_os_str().is_empty() && !self.install_path.as_os_str().is_empty()
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modvault"))
}

/// Descriptor rooted at an explicit directory instead of the per-user data
/// dir. The CLI uses this for `--root`; tests build whole environments
/// under a temp dir with it.
pub fn descriptor_at(root: &Path, game_id: &str) -> GameDescriptor {
    let data_dir = root.join(game_id);
    GameDescriptor {
        game_id: game_id.to_string(),
        game_name: game_id.to_string(),
        install_path: PathBuf::new(),
        plugin_dir: PathBuf::new(),
        mod_dir: data_dir.join("mods"),
        mod_cache_dir: data_dir.join("mods").join("cache"),
        virtual_install_dir: data_dir.join(crate::model::VIRTUAL_INSTALL_DIR),
        link_dir: None,
        base_file_manifest: Vec::new(),
        active_profile: String::new(),
        data_dir,
    }
}
