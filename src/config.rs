use crate::game;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub active_game: String,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub include_link_files: bool,
    #[serde(default = "default_true")]
    pub backup_before_purge: bool,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = game::base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig {
            active_game: "skyrim".to_string(),
            backup_dir: None,
            include_link_files: false,
            backup_before_purge: true,
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = game::base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
