use crate::game::GameDescriptor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// On-disk shape of `VirtualModConfig.xml`, the overlay's link table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename = "virtualModActivator")]
pub struct VirtualModConfig {
    #[serde(rename = "@fileVersion", default)]
    pub file_version: u32,
    #[serde(rename = "modList", default)]
    pub mod_list: ModList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModList {
    #[serde(rename = "modInfo", default)]
    pub mods: Vec<ModInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModInfo {
    #[serde(rename = "@modId")]
    pub mod_id: String,
    #[serde(rename = "@modName", default)]
    pub mod_name: String,
    #[serde(rename = "fileLink", default)]
    pub links: Vec<FileLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileLink {
    #[serde(rename = "@virtualPath")]
    pub virtual_path: String,
    #[serde(rename = "@realPath")]
    pub real_path: String,
}

/// One resolved overlay link: the game-expected path, the backing file in
/// the overlay store, and the mod that owns it.
#[derive(Debug, Clone)]
pub struct VirtualLink {
    pub virtual_path: String,
    pub real_path: PathBuf,
    pub owner_id: String,
}

/// The virtualization overlay. Present when `VirtualModConfig.xml` exists
/// under the overlay root; otherwise the installation is in legacy mode and
/// installed files are located through the install log instead. The
/// multi-drive link folder, when one is in use, is configured on the game
/// descriptor alongside the overlay root.
#[derive(Debug)]
pub struct Overlay {
    pub root: PathBuf,
    pub config_path: PathBuf,
    config: VirtualModConfig,
}

impl Overlay {
    pub fn load(game: &GameDescriptor) -> Result<Option<Self>> {
        let config_path = game.overlay_config_path();
        if !config_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&config_path).context("read VirtualModConfig.xml")?;
        let config: VirtualModConfig =
            quick_xml::de::from_str(&raw).context("parse VirtualModConfig.xml")?;
        Ok(Some(Self {
            root: game.virtual_install_dir.clone(),
            config_path,
            config,
        }))
    }

    /// Links with real paths resolved. Relative real paths are rooted at the
    /// overlay store.
    pub fn links(&self) -> Vec<VirtualLink> {
        let mut out = Vec::new();
        for mod_info in &self.config.mod_list.mods {
            for link in &mod_info.links {
                let real = Path::new(&link.real_path);
                let real_path = if real.is_absolute() {
                    real.to_path_buf()
                } else {
                    self.root.join(real)
                };
                out.push(VirtualLink {
                    virtual_path: link.virtual_path.clone(),
                    real_path,
                    owner_id: mod_info.mod_id.clone(),
                });
            }
        }
        out
    }

    pub fn overwrites_dir(&self) -> PathBuf {
        self.root.join("_overwrites")
    }
}

pub fn write_config(path: &Path, config: &VirtualModConfig) -> Result<()> {
    let parent = path.parent().context("overlay config parent")?;
    fs::create_dir_all(parent).context("create overlay dir")?;
    let mut xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_string();
    let mut ser = quick_xml::se::Serializer::new(&mut xml);
    ser.indent(' ', 4);
    config.serialize(ser).context("serialize overlay config")?;
    xml.push('\n');
    fs::write(path, xml).context("write VirtualModConfig.xml")?;
    Ok(())
}
