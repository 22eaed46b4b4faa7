use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename = "installLog")]
struct InstallLogXml {
    #[serde(rename = "@fileVersion", default)]
    file_version: u32,
    #[serde(rename = "modList", default)]
    mod_list: LogModList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogModList {
    #[serde(rename = "mod", default)]
    mods: Vec<LoggedModXml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoggedModXml {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "files", default)]
    files: LogFiles,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogFiles {
    #[serde(rename = "file", default)]
    files: Vec<LogFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogFile {
    #[serde(rename = "@path")]
    path: String,
}

#[derive(Debug, Clone)]
pub struct LoggedMod {
    pub id: String,
    pub name: String,
    pub files: Vec<String>,
}

/// The install log: which mods are active and which plugin-dir-relative
/// files each one installed. A missing log file is an empty log, not an
/// error, since fresh installations have never written one.
#[derive(Debug)]
pub struct InstallLog {
    path: PathBuf,
    mods: Vec<LoggedMod>,
}

impl InstallLog {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                mods: Vec::new(),
            });
        }
        let raw = fs::read_to_string(path).context("read InstallLog.xml")?;
        let parsed: InstallLogXml = quick_xml::de::from_str(&raw).context("parse InstallLog.xml")?;
        Ok(Self {
            path: path.to_path_buf(),
            mods: parsed
                .mod_list
                .mods
                .into_iter()
                .map(|entry| LoggedMod {
                    id: entry.id,
                    name: entry.name,
                    files: entry.files.files.into_iter().map(|file| file.path).collect(),
                })
                .collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active_mods(&self) -> &[LoggedMod] {
        &self.mods
    }

    pub fn files_for(&self, mod_id: &str) -> Option<&[String]> {
        self.mods
            .iter()
            .find(|entry| entry.id == mod_id)
            .map(|entry| entry.files.as_slice())
    }

    /// Replaces the live log with the one extracted from a backup and
    /// reinitializes this instance from it.
    pub fn replace_with(&mut self, replacement: &Path) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create install log dir")?;
        }
        fs::copy(replacement, &self.path).context("replace install log")?;
        let reloaded = Self::load(&self.path)?;
        self.mods = reloaded.mods;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let xml_model = InstallLogXml {
            file_version: 1,
            mod_list: LogModList {
                mods: self
                    .mods
                    .iter()
                    .map(|entry| LoggedModXml {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                        files: LogFiles {
                            files: entry
                                .files
                                .iter()
                                .map(|path| LogFile { path: path.clone() })
                                .collect(),
                        },
                    })
                    .collect(),
            },
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create install log dir")?;
        }
        let mut xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_string();
        let mut ser = quick_xml::se::Serializer::new(&mut xml);
        ser.indent(' ', 4);
        xml_model.serialize(ser).context("serialize install log")?;
        xml.push('\n');
        fs::write(&self.path, xml).context("write InstallLog.xml")?;
        Ok(())
    }

    pub fn set_mods(&mut self, mods: Vec<LoggedMod>) {
        self.mods = mods;
    }
}
