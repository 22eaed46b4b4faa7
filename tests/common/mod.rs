use modvault::game::{self, GameDescriptor};
use modvault::install_log::{InstallLog, LoggedMod};
use modvault::overlay::{FileLink, ModInfo, ModList, VirtualModConfig};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const GAME_ID: &str = "testgame";

pub struct TestEnv {
    pub tmp: TempDir,
    pub game: GameDescriptor,
}

/// A managed installation under a temp dir: game root with a `Data` plugin
/// dir, modvault's per-game data dir with mod store, cache, overlay and
/// profile store.
pub fn setup_env() -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    let mut game = game::descriptor_at(&root.join("modvault"), GAME_ID);
    game.install_path = root.join("game");
    game.plugin_dir = root.join("game").join("Data");

    for dir in [
        &game.plugin_dir,
        &game.mod_dir,
        &game.mod_cache_dir,
        &game.virtual_install_dir,
        &game.profile_store(),
        &game.data_dir,
    ] {
        fs::create_dir_all(dir).unwrap();
    }
    game.save().unwrap();

    TestEnv { tmp, game }
}

pub fn write_file(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Registers base-game files: writes each under the plugin dir and lists it
/// in the descriptor's manifest.
pub fn add_base_files(env: &mut TestEnv, files: &[(&str, &[u8])]) {
    for (rel, contents) in files {
        write_file(&env.game.plugin_dir.join(rel), contents);
        env.game.base_file_manifest.push(rel.to_string());
    }
    env.game.save().unwrap();
}

/// Installs a mod through the overlay: the backing copy lives in the
/// overlay store under the mod id, the deployed copy at its game-expected
/// path under the plugin dir, and the link table records the pair.
pub fn install_overlay_mod(env: &TestEnv, mod_id: &str, files: &[(&str, &[u8])]) {
    let config_path = env.game.overlay_config_path();
    let mut config = if config_path.exists() {
        let raw = fs::read_to_string(&config_path).unwrap();
        quick_xml::de::from_str::<VirtualModConfig>(&raw).unwrap()
    } else {
        VirtualModConfig {
            file_version: 1,
            mod_list: ModList { mods: Vec::new() },
        }
    };

    let mut info = ModInfo {
        mod_id: mod_id.to_string(),
        mod_name: mod_id.to_string(),
        links: Vec::new(),
    };
    for (virtual_path, contents) in files {
        let real = env.game.virtual_install_dir.join(mod_id).join(virtual_path);
        write_file(&real, contents);
        write_file(&env.game.plugin_dir.join(virtual_path), contents);
        info.links.push(FileLink {
            virtual_path: virtual_path.to_string(),
            real_path: real.to_string_lossy().to_string(),
        });
    }
    config.mod_list.mods.push(info);
    modvault::overlay::write_config(&config_path, &config).unwrap();
}

/// Legacy-mode install: files only under the plugin dir, attributed through
/// the install log.
pub fn install_legacy_mod(env: &TestEnv, mod_id: &str, files: &[(&str, &[u8])]) {
    let mut log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let mut mods: Vec<LoggedMod> = log.active_mods().to_vec();
    let mut logged = LoggedMod {
        id: mod_id.to_string(),
        name: mod_id.to_string(),
        files: Vec::new(),
    };
    for (rel, contents) in files {
        write_file(&env.game.plugin_dir.join(rel), contents);
        logged.files.push(rel.to_string());
    }
    mods.push(logged);
    log.set_mods(mods);
    log.save().unwrap();
}

/// Byte-for-byte snapshot of a directory tree, keyed by relative path.
/// A missing root is an empty tree.
pub fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    if !root.is_dir() {
        return out;
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        out.insert(rel, fs::read(entry.path()).unwrap());
    }
    out
}
