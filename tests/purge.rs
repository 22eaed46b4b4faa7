mod common;

use common::*;
use modvault::catalog::BackupCatalog;
use modvault::install_log::InstallLog;
use modvault::model::BackupCategory;
use modvault::overlay::Overlay;
use modvault::progress::ProgressReporter;
use modvault::purge::{purge_loose, PurgeOptions};
use modvault::restorer;

fn scan(env: &TestEnv) -> BackupCatalog {
    let overlay = Overlay::load(&env.game).unwrap();
    let install_log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let mut catalog = BackupCatalog::new();
    catalog
        .scan_loose_files(&env.game, overlay.as_ref(), &install_log, false)
        .unwrap();
    catalog.scan_mod_archives(&env.game).unwrap();
    catalog
}

#[test]
fn purge_removes_only_loose_files_and_prunes_empty_dirs() {
    let mut env = setup_env();
    add_base_files(&mut env, &[("game.esm", b"base".as_slice())]);
    install_overlay_mod(&env, "mod-alpha", &[("alpha.esp", b"plugin".as_slice())]);
    write_file(&env.game.plugin_dir.join("stray.txt"), b"stray");
    write_file(&env.game.plugin_dir.join("deep/nested/junk.tmp"), b"junk");

    let catalog = scan(&env);
    let options = PurgeOptions {
        backup_first: false,
        backup_dir: None,
    };
    let report = purge_loose(&env.game, &catalog, &options, &ProgressReporter::silent()).unwrap();

    assert_eq!(report.deleted, 2);
    assert_eq!(report.reclaimed_bytes, 5 + 4);
    assert!(report.backup.is_none());

    assert!(env.game.plugin_dir.join("game.esm").is_file());
    assert!(env.game.plugin_dir.join("alpha.esp").is_file());
    assert!(!env.game.plugin_dir.join("stray.txt").exists());
    assert!(!env.game.plugin_dir.join("deep").exists(), "emptied dirs pruned");
    assert!(env.game.plugin_dir.is_dir(), "plugin dir itself survives");
}

#[test]
fn purge_backs_up_loose_files_before_deleting_them() {
    let mut env = setup_env();
    add_base_files(&mut env, &[("game.esm", b"base".as_slice())]);
    write_file(&env.game.plugin_dir.join("stray.txt"), b"stray");

    let catalog = scan(&env);
    let options = PurgeOptions {
        backup_first: true,
        backup_dir: None,
    };
    let report = purge_loose(&env.game, &catalog, &options, &ProgressReporter::silent()).unwrap();

    assert_eq!(report.deleted, 1);
    let archive = report.backup.expect("safety backup written");
    assert!(archive.is_file());
    assert!(!env.game.plugin_dir.join("stray.txt").exists());

    // The safety backup carries exactly the purged loose bytes.
    let inspection = restorer::inspect(&archive, &env.game).unwrap();
    let data_total = inspection
        .folder_totals
        .iter()
        .find(|(name, _)| name == "Data")
        .map(|(_, bytes)| *bytes);
    assert_eq!(data_total, Some(5));
}
