mod common;

use common::*;
use modvault::archiver::{self, BackupRequest};
use modvault::catalog::BackupCatalog;
use modvault::error::{engine_error, EngineError};
use modvault::install_log::{InstallLog, LoggedMod};
use modvault::model::BackupCategory;
use modvault::overlay::Overlay;
use modvault::profile::{self, ProfileSnapshot};
use modvault::progress::ProgressReporter;
use modvault::restorer::{self, RestoreMode, RestoreRequest};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zip::write::SimpleFileOptions;

fn scan_all(env: &TestEnv) -> BackupCatalog {
    let overlay = Overlay::load(&env.game).unwrap();
    let install_log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let mut catalog = BackupCatalog::new();
    catalog
        .scan_loose_files(&env.game, overlay.as_ref(), &install_log, false)
        .unwrap();
    catalog.scan_mod_archives(&env.game).unwrap();
    catalog
}

fn create_full_backup(env: &TestEnv, categories: Vec<BackupCategory>) -> PathBuf {
    let overlay = Overlay::load(&env.game).unwrap();
    let install_log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let catalog = scan_all(env);
    let request = BackupRequest {
        game: &env.game,
        catalog: &catalog,
        categories,
        destination_dir: env.game.backups_dir(),
        profile_name: "Default".to_string(),
        snapshot: profile::live_snapshot(&env.game, &install_log, overlay.as_ref()),
        staging_base: Some(env.tmp.path().join("staging")),
        fallback_staging_root: None,
    };
    archiver::create_backup(&request, &ProgressReporter::silent())
        .unwrap()
        .archive_path
}

fn restore_archive(env: &TestEnv, archive: &Path, mode: RestoreMode) -> anyhow::Result<restorer::RestoreOutcome> {
    let request = RestoreRequest {
        game: &env.game,
        archive_path: archive.to_path_buf(),
        mode,
        staging_base: Some(env.tmp.path().join("restore-staging")),
    };
    restorer::restore(&request, &ProgressReporter::silent())
}

fn populate_source(env: &mut TestEnv) {
    add_base_files(
        env,
        &[("game.esm", b"base-master".as_slice()), ("textures/stone.dds", b"stone")],
    );
    install_overlay_mod(
        env,
        "mod-alpha",
        &[("Interface/alpha.swf", b"alpha-ui".as_slice()), ("alpha.esp", b"alpha-plugin")],
    );
    write_file(&env.game.plugin_dir.join("custom.ini"), b"tweaks");
    write_file(&env.game.mod_dir.join("alpha-1.0.zip"), b"alpha-source-zip");
    write_file(&env.game.mod_cache_dir.join("alpha/cached.xml"), b"<cached/>");

    let mut log = InstallLog::load(&env.game.install_log_path()).unwrap();
    log.set_mods(vec![LoggedMod {
        id: "mod-alpha".to_string(),
        name: "Alpha".to_string(),
        files: vec!["Interface/alpha.swf".to_string(), "alpha.esp".to_string()],
    }]);
    log.save().unwrap();
}

#[test]
fn merge_round_trip_reproduces_the_tree() {
    let mut source = setup_env();
    populate_source(&mut source);
    let archive = create_full_backup(&source, BackupCategory::ALL.to_vec());
    assert!(archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("testgame_NMM_BACKUP_"));

    let target = setup_env();
    let outcome = restore_archive(&target, &archive, RestoreMode::Merge).unwrap();
    assert!(outcome.files_restored > 0);

    // The overlay store and its config come back byte-for-byte.
    assert_eq!(
        snapshot_tree(&target.game.virtual_install_dir),
        snapshot_tree(&source.game.virtual_install_dir)
    );

    // The plugin dir comes back minus the overlay-deployed copies, which
    // belong to the virtual install and get re-deployed from there.
    let installed: HashSet<String> = ["interface/alpha.swf", "alpha.esp"]
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut expected = snapshot_tree(&source.game.plugin_dir);
    expected.retain(|rel, _| !installed.contains(&rel.to_lowercase()));
    assert_eq!(snapshot_tree(&target.game.plugin_dir), expected);

    assert_eq!(
        snapshot_tree(&target.game.mod_dir),
        snapshot_tree(&source.game.mod_dir)
    );

    // Profile registered in the target's store.
    let record = outcome.profile.expect("restored profile");
    assert_eq!(record.game_mode_id, GAME_ID);
    assert!(target
        .game
        .profile_store()
        .join(&record.profile_id)
        .join("profile.xml")
        .is_file());

    // Install log replaced and reinitialized.
    let restored_log = InstallLog::load(&target.game.install_log_path()).unwrap();
    assert_eq!(restored_log.active_mods().len(), 1);
    assert_eq!(restored_log.active_mods()[0].id, "mod-alpha");
}

#[test]
fn selected_category_totals_show_up_in_the_archive() {
    let mut env = setup_env();
    add_base_files(
        &mut env,
        &[
            ("a.esm", b"0123456789".as_slice()),
            ("b.esm", b"01234567890123456789"),
            ("c.esm", b"012345678901234567890123456789"),
        ],
    );
    install_legacy_mod(
        &env,
        "legacy",
        &[("m1.esp", b"12345".as_slice()), ("m2.esp", b"67890")],
    );

    let archive = create_full_backup(
        &env,
        vec![BackupCategory::BaseGame, BackupCategory::InstalledMod],
    );
    let inspection = restorer::inspect(&archive, &env.game).unwrap();

    assert!(inspection.has_plugin_folder);
    let folders: std::collections::HashMap<_, _> =
        inspection.folder_totals.iter().cloned().collect();
    assert_eq!(folders.get("Data"), Some(&60));
    assert_eq!(folders.get("VIRTUAL INSTALL"), Some(&10));
}

#[test]
fn archive_without_plugin_folder_is_rejected_before_touching_disk() {
    let env = setup_env();
    let archive_path = env.tmp.path().join("bogus.zip");
    let file = fs::File::create(&archive_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    zip.start_file("VIRTUAL INSTALL/mod-x/file.dat", options)
        .unwrap();
    zip.write_all(b"data").unwrap();
    zip.finish().unwrap();

    let before = snapshot_tree(&env.game.plugin_dir);
    let err = restore_archive(&env, &archive_path, RestoreMode::PurgeAndReplace).unwrap_err();
    assert!(matches!(
        engine_error(&err),
        Some(EngineError::ArchiveValidation(_))
    ));
    assert_eq!(snapshot_tree(&env.game.plugin_dir), before);
    assert!(!env.tmp.path().join("restore-staging").exists());
}

#[test]
fn archive_for_another_game_is_rejected_by_inspect() {
    let mut source = setup_env();
    populate_source(&mut source);
    let archive = create_full_backup(&source, BackupCategory::ALL.to_vec());

    let mut other = modvault::game::descriptor_at(&source.tmp.path().join("other"), "othergame");
    other.install_path = source.game.install_path.clone();
    other.plugin_dir = source.game.plugin_dir.clone();

    let err = restorer::inspect(&archive, &other).unwrap_err();
    assert!(matches!(
        engine_error(&err),
        Some(EngineError::ArchiveValidation(_))
    ));
}

#[test]
fn cancellation_before_staging_leaves_destination_untouched() {
    let mut env = setup_env();
    add_base_files(&mut env, &[("a.esm", b"data".as_slice())]);
    let catalog = scan_all(&env);

    let cancel = Arc::new(AtomicBool::new(true));
    let request = BackupRequest {
        game: &env.game,
        catalog: &catalog,
        categories: vec![BackupCategory::BaseGame],
        destination_dir: env.game.backups_dir(),
        profile_name: "Default".to_string(),
        snapshot: ProfileSnapshot::default(),
        staging_base: Some(env.tmp.path().join("staging")),
        fallback_staging_root: None,
    };
    let reporter = ProgressReporter::new(None, Some(cancel.clone()));
    let err = archiver::create_backup(&request, &reporter).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::Canceled)));
    assert!(!env.game.backups_dir().exists());
    assert!(!env.tmp.path().join("staging").join("x").exists());
}

#[test]
fn long_staged_paths_relocate_staging_and_still_archive_everything() {
    let mut env = setup_env();
    add_base_files(&mut env, &[("short.esm", b"short".as_slice())]);
    let deep: String = std::iter::repeat("longsegmentname0012")
        .take(14)
        .collect::<Vec<_>>()
        .join("/");
    let long_rel = format!("{deep}/tail.txt");
    write_file(&env.game.plugin_dir.join(&long_rel), b"deep-data");

    let overlay = Overlay::load(&env.game).unwrap();
    let install_log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let catalog = scan_all(&env);
    let fallback = env.tmp.path().join("short-root");
    let request = BackupRequest {
        game: &env.game,
        catalog: &catalog,
        categories: vec![BackupCategory::BaseGame, BackupCategory::LooseFile],
        destination_dir: env.game.backups_dir(),
        profile_name: "Default".to_string(),
        snapshot: profile::live_snapshot(&env.game, &install_log, overlay.as_ref()),
        staging_base: Some(env.tmp.path().join("staging")),
        fallback_staging_root: Some(fallback.clone()),
    };
    let report = archiver::create_backup(&request, &ProgressReporter::silent()).unwrap();

    assert_eq!(report.warnings.len(), 1, "warnings: {:?}", report.warnings);
    assert!(report.warnings[0].contains("relocated"));

    let inspection = restorer::inspect(&report.archive_path, &env.game).unwrap();
    let folders: std::collections::HashMap<_, _> =
        inspection.folder_totals.iter().cloned().collect();
    assert_eq!(folders.get("Data"), Some(&(5 + 9u64)));
    // Relocated staging cleaned up after itself.
    assert!(fallback
        .read_dir()
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true));
}

#[test]
fn merge_continues_past_single_file_failures() {
    let mut source = setup_env();
    populate_source(&mut source);
    write_file(&source.game.plugin_dir.join("sub/blocked.txt"), b"blocked");
    let archive = create_full_backup(&source, BackupCategory::ALL.to_vec());

    let target = setup_env();
    // A plain file where the restore needs a directory.
    write_file(&target.game.plugin_dir.join("sub"), b"in the way");

    let err = restore_archive(&target, &archive, RestoreMode::Merge).unwrap_err();
    match engine_error(&err) {
        Some(EngineError::PartialFailure { failed, total }) => {
            assert_eq!(*failed, 1);
            assert!(*total > 1);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
    // Everything else still landed.
    assert_eq!(
        fs::read(target.game.plugin_dir.join("custom.ini")).unwrap(),
        b"tweaks"
    );
}
