mod common;

use common::*;
use modvault::archiver::{self, BackupRequest};
use modvault::catalog::BackupCatalog;
use modvault::error::{engine_error, EngineError};
use modvault::install_log::{InstallLog, LoggedMod};
use modvault::model::BackupCategory;
use modvault::overlay::Overlay;
use modvault::profile;
use modvault::progress::{Phase, ProgressReporter};
use modvault::restorer::{self, RestoreMode, RestoreRequest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

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

fn create_backup(env: &TestEnv) -> PathBuf {
    let overlay = Overlay::load(&env.game).unwrap();
    let install_log = InstallLog::load(&env.game.install_log_path()).unwrap();
    let mut catalog = BackupCatalog::new();
    catalog
        .scan_loose_files(&env.game, overlay.as_ref(), &install_log, false)
        .unwrap();
    catalog.scan_mod_archives(&env.game).unwrap();
    let request = BackupRequest {
        game: &env.game,
        catalog: &catalog,
        categories: BackupCategory::ALL.to_vec(),
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

fn live_state(env: &TestEnv) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
    let mut state = BTreeMap::new();
    state.insert("plugin".to_string(), snapshot_tree(&env.game.plugin_dir));
    state.insert(
        "virtual".to_string(),
        snapshot_tree(&env.game.virtual_install_dir),
    );
    state.insert("mods".to_string(), snapshot_tree(&env.game.mod_dir));
    state
}

fn assert_no_swap_leftovers(dir: &Path) {
    let name = dir.file_name().unwrap().to_string_lossy().to_string();
    for suffix in ["_oldbkp", "_DELETE"] {
        let sibling = dir.with_file_name(format!("{name}{suffix}"));
        assert!(!sibling.exists(), "leftover {sibling:?}");
    }
}

/// The core failure-safety guarantee: a fault after N of M copies during
/// purge-and-replace leaves the live tree byte-identical to its
/// pre-operation state. Cancellation mid-copy takes the same path as any
/// other failure, so it doubles as the fault injector.
#[test]
fn fault_during_purge_copy_rolls_back_to_pre_operation_state() {
    let mut source = setup_env();
    populate_source(&mut source);
    let archive = create_backup(&source);

    let target = setup_env();
    write_file(&target.game.plugin_dir.join("junk/leftover.tmp"), b"junk");
    write_file(&target.game.plugin_dir.join("old.ini"), b"old settings");
    write_file(&target.game.mod_dir.join("stale.zip"), b"stale");
    let before = live_state(&target);

    let cancel = Arc::new(AtomicBool::new(false));
    let copies = Arc::new(AtomicUsize::new(0));
    let callback: modvault::progress::ProgressCallback = {
        let cancel = cancel.clone();
        let copies = copies.clone();
        Arc::new(move |event| {
            if event.phase == Phase::Replaying && copies.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };
    let reporter = ProgressReporter::new(Some(callback), Some(cancel));

    let request = RestoreRequest {
        game: &target.game,
        archive_path: archive,
        mode: RestoreMode::PurgeAndReplace,
        staging_base: Some(target.tmp.path().join("restore-staging")),
    };
    let err = restorer::restore(&request, &reporter).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::Canceled)));
    assert!(
        copies.load(Ordering::SeqCst) >= 2,
        "fault injected after at least two copies"
    );

    assert_eq!(live_state(&target), before, "live tree must be untouched");
    assert_no_swap_leftovers(&target.game.plugin_dir);
    assert_no_swap_leftovers(&target.game.virtual_install_dir);
    assert_no_swap_leftovers(&target.game.mod_dir);

    // The canceled restore must not have registered a profile either.
    assert!(snapshot_tree(&target.game.profile_store()).is_empty());
}

#[test]
fn successful_purge_replace_discards_unmanaged_state() {
    let mut source = setup_env();
    populate_source(&mut source);
    let archive = create_backup(&source);

    let target = setup_env();
    write_file(&target.game.plugin_dir.join("junk/leftover.tmp"), b"junk");
    write_file(&target.game.mod_dir.join("stale.zip"), b"stale");

    let request = RestoreRequest {
        game: &target.game,
        archive_path: archive,
        mode: RestoreMode::PurgeAndReplace,
        staging_base: Some(target.tmp.path().join("restore-staging")),
    };
    let outcome = restorer::restore(&request, &ProgressReporter::silent()).unwrap();

    assert!(!target.game.plugin_dir.join("junk/leftover.tmp").exists());
    assert!(!target.game.mod_dir.join("stale.zip").exists());
    assert_eq!(
        snapshot_tree(&target.game.virtual_install_dir),
        snapshot_tree(&source.game.virtual_install_dir)
    );
    assert!(target.game.plugin_dir.join("game.esm").is_file());
    assert!(target.game.plugin_dir.join("custom.ini").is_file());

    assert_no_swap_leftovers(&target.game.plugin_dir);
    assert_no_swap_leftovers(&target.game.virtual_install_dir);
    assert_no_swap_leftovers(&target.game.mod_dir);

    let record = outcome.profile.expect("profile registered");
    assert!(target
        .game
        .profile_store()
        .join(&record.profile_id)
        .join("profile.xml")
        .is_file());
}
