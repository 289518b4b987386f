// tests/sync.rs
//
// End-to-end orchestrator scenarios over a scripted FC and a temp
// storage root. No serial hardware, no sysfs.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use bbsyncer::config::Config;
use bbsyncer::led::LedController;
use bbsyncer::storage::manifest::Manifest;
use bbsyncer::storage::{MANIFEST_FILENAME, RAW_FLASH_FILENAME};
use bbsyncer::sync::{StatusHandle, SyncOrchestrator, SyncResult};
use common::{NullLed, ScriptedFc};

fn test_config(storage: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage_path = storage.to_path_buf();
    cfg.min_free_space_mb = 0;
    cfg.flash_chunk_size = 8;
    cfg.serial_timeout = 1.0;
    cfg.erase_after_sync = false;
    cfg
}

fn run(cfg: &Config, fc: &mut ScriptedFc, dry_run: bool) -> SyncResult {
    let led = LedController::start(Box::new(NullLed));
    let status = StatusHandle::new();
    let orchestrator = SyncOrchestrator::new(cfg, &led, status, dry_run);
    orchestrator.run_session(fc)
}

fn find_bbl(storage: &Path) -> Option<PathBuf> {
    let mut found = Vec::new();
    for fc_dir in fs::read_dir(storage).ok()?.flatten() {
        if !fc_dir.path().is_dir() {
            continue;
        }
        for session in fs::read_dir(fc_dir.path()).ok()?.flatten() {
            let bbl = session.path().join(RAW_FLASH_FILENAME);
            if bbl.exists() {
                found.push(bbl);
            }
        }
    }
    found.pop()
}

fn read_manifest(bbl: &Path) -> Manifest {
    let text = fs::read_to_string(bbl.parent().unwrap().join(MANIFEST_FILENAME)).unwrap();
    serde_json::from_str(&text).unwrap()
}

// ---------------------------------------------------------------------------

#[test]
fn happy_path_uncompressed() {
    let flash: Vec<u8> = b"H7\x00\x01".repeat(4); // 16 bytes, two 8-byte chunks
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(flash.clone());

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Success);
    assert_eq!(result.exit_code(), 0);

    let bbl = find_bbl(tmp.path()).expect("raw_flash.bbl written");
    assert_eq!(fs::read(&bbl).unwrap(), flash);

    let manifest = read_manifest(&bbl);
    assert_eq!(manifest.file.bytes, 16);
    assert_eq!(manifest.file.sha256, hex::encode(Sha256::digest(&flash)));
    assert_eq!(manifest.fc.uid, "deadbeef12345678abcd1234");
    assert!(!manifest.erase_attempted);
    assert!(!fc.erase_called);
}

#[test]
fn already_empty_flash() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(Vec::new());

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::AlreadyEmpty);
    assert_eq!(result.exit_code(), 0);
    // No session directory is created for an empty flash.
    assert!(find_bbl(tmp.path()).is_none());
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn wrong_variant_is_error() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(vec![0xAA; 32]);
    fc.variant = *b"INAV";

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Error);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn sd_card_fc_is_error() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(vec![0xAA; 32]);
    fc.blackbox_device = Some(2);

    assert_eq!(run(&cfg, &mut fc, false), SyncResult::Error);
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn flash_not_ready_is_error() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(vec![0xAA; 32]);
    fc.summary_flags = 0x01; // supported but not ready

    assert_eq!(run(&cfg, &mut fc, false), SyncResult::Error);
}

#[test]
fn transient_read_errors_are_retried() {
    let flash: Vec<u8> = (0u8..64).collect();
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(flash.clone());
    // Four failures, the fifth receive succeeds: under the limit of 5.
    fc.fail_receives = 4;

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Success);
    let bbl = find_bbl(tmp.path()).unwrap();
    assert_eq!(fs::read(&bbl).unwrap(), flash);
}

#[test]
fn persistent_read_errors_abort() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(vec![0x55; 64]);
    fc.fail_receives = u32::MAX;

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Error);
    // The partial file was deleted on abort.
    assert!(find_bbl(tmp.path()).is_none());
}

#[test]
fn address_mismatch_loop_aborts() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let mut fc = ScriptedFc::new(vec![0x77; 64]);
    // Every chunk claims address 0: the first window matches, then five
    // mismatches in a row kill the sync.
    fc.force_chunk_addr = Some(0);

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Error);
    assert!(find_bbl(tmp.path()).is_none());
}

#[test]
fn dry_run_skips_erase() {
    let flash = b"\xde\xad\xbe\xef\xde\xad\xbe\xef".to_vec();
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.erase_after_sync = true; // dry-run must still win

    let mut fc = ScriptedFc::new(flash.clone());
    let result = run(&cfg, &mut fc, true);
    assert_eq!(result, SyncResult::DryRun);
    assert_eq!(result.exit_code(), 0);
    assert!(!fc.erase_called);

    let bbl = find_bbl(tmp.path()).unwrap();
    assert_eq!(fs::read(&bbl).unwrap(), flash);
    let manifest = read_manifest(&bbl);
    assert!(!manifest.erase_attempted);
    assert!(!manifest.erase_completed);
}

#[test]
fn erase_confirmed_updates_manifest() {
    let flash = vec![0x42; 24];
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.erase_after_sync = true;
    cfg.erase_timeout_sec = 10;

    let mut fc = ScriptedFc::new(flash.clone());
    fc.erase_clears_flash = true;

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Success);
    assert!(fc.erase_called);

    let manifest = read_manifest(&find_bbl(tmp.path()).unwrap());
    assert!(manifest.erase_attempted);
    assert!(manifest.erase_completed);
}

#[test]
fn erase_timeout_is_error_but_log_survives() {
    let flash = vec![0x42; 24];
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.erase_after_sync = true;
    cfg.erase_timeout_sec = 0; // deadline already passed

    let mut fc = ScriptedFc::new(flash.clone());
    fc.erase_clears_flash = false;

    let result = run(&cfg, &mut fc, false);
    assert_eq!(result, SyncResult::Error);
    assert!(fc.erase_called);

    // The on-disk copy is intact and the manifest records the attempt.
    let bbl = find_bbl(tmp.path()).unwrap();
    assert_eq!(fs::read(&bbl).unwrap(), flash);
    let manifest = read_manifest(&bbl);
    assert!(manifest.erase_attempted);
    assert!(!manifest.erase_completed);
}
