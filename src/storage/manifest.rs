// src/storage/manifest.rs
//
// =============================================================================
// BBSYNCER: SESSION STORE
// =============================================================================
//
// Layout on the SD card:
//
//   <storage_root>/fc_BTFL_uid-<uid8>/<YYYY-MM-DD_HHMMSS>[_N]/
//       raw_flash.bbl
//       manifest.json
//
// The manifest is written once after verification and rewritten exactly
// once more after the erase poll. Both writes are crash-safe: a temp file
// is fsynced and renamed over the target.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};

use crate::fc::FcInfo;

use super::{MANIFEST_FILENAME, RAW_FLASH_FILENAME};

pub const MANIFEST_VERSION: u32 = 1;

// ============================================================================
// 1. MANIFEST SCHEMA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_utc: String,
    pub fc: ManifestFc,
    pub file: ManifestFile,
    pub erase_attempted: bool,
    pub erase_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFc {
    pub variant: String,
    pub uid: String,
    pub api_version: String,
    pub blackbox_device: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

/// One row of the session listing consumed by the web UI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub fc_dir: String,
    pub session_dir: String,
    pub path: String,
    pub bbl_path: Option<String>,
    pub manifest: Manifest,
}

// ============================================================================
// 2. SESSION DIRECTORIES
// ============================================================================

/// Create and return a fresh timestamped session directory. Two syncs
/// starting within the same wall-clock second get distinct directories
/// via a `_N` suffix.
pub fn make_session_dir(storage_root: &Path, fc_info: &FcInfo) -> Result<PathBuf> {
    let fc_dir = storage_root.join(format!("fc_BTFL_uid-{}", fc_info.uid_short()));
    let timestamp = Local::now().format("%Y-%m-%d_%H%M%S").to_string();

    let mut session_dir = fc_dir.join(&timestamp);
    let mut suffix = 0;
    while session_dir.exists() {
        suffix += 1;
        session_dir = fc_dir.join(format!("{}_{}", timestamp, suffix));
    }

    fs::create_dir_all(&session_dir)
        .with_context(|| format!("Failed to create {}", session_dir.display()))?;
    log::info!("Created session directory: {}", session_dir.display());
    Ok(session_dir)
}

// ============================================================================
// 3. MANIFEST LIFECYCLE
// ============================================================================

/// Write manifest.json into `session_dir`. Returns the manifest path.
pub fn write_manifest(
    session_dir: &Path,
    fc_info: &FcInfo,
    sha256: &str,
    bytes: u64,
    erase_attempted: bool,
    erase_completed: bool,
) -> Result<PathBuf> {
    let manifest = Manifest {
        version: MANIFEST_VERSION,
        created_utc: Utc::now().to_rfc3339(),
        fc: ManifestFc {
            variant: fc_info.variant_str(),
            uid: fc_info.uid.clone(),
            api_version: format!("{}.{}", fc_info.api_major, fc_info.api_minor),
            blackbox_device: fc_info.blackbox_device,
        },
        file: ManifestFile {
            name: RAW_FLASH_FILENAME.to_string(),
            sha256: sha256.to_string(),
            bytes,
        },
        erase_attempted,
        erase_completed,
    };
    let path = session_dir.join(MANIFEST_FILENAME);
    write_atomic(&path, &manifest)?;
    log::debug!("Wrote manifest to {}", path.display());
    Ok(path)
}

/// Flip the erase flags in an existing manifest. The sync result no longer
/// depends on this file, so failures are logged rather than propagated.
pub fn update_manifest_erase(session_dir: &Path, erase_completed: bool) {
    let path = session_dir.join(MANIFEST_FILENAME);
    let result = (|| -> Result<()> {
        let text = fs::read_to_string(&path)?;
        let mut manifest: Manifest = serde_json::from_str(&text)?;
        manifest.erase_attempted = true;
        manifest.erase_completed = erase_completed;
        write_atomic(&path, &manifest)?;
        Ok(())
    })();
    match result {
        Ok(()) => log::debug!("Updated manifest erase_completed={}", erase_completed),
        Err(e) => log::error!("Failed to update manifest: {}", e),
    }
}

/// Write-new → fsync → rename. A crash mid-write leaves either the old
/// manifest or none, never a torn one.
fn write_atomic(path: &Path, manifest: &Manifest) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

// ============================================================================
// 4. LISTING
// ============================================================================

/// Enumerate all sessions under `storage_root`: FC groups in name order,
/// sessions newest-first within each group. Directories without a valid
/// manifest are skipped.
pub fn list_sessions(storage_root: &Path) -> Vec<SessionEntry> {
    let mut sessions = Vec::new();

    let mut fc_dirs: Vec<PathBuf> = match fs::read_dir(storage_root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => return sessions,
    };
    fc_dirs.sort();

    for fc_dir in fc_dirs {
        let mut session_dirs: Vec<PathBuf> = match fs::read_dir(&fc_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(_) => continue,
        };
        // Timestamped names sort chronologically; reverse for newest-first.
        session_dirs.sort();
        session_dirs.reverse();

        for session_dir in session_dirs {
            let manifest_path = session_dir.join(MANIFEST_FILENAME);
            let bbl_path = session_dir.join(RAW_FLASH_FILENAME);
            let Ok(text) = fs::read_to_string(&manifest_path) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<Manifest>(&text) else {
                continue;
            };
            let fc_name = dir_name(&fc_dir);
            let session_name = dir_name(&session_dir);
            sessions.push(SessionEntry {
                session_id: format!("{}/{}", fc_name, session_name),
                fc_dir: fc_name,
                session_dir: session_name,
                path: session_dir.display().to_string(),
                bbl_path: bbl_path
                    .exists()
                    .then(|| bbl_path.display().to_string()),
                manifest,
            });
        }
    }
    sessions
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
