// src/sync.rs
//
// =============================================================================
// BBSYNCER: SYNC ORCHESTRATOR
// =============================================================================
//
// The 10-step pipeline:
//   1. Open serial            6. Stream flash read -> file  [LED=SYNCING]
//   2. Identify FC            7. Verify integrity           [LED=VERIFYING]
//   3. Query flash state      8. Write manifest
//   4. Check host storage     9. Erase FC flash             [LED=ERASING]
//   5. Prepare output        10. Signal result
//
// The one rule that outranks everything else: the FC is never erased
// unless the byte count matches and the re-read SHA-256 equals the
// streaming SHA-256.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::disk;
use crate::fc::detect_fc;
use crate::led::{LedController, LedState};
use crate::msp::client::{FlightController, MspClient};
use crate::storage::manifest::{make_session_dir, update_manifest_erase, write_manifest};
use crate::storage::writer::StreamWriter;
use crate::storage::RAW_FLASH_FILENAME;

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const ERASE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// 1. RESULT & SHARED STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Success,
    AlreadyEmpty,
    Error,
    DryRun,
}

impl SyncResult {
    pub fn exit_code(self) -> i32 {
        match self {
            SyncResult::Success | SyncResult::AlreadyEmpty | SyncResult::DryRun => 0,
            SyncResult::Error => 1,
        }
    }
}

/// Snapshot of the sync state, polled by the web UI.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: String,
    pub progress: u8,
}

/// Single-writer / many-reader handle to the current status. The
/// orchestrator writes; the web server only reads.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<Status>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        StatusHandle {
            inner: Arc::new(Mutex::new(Status {
                state: "idle".to_string(),
                progress: 0,
            })),
        }
    }

    pub fn set(&self, state: &str, progress: u8) {
        let mut status = self.inner.lock().unwrap();
        status.state = state.to_string();
        status.progress = progress;
    }

    pub fn snapshot(&self) -> Status {
        self.inner.lock().unwrap().clone()
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 2. THE ORCHESTRATOR
// ============================================================================

pub struct SyncOrchestrator<'a> {
    config: &'a Config,
    led: &'a LedController,
    status: StatusHandle,
    dry_run: bool,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        led: &'a LedController,
        status: StatusHandle,
        dry_run: bool,
    ) -> Self {
        SyncOrchestrator {
            config,
            led,
            status,
            dry_run,
        }
    }

    /// Step 1: open the serial port, then run the pipeline. The port is
    /// released on every exit path when the client drops.
    pub fn run(&self, port: &str) -> SyncResult {
        let timeout = Duration::from_secs_f64(self.config.serial_timeout);
        let mut client = match MspClient::open(port, self.config.serial_baud, timeout) {
            Ok(client) => client,
            Err(e) => {
                log::error!("Failed to open serial port {}: {}", port, e);
                return self.fail();
            }
        };
        self.run_session(&mut client)
    }

    /// Steps 2-10 against an already-open flight controller link.
    pub fn run_session(&self, fc: &mut dyn FlightController) -> SyncResult {
        match self.execute(fc) {
            Ok(result) => result,
            Err(e) => {
                log::error!("Unexpected error during sync: {:#}", e);
                self.fail()
            }
        }
    }

    fn fail(&self) -> SyncResult {
        self.led.set_state(LedState::ErrorGeneral);
        self.status.set("error", 0);
        SyncResult::Error
    }

    fn execute(&self, fc: &mut dyn FlightController) -> Result<SyncResult> {
        let cfg = self.config;

        // --- Step 2: Identify FC ---
        log::info!("Step 2: Identifying FC");
        self.status.set("identifying", 0);
        let fc_info = match detect_fc(fc) {
            Ok(info) => info,
            Err(e) => {
                // NotBetaflight / SdCardBlackbox / handshake failure are
                // all terminal for this session.
                log::error!("{}", e);
                return Ok(self.fail());
            }
        };
        log::info!(
            "FC identified: variant={} uid={}",
            fc_info.variant_str(),
            fc_info.uid
        );

        // --- Step 3: Query flash state ---
        log::info!("Step 3: Querying flash state");
        self.status.set("querying", 0);
        let summary = match fc.get_dataflash_summary() {
            Ok(summary) => summary,
            Err(e) => {
                log::error!("Failed to get flash summary: {}", e);
                return Ok(self.fail());
            }
        };
        log::info!(
            "Flash: supported={} ready={} used={} total={}",
            summary.supported(),
            summary.ready(),
            summary.used_size,
            summary.total_size
        );

        if !summary.supported() {
            log::error!("FC flash not supported");
            return Ok(self.fail());
        }
        if !summary.ready() {
            log::error!("FC flash not ready (may be busy)");
            return Ok(self.fail());
        }

        let used_size = summary.used_size as u64;
        if used_size == 0 {
            log::info!("Flash is empty, nothing to sync");
            self.led.set_state(LedState::AlreadyEmpty);
            self.status.set("idle", 0);
            return Ok(SyncResult::AlreadyEmpty);
        }

        // --- Step 4: Check host storage ---
        log::info!("Step 4: Checking host storage");
        std::fs::create_dir_all(&cfg.storage_path)
            .with_context(|| format!("Failed to create {}", cfg.storage_path.display()))?;
        let required_mb = used_size as f64 / (1024.0 * 1024.0) + cfg.min_free_space_mb as f64;
        let available_mb = disk::free_mb(&cfg.storage_path)?;
        log::info!(
            "Storage: required={:.1} MB available={:.1} MB",
            required_mb,
            available_mb
        );
        if available_mb < required_mb {
            log::error!(
                "Insufficient storage: {:.1} MB available, {:.1} MB required",
                available_mb,
                required_mb
            );
            return Ok(self.fail());
        }

        // --- Step 5: Prepare output ---
        log::info!("Step 5: Preparing output directory");
        let session_dir = make_session_dir(&cfg.storage_path, &fc_info)?;
        let mut writer = StreamWriter::new(session_dir.join(RAW_FLASH_FILENAME));
        writer.open()?;

        // --- Step 6: Stream flash read ---
        log::info!("Step 6: Reading {} bytes from flash", used_size);
        self.led.set_state(LedState::Syncing);
        self.status.set("syncing", 0);

        if let Err(e) = self.stream_flash(fc, &mut writer, used_size) {
            log::error!("Flash read aborted: {:#}", e);
            let _ = writer.abort();
            return Ok(self.fail());
        }

        writer.close()?;
        log::info!("Flash read complete: {} bytes written", writer.bytes_written());

        // --- Step 7: Verify integrity ---
        log::info!("Step 7: Verifying integrity");
        self.led.set_state(LedState::Verifying);
        self.status.set("verifying", 0);

        if writer.bytes_written() != used_size {
            log::error!(
                "Size mismatch: wrote {} bytes, expected {}",
                writer.bytes_written(),
                used_size
            );
            return Ok(self.fail());
        }

        let (hashes_match, file_sha256) = writer.verify_against_file()?;
        if !hashes_match {
            log::error!("SHA-256 verification failed, NOT erasing FC flash");
            return Ok(self.fail());
        }
        log::info!("Integrity OK, SHA-256: {}", file_sha256);

        // --- Step 8: Write manifest ---
        log::info!("Step 8: Writing manifest");
        write_manifest(&session_dir, &fc_info, &file_sha256, used_size, false, false)?;

        if self.dry_run {
            log::info!("DRY RUN, skipping erase");
            self.led.set_state(LedState::Success);
            self.status.set("idle", 0);
            return Ok(SyncResult::DryRun);
        }

        if !cfg.erase_after_sync {
            log::info!("erase_after_sync=false, skipping erase");
            self.led.set_state(LedState::Success);
            self.status.set("idle", 0);
            return Ok(SyncResult::Success);
        }

        // --- Step 9: Erase FC flash ---
        log::info!("Step 9: Erasing FC flash");
        self.led.set_state(LedState::Erasing);
        self.status.set("erasing", 0);

        let erase_ok = self.wait_for_erase(fc)?;
        update_manifest_erase(&session_dir, erase_ok);

        if !erase_ok {
            log::error!("Flash erase did not complete within timeout");
            return Ok(self.fail());
        }
        log::info!("Flash erase confirmed");

        // --- Step 10: Signal result ---
        log::info!("Step 10: Sync complete");
        self.led.set_state(LedState::Success);
        self.status.set("idle", 0);
        Ok(SyncResult::Success)
    }

    /// Pipelined read loop: the next window's request is on the wire
    /// before the current chunk hits the disk, overlapping serial and
    /// disk I/O. One request in flight at a time.
    fn stream_flash(
        &self,
        fc: &mut dyn FlightController,
        writer: &mut StreamWriter,
        used_size: u64,
    ) -> Result<()> {
        let cfg = self.config;
        let compression = cfg.flash_read_compression;
        // The MSP size field is 16 bits.
        let chunk_size = cfg.flash_chunk_size.min(u16::MAX as u32) as u64;
        let window = |addr: u64| chunk_size.min(used_size - addr) as u16;

        let mut address: u64 = 0;
        let mut consecutive_errors: u32 = 0;

        // Prime the pipeline.
        fc.send_flash_read_request(address as u32, window(address), compression)?;

        while address < used_size {
            let chunk = match fc.receive_flash_read_response() {
                Ok(chunk) => chunk,
                Err(e) => {
                    consecutive_errors += 1;
                    log::warn!(
                        "Flash read error at {:#010x} (attempt {}/{}): {}",
                        address,
                        consecutive_errors,
                        MAX_CONSECUTIVE_ERRORS,
                        e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        bail!("too many consecutive read errors");
                    }
                    std::thread::sleep(READ_RETRY_DELAY);
                    fc.send_flash_read_request(address as u32, window(address), compression)?;
                    continue;
                }
            };

            if chunk.address as u64 != address {
                consecutive_errors += 1;
                log::warn!(
                    "Address mismatch: expected {:#010x} got {:#010x}, retrying",
                    address,
                    chunk.address
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    bail!("too many address mismatches");
                }
                fc.send_flash_read_request(address as u32, window(address), compression)?;
                continue;
            }

            if chunk.data.is_empty() {
                log::info!("FC returned 0 bytes at {:#010x}, end of data", address);
                break;
            }

            consecutive_errors = 0;

            // Pipeline: request the next window BEFORE touching the disk.
            let next_address = address + chunk.data.len() as u64;
            if next_address < used_size {
                fc.send_flash_read_request(next_address as u32, window(next_address), compression)?;
            }

            writer.write(&chunk.data)?;
            address = next_address;

            let progress = (address * 100 / used_size) as u8;
            self.status.set("syncing", progress);
            if address % (chunk_size * 64) < chunk_size {
                log::debug!(
                    "Read {:#010x} / {:#010x} ({}%)",
                    address,
                    used_size,
                    progress
                );
            }
        }
        Ok(())
    }

    /// Send the erase command, then poll the summary until the flash
    /// reports empty-and-ready or the timeout passes. Poll failures are
    /// expected while the FC is busy erasing.
    fn wait_for_erase(&self, fc: &mut dyn FlightController) -> Result<bool> {
        fc.erase_flash()?;
        let deadline = Instant::now() + Duration::from_secs(self.config.erase_timeout_sec);
        while Instant::now() < deadline {
            std::thread::sleep(ERASE_POLL_INTERVAL);
            let summary = match fc.get_dataflash_summary() {
                Ok(summary) => summary,
                Err(e) => {
                    log::warn!("Error polling flash summary during erase: {}", e);
                    continue;
                }
            };
            log::debug!(
                "Erase poll: used={} ready={}",
                summary.used_size,
                summary.ready()
            );
            if summary.used_size == 0 && summary.ready() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// 3. PORT AUTO-DETECTION
// ============================================================================

/// First /dev/ttyACM* the serial enumeration reports, or None. Betaflight
/// FCs show up as CDC-ACM devices.
pub fn auto_detect_port() -> Option<String> {
    let mut ports: Vec<String> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| name.starts_with("/dev/ttyACM"))
        .collect();
    ports.sort();
    let port = ports.into_iter().next()?;
    log::info!("Auto-detected port: {}", port);
    Some(port)
}
