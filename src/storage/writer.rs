// src/storage/writer.rs
//
// =============================================================================
// BBSYNCER: STREAM WRITER
// =============================================================================
//
// Append-only file writer with a running SHA-256. After close, the file is
// re-read from disk and hashed again; the two digests must agree before
// the FC may be erased. Hashing twice catches what one pass cannot: RAM
// corruption, buffer overwrites, and partial writes.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const WRITE_BUFFER: usize = 256 * 1024;
const VERIFY_BLOCK: usize = 1 << 20;

pub struct StreamWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: Sha256,
    bytes_written: u64,
}

impl StreamWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StreamWriter {
            path: path.into(),
            file: None,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Create parent directories and open the file for writing.
    pub fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        self.file = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
        log::debug!("Opened output file {}", self.path.display());
        Ok(())
    }

    /// Append data and fold it into the running hash. Zero-length writes
    /// are no-ops.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .context("StreamWriter::write before open")?;
        file.write_all(data)?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush, fsync and close. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
            log::debug!(
                "Closed output file {} ({} bytes)",
                self.path.display(),
                self.bytes_written
            );
        }
        Ok(())
    }

    /// Close and delete the partial file.
    pub fn abort(&mut self) -> Result<()> {
        self.close()?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            log::warn!("Deleted partial file {}", self.path.display());
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hex digest of everything passed to `write` so far.
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Re-read the file from disk through a fresh SHA-256 and compare it
    /// to the streaming digest. Returns (match, disk_hash_hex).
    pub fn verify_against_file(&self) -> Result<(bool, String)> {
        let mut hasher = Sha256::new();
        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to re-open {}", self.path.display()))?;
        let mut block = vec![0u8; VERIFY_BLOCK];
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }
        let disk_sha256 = hex::encode(hasher.finalize());
        let streaming_sha256 = self.sha256_hex();
        let matches = disk_sha256 == streaming_sha256;
        if !matches {
            log::error!(
                "SHA-256 mismatch! streaming={} file={}",
                streaming_sha256,
                disk_sha256
            );
        }
        Ok((matches, disk_sha256))
    }
}
