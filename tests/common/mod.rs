// tests/common/mod.rs
//
// A scripted FlightController: serves flash content from a byte vector and
// fails on cue, so detector and orchestrator tests run without hardware.
#![allow(dead_code)]

use std::collections::VecDeque;

use bbsyncer::led::LedBackend;
use bbsyncer::msp::client::{FlashChunk, FlashSummary, FlightController};
use bbsyncer::msp::MspError;

fn timeout() -> MspError {
    MspError::Timeout { code: 0 }
}

pub struct ScriptedFc {
    pub api_version: Option<(u8, u8)>,
    pub variant: [u8; 4],
    pub uid: Option<String>,
    pub blackbox_device: Option<u8>,
    pub summary_flags: u8,
    pub total_size: u32,
    /// Flash content served to read requests; used_size in the summary.
    pub flash: Vec<u8>,
    /// Fail this many receive calls before serving again.
    pub fail_receives: u32,
    /// Report this address on every chunk regardless of the request.
    pub force_chunk_addr: Option<u32>,
    pub requests: VecDeque<(u32, u16)>,
    pub erase_called: bool,
    /// Whether an erase actually empties the flash (seen by later polls).
    pub erase_clears_flash: bool,
    erased: bool,
}

impl ScriptedFc {
    pub fn new(flash: Vec<u8>) -> Self {
        ScriptedFc {
            api_version: Some((1, 42)),
            variant: *b"BTFL",
            uid: Some("deadbeef12345678abcd1234".to_string()),
            blackbox_device: Some(1),
            summary_flags: 0x03,
            total_size: 8 * 1024 * 1024,
            flash,
            fail_receives: 0,
            force_chunk_addr: None,
            requests: VecDeque::new(),
            erase_called: false,
            erase_clears_flash: true,
            erased: false,
        }
    }
}

impl FlightController for ScriptedFc {
    fn get_api_version(&mut self) -> Result<(u8, u8), MspError> {
        self.api_version.ok_or_else(timeout)
    }

    fn get_fc_variant(&mut self) -> Result<[u8; 4], MspError> {
        Ok(self.variant)
    }

    fn get_uid(&mut self) -> Result<String, MspError> {
        self.uid.clone().ok_or_else(timeout)
    }

    fn get_blackbox_config(&mut self) -> Result<u8, MspError> {
        self.blackbox_device.ok_or_else(timeout)
    }

    fn get_dataflash_summary(&mut self) -> Result<FlashSummary, MspError> {
        let used = if self.erased { 0 } else { self.flash.len() as u32 };
        Ok(FlashSummary {
            flags: self.summary_flags,
            sectors: 512,
            total_size: self.total_size,
            used_size: used,
        })
    }

    fn send_flash_read_request(
        &mut self,
        address: u32,
        size: u16,
        _compression: bool,
    ) -> Result<(), MspError> {
        self.requests.push_back((address, size));
        Ok(())
    }

    fn receive_flash_read_response(&mut self) -> Result<FlashChunk, MspError> {
        let (address, size) = self.requests.pop_front().ok_or_else(timeout)?;
        if self.fail_receives > 0 {
            self.fail_receives -= 1;
            return Err(timeout());
        }
        let start = (address as usize).min(self.flash.len());
        let end = (start + size as usize).min(self.flash.len());
        Ok(FlashChunk {
            address: self.force_chunk_addr.unwrap_or(address),
            data: self.flash[start..end].to_vec(),
        })
    }

    fn erase_flash(&mut self) -> Result<(), MspError> {
        self.erase_called = true;
        if self.erase_clears_flash {
            self.erased = true;
        }
        Ok(())
    }
}

/// LED backend that goes nowhere; orchestrator tests only need a running
/// controller.
pub struct NullLed;

impl LedBackend for NullLed {
    fn set(&mut self, _on: bool) {}
}
