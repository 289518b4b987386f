// src/msp/mod.rs
//
// =============================================================================
// BBSYNCER: MSP PROTOCOL ENGINE
// =============================================================================
//
// Everything that speaks MultiWii Serial Protocol lives under this module:
// checksums, the Huffman payload decoder, the frame codec, and the
// request/response client. Only the client and its data types are consumed
// by the rest of the crate; raw frames never leave this module tree in
// normal operation.

pub mod client;
pub mod crc;
pub mod framing;
pub mod huffman;

use thiserror::Error;

// -----------------------------------------------------------------------------
// Command codes (the subset of MSP this tool needs)
// -----------------------------------------------------------------------------

pub const MSP_API_VERSION: u16 = 1;
pub const MSP_FC_VARIANT: u16 = 2;
pub const MSP_DATAFLASH_SUMMARY: u16 = 70;
pub const MSP_DATAFLASH_ERASE: u16 = 71;
pub const MSP_DATAFLASH_READ: u16 = 72;
pub const MSP_BLACKBOX_CONFIG: u16 = 80;
pub const MSP_UID: u16 = 160;

// -----------------------------------------------------------------------------
// Payload constants
// -----------------------------------------------------------------------------

pub const DATAFLASH_FLAG_SUPPORTED: u8 = 0x01;
pub const DATAFLASH_FLAG_READY: u8 = 0x02;
pub const DATAFLASH_COMPRESSION_HUFFMAN: u8 = 1;

pub const BLACKBOX_DEVICE_NONE: u8 = 0;
pub const BLACKBOX_DEVICE_FLASH: u8 = 1;
pub const BLACKBOX_DEVICE_SDCARD: u8 = 2;

pub const BTFL_VARIANT: &[u8; 4] = b"BTFL";

// -----------------------------------------------------------------------------
// Error type
// -----------------------------------------------------------------------------

/// Failures of the MSP transaction layer. Bad frames never surface here:
/// the decoder drops them silently and callers observe a timeout instead.
#[derive(Debug, Error)]
pub enum MspError {
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for MSP response code={code}")]
    Timeout { code: u16 },

    #[error("short {what} response (len={len})")]
    ShortResponse { what: &'static str, len: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("flash chunk decompression: {0}")]
    Huffman(#[from] huffman::HuffmanError),
}
