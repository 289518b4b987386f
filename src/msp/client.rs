// src/msp/client.rs
//
// =============================================================================
// BBSYNCER: MSP CLIENT
// =============================================================================
//
// Request/response over a serial byte stream, plus the high-level commands
// the sync pipeline needs. Owns the port and one frame decoder; designed
// for a single caller thread (the orchestrator). Not thread-safe.
//
// Flash reads are split into send/receive halves on purpose: the
// orchestrator keeps one request in flight while the previous chunk is
// written to disk.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use super::framing::{encode_v1, encode_v2, Frame, FrameDecoder, DIR_FROM_FC};
use super::huffman::huffman_decode;
use super::{
    MspError, DATAFLASH_COMPRESSION_HUFFMAN, DATAFLASH_FLAG_READY, DATAFLASH_FLAG_SUPPORTED,
    MSP_API_VERSION, MSP_BLACKBOX_CONFIG, MSP_DATAFLASH_ERASE, MSP_DATAFLASH_READ,
    MSP_DATAFLASH_SUMMARY, MSP_FC_VARIANT, MSP_UID,
};

const READ_CHUNK: usize = 4096;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// 1. DATA TYPES
// ============================================================================

/// Decoded MSP_DATAFLASH_SUMMARY payload.
#[derive(Debug, Clone, Copy)]
pub struct FlashSummary {
    pub flags: u8,
    pub sectors: u32,
    pub total_size: u32,
    pub used_size: u32,
}

impl FlashSummary {
    pub fn supported(&self) -> bool {
        self.flags & DATAFLASH_FLAG_SUPPORTED != 0
    }

    pub fn ready(&self) -> bool {
        self.flags & DATAFLASH_FLAG_READY != 0
    }
}

/// One decoded MSP_DATAFLASH_READ response window.
#[derive(Debug, Clone)]
pub struct FlashChunk {
    pub address: u32,
    pub data: Vec<u8>,
}

// ============================================================================
// 2. THE FC INTERFACE (The Contract)
// ============================================================================

/// The commands the detector and orchestrator run against a flight
/// controller. `MspClient` is the production implementation; tests script
/// their own.
pub trait FlightController {
    fn get_api_version(&mut self) -> Result<(u8, u8), MspError>;
    fn get_fc_variant(&mut self) -> Result<[u8; 4], MspError>;
    fn get_uid(&mut self) -> Result<String, MspError>;
    fn get_blackbox_config(&mut self) -> Result<u8, MspError>;
    fn get_dataflash_summary(&mut self) -> Result<FlashSummary, MspError>;
    fn send_flash_read_request(
        &mut self,
        address: u32,
        size: u16,
        compression: bool,
    ) -> Result<(), MspError>;
    fn receive_flash_read_response(&mut self) -> Result<FlashChunk, MspError>;
    fn erase_flash(&mut self) -> Result<(), MspError>;
}

// ============================================================================
// 3. THE CLIENT
// ============================================================================

pub struct MspClient {
    port: Box<dyn SerialPort>,
    decoder: FrameDecoder,
    // Frames indexed by code; responses for other codes stay cached until
    // someone asks for them.
    pending: HashMap<u16, Frame>,
    timeout: Duration,
}

impl MspClient {
    /// Open the serial port (8N1, no flow control) with a short poll
    /// timeout so `receive` can interleave deadline checks.
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, MspError> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| MspError::Io(std::io::Error::new(ErrorKind::Other, e)))?;
        log::debug!("Opened serial port {} at {} baud", path, baud);
        Ok(MspClient {
            port,
            decoder: FrameDecoder::new(),
            pending: HashMap::new(),
            timeout,
        })
    }

    // ------------------------------------------------------------------
    // Low-level send/receive
    // ------------------------------------------------------------------

    /// Send an MSP request. Uses a v1 frame; codes or payloads too big for
    /// the v1 single-byte fields go out as v2.
    pub fn send(&mut self, code: u16, payload: &[u8]) -> Result<(), MspError> {
        if code > 255 || payload.len() > 255 {
            return self.send_v2(code, payload);
        }
        let frame = encode_v1(code as u8, payload);
        log::trace!("TX v1 code={} payload_len={}", code, payload.len());
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Send an MSP v2 request (16-bit code and size fields).
    pub fn send_v2(&mut self, code: u16, payload: &[u8]) -> Result<(), MspError> {
        let frame = encode_v2(code, payload);
        log::trace!("TX v2 code={} payload_len={}", code, payload.len());
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Block until a from-FC frame for `code` arrives or the deadline
    /// passes. Frames for other codes are cached for later pickup.
    pub fn receive(&mut self, code: u16) -> Result<Frame, MspError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.port.read(&mut buf) {
                // EOF (device unplugged): back off until the deadline.
                Ok(0) => std::thread::sleep(Duration::from_millis(10)),
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            self.drain_decoder();
            if let Some(frame) = self.pending.remove(&code) {
                log::trace!("RX code={} payload_len={}", code, frame.payload.len());
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(MspError::Timeout { code });
            }
        }
    }

    /// Send a request and wait for the matching response, discarding any
    /// stale frames for the same code first.
    pub fn request(&mut self, code: u16, payload: &[u8]) -> Result<Frame, MspError> {
        self.discard_stale(code);
        self.send(code, payload)?;
        self.receive(code)
    }

    /// Move decoded frames into the pending index. Only from-FC frames are
    /// kept; requests echoed back and error directions are dropped here.
    fn drain_decoder(&mut self) {
        while let Some(frame) = self.decoder.pop_frame() {
            if frame.direction == DIR_FROM_FC {
                self.pending.insert(frame.code, frame);
            }
        }
    }

    fn discard_stale(&mut self, code: u16) {
        self.drain_decoder();
        self.pending.remove(&code);
    }
}

impl Drop for MspClient {
    fn drop(&mut self) {
        log::debug!("Closing serial port");
    }
}

// ============================================================================
// 4. HIGH-LEVEL COMMANDS
// ============================================================================

impl FlightController for MspClient {
    /// Returns (api_major, api_minor).
    fn get_api_version(&mut self) -> Result<(u8, u8), MspError> {
        let frame = self.request(MSP_API_VERSION, &[])?;
        if frame.payload.len() < 3 {
            return Err(MspError::ShortResponse {
                what: "API_VERSION",
                len: frame.payload.len(),
            });
        }
        // payload: protocol_version(1) + api_major(1) + api_minor(1) + ...
        Ok((frame.payload[1], frame.payload[2]))
    }

    /// Returns the 4-byte firmware variant tag, e.g. b"BTFL".
    fn get_fc_variant(&mut self) -> Result<[u8; 4], MspError> {
        let frame = self.request(MSP_FC_VARIANT, &[])?;
        if frame.payload.len() < 4 {
            return Err(MspError::ShortResponse {
                what: "FC_VARIANT",
                len: frame.payload.len(),
            });
        }
        let mut variant = [0u8; 4];
        variant.copy_from_slice(&frame.payload[..4]);
        Ok(variant)
    }

    /// Returns the FC unique ID as 24 lowercase hex chars, or "unknown"
    /// when the FC answers short.
    fn get_uid(&mut self) -> Result<String, MspError> {
        let frame = self.request(MSP_UID, &[])?;
        if frame.payload.len() < 12 {
            return Ok("unknown".to_string());
        }
        Ok(hex::encode(&frame.payload[..12]))
    }

    /// Returns the blackbox device type byte.
    fn get_blackbox_config(&mut self) -> Result<u8, MspError> {
        let frame = self.request(MSP_BLACKBOX_CONFIG, &[])?;
        if frame.payload.is_empty() {
            return Err(MspError::ShortResponse {
                what: "BLACKBOX_CONFIG",
                len: 0,
            });
        }
        Ok(frame.payload[0])
    }

    fn get_dataflash_summary(&mut self) -> Result<FlashSummary, MspError> {
        let frame = self.request(MSP_DATAFLASH_SUMMARY, &[])?;
        parse_flash_summary(&frame.payload)
    }

    /// Queue a flash read without waiting for the answer. Stale cached
    /// responses are dropped first so a retry after an address mismatch
    /// cannot pick up a frame from the abandoned window.
    fn send_flash_read_request(
        &mut self,
        address: u32,
        size: u16,
        compression: bool,
    ) -> Result<(), MspError> {
        self.discard_stale(MSP_DATAFLASH_READ);
        let mut payload = Vec::with_capacity(7);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        payload.push(u8::from(compression));
        self.send(MSP_DATAFLASH_READ, &payload)
    }

    /// Await the next flash read response and decode it. Decompression is
    /// driven by the response's own compression byte, not by what was
    /// requested.
    fn receive_flash_read_response(&mut self) -> Result<FlashChunk, MspError> {
        let frame = self.receive(MSP_DATAFLASH_READ)?;
        parse_flash_read_response(&frame.payload)
    }

    /// Fire-and-forget: the FC starts erasing and does not reliably reply.
    fn erase_flash(&mut self) -> Result<(), MspError> {
        self.send(MSP_DATAFLASH_ERASE, &[])?;
        log::info!("Sent DATAFLASH_ERASE command");
        Ok(())
    }
}

// ============================================================================
// 5. PAYLOAD PARSERS
// ============================================================================

/// Decode `B I I I` (LE): flags, sectors, total_size, used_size.
pub fn parse_flash_summary(payload: &[u8]) -> Result<FlashSummary, MspError> {
    if payload.len() < 13 {
        return Err(MspError::ShortResponse {
            what: "DATAFLASH_SUMMARY",
            len: payload.len(),
        });
    }
    let summary = FlashSummary {
        flags: payload[0],
        sectors: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        total_size: u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]),
        used_size: u32::from_le_bytes([payload[9], payload[10], payload[11], payload[12]]),
    };
    if summary.used_size > summary.total_size {
        return Err(MspError::Protocol(format!(
            "flash used_size {} exceeds total_size {}",
            summary.used_size, summary.total_size
        )));
    }
    Ok(summary)
}

/// Decode addr(4B LE) + data_size(2B LE) + comp_type(1B) + data[data_size].
/// Huffman-compressed data carries a 2-byte char count header.
pub fn parse_flash_read_response(payload: &[u8]) -> Result<FlashChunk, MspError> {
    if payload.len() < 7 {
        return Err(MspError::ShortResponse {
            what: "DATAFLASH_READ",
            len: payload.len(),
        });
    }
    let address = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let data_size = u16::from_le_bytes([payload[4], payload[5]]) as usize;
    let compression_type = payload[6];
    if payload.len() < 7 + data_size {
        return Err(MspError::ShortResponse {
            what: "DATAFLASH_READ",
            len: payload.len(),
        });
    }
    let raw = &payload[7..7 + data_size];

    let data = if compression_type == DATAFLASH_COMPRESSION_HUFFMAN {
        if raw.len() < 2 {
            return Err(MspError::ShortResponse {
                what: "DATAFLASH_READ char count",
                len: raw.len(),
            });
        }
        let char_count = u16::from_le_bytes([raw[0], raw[1]]);
        huffman_decode(&raw[2..], char_count)?
    } else {
        raw.to_vec()
    };

    Ok(FlashChunk { address, data })
}
