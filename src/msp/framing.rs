// src/msp/framing.rs
//
// =============================================================================
// BBSYNCER: MSP FRAME CODEC
// =============================================================================
//
// Wire formats:
//   v1: $M< size(1B) code(1B) payload[size] xor(1B)
//   v2: $X< flag(1B,0) code(2B LE) size(2B LE) payload[size] crc8-dvb-s2(1B)
//
// Encoding is two pure functions. Decoding is a byte-fed state machine:
// feed() consumes any slice, complete frames queue up internally, partial
// frames survive across calls. Garbage on the wire is normal (boot banners,
// CLI echoes), so any protocol violation silently resets the machine to
// idle and scanning resumes at the next '$'.

use std::collections::VecDeque;

use super::crc::{crc8_dvb_s2, crc8_xor};

pub const DIR_TO_FC: u8 = b'<';
pub const DIR_FROM_FC: u8 = b'>';
pub const DIR_ERROR: u8 = b'!';

/// A fully decoded MSP frame. Immutable after decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub direction: u8,
    pub code: u16,
    pub payload: Vec<u8>,
}

// ============================================================================
// 1. ENCODERS
// ============================================================================

/// Encode an MSP v1 request frame (to-FC direction). Payloads are capped at
/// 255 bytes by the size field.
pub fn encode_v1(code: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= 255);
    let size = payload.len() as u8;
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(b"$M<");
    out.push(size);
    out.push(code);
    out.extend_from_slice(payload);
    // checksum covers: size + code + payload
    out.push(crc8_xor(&out[3..]));
    out
}

/// Encode an MSP v2 request frame (to-FC direction).
pub fn encode_v2(code: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let size = payload.len() as u16;
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(b"$X<");
    out.push(0); // flag
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(payload);
    // CRC covers: flag + code(2) + size(2) + payload
    out.push(crc8_dvb_s2(&out[3..], 0));
    out
}

// ============================================================================
// 2. DECODER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ProtoMx,
    Direction,
    V1Len,
    V1Code,
    V1Payload,
    V1Checksum,
    V2Flag,
    V2CodeLo,
    V2CodeHi,
    V2LenLo,
    V2LenHi,
    V2Payload,
    V2Checksum,
}

/// Stateful MSP frame decoder. Feed bytes via [`FrameDecoder::feed`];
/// complete frames are queued and drained with [`FrameDecoder::pop_frame`].
pub struct FrameDecoder {
    frames: VecDeque<Frame>,
    state: State,
    version: u8,
    direction: u8,
    code: u16,
    size: usize,
    // Payload accumulator, sized once per frame when the length is known.
    payload: Vec<u8>,
    // Running XOR for v1; v2 batches its CRC at the checksum byte instead
    // so the lookup table carries the hot loop.
    checksum: u8,
    v2_header: [u8; 5],
    v2_header_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            frames: VecDeque::new(),
            state: State::Idle,
            version: 0,
            direction: 0,
            code: 0,
            size: 0,
            payload: Vec::new(),
            checksum: 0,
            v2_header: [0; 5],
            v2_header_len: 0,
        }
    }

    /// Consume a slice of wire bytes; any frames completed by it are queued.
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            self.process(b);
        }
    }

    /// Pop the oldest fully decoded frame, if any.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.version = 0;
        self.direction = 0;
        self.code = 0;
        self.size = 0;
        self.payload.clear();
        self.checksum = 0;
        self.v2_header_len = 0;
    }

    fn emit(&mut self) {
        self.frames.push_back(Frame {
            version: self.version,
            direction: self.direction,
            code: self.code,
            payload: std::mem::take(&mut self.payload),
        });
    }

    fn process(&mut self, b: u8) {
        match self.state {
            State::Idle => {
                if b == b'$' {
                    self.state = State::ProtoMx;
                }
            }
            State::ProtoMx => match b {
                b'M' => {
                    self.version = 1;
                    self.state = State::Direction;
                }
                b'X' => {
                    self.version = 2;
                    self.state = State::Direction;
                }
                _ => self.reset(),
            },
            State::Direction => {
                if b == DIR_TO_FC || b == DIR_FROM_FC || b == DIR_ERROR {
                    self.direction = b;
                    self.state = if self.version == 1 {
                        State::V1Len
                    } else {
                        State::V2Flag
                    };
                } else {
                    self.reset();
                }
            }

            // --- V1 ---
            State::V1Len => {
                self.size = b as usize;
                self.checksum = b; // XOR starts with the length byte
                self.state = State::V1Code;
            }
            State::V1Code => {
                self.code = b as u16;
                self.checksum ^= b;
                if self.size == 0 {
                    self.state = State::V1Checksum;
                } else {
                    self.payload.clear();
                    self.payload.reserve(self.size);
                    self.state = State::V1Payload;
                }
            }
            State::V1Payload => {
                self.payload.push(b);
                self.checksum ^= b;
                if self.payload.len() == self.size {
                    self.state = State::V1Checksum;
                }
            }
            State::V1Checksum => {
                if b == self.checksum {
                    self.emit();
                }
                // reset regardless of checksum validity
                self.reset();
            }

            // --- V2 ---
            State::V2Flag => {
                self.v2_header[0] = b;
                self.v2_header_len = 1;
                self.state = State::V2CodeLo;
            }
            State::V2CodeLo => {
                self.code = b as u16;
                self.push_v2_header(b);
                self.state = State::V2CodeHi;
            }
            State::V2CodeHi => {
                self.code |= (b as u16) << 8;
                self.push_v2_header(b);
                self.state = State::V2LenLo;
            }
            State::V2LenLo => {
                self.size = b as usize;
                self.push_v2_header(b);
                self.state = State::V2LenHi;
            }
            State::V2LenHi => {
                self.size |= (b as usize) << 8;
                self.push_v2_header(b);
                if self.size == 0 {
                    self.state = State::V2Checksum;
                } else {
                    self.payload.clear();
                    self.payload.reserve(self.size);
                    self.state = State::V2Payload;
                }
            }
            State::V2Payload => {
                self.payload.push(b);
                if self.payload.len() == self.size {
                    self.state = State::V2Checksum;
                }
            }
            State::V2Checksum => {
                let expected = crc8_dvb_s2(&self.payload, crc8_dvb_s2(&self.v2_header, 0));
                if b == expected {
                    self.emit();
                }
                self.reset();
            }
        }
    }

    fn push_v2_header(&mut self, b: u8) {
        self.v2_header[self.v2_header_len] = b;
        self.v2_header_len += 1;
    }
}
