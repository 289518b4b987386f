// src/msp/crc.rs
//
// =============================================================================
// BBSYNCER: MSP CHECKSUMS
// =============================================================================
//
// Two checksum flavours, one per protocol generation:
//   v1: running XOR over size + code + payload
//   v2: CRC8-DVB-S2 (poly 0xD5) over flag + code(2B) + size(2B) + payload
//
// Both are allocation-free and endian-independent. The DVB-S2 variant is
// table-driven: flash reads sustain tens of KB/s and the per-bit loop was
// the hottest path in profiling.

// -----------------------------------------------------------------------------
// CRC8-DVB-S2 lookup table (compile-time)
// -----------------------------------------------------------------------------

const POLY: u8 = 0xD5;

const fn build_dvb_s2_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static DVB_S2_TABLE: [u8; 256] = build_dvb_s2_table();

// -----------------------------------------------------------------------------
// Public functions
// -----------------------------------------------------------------------------

/// XOR checksum used by MSP v1 frames.
pub fn crc8_xor(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// CRC8-DVB-S2 checksum used by MSP v2 frames.
///
/// `initial` chains a computation across several slices:
/// `crc8_dvb_s2(b, crc8_dvb_s2(a, 0))` equals `crc8_dvb_s2(a ++ b, 0)`.
pub fn crc8_dvb_s2(data: &[u8], initial: u8) -> u8 {
    data.iter()
        .fold(initial, |crc, b| DVB_S2_TABLE[(crc ^ b) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bitwise reference implementation, straight from the DVB-S2 definition.
    fn dvb_s2_bitwise(data: &[u8], initial: u8) -> u8 {
        let mut crc = initial;
        for &b in data {
            crc ^= b;
            for _ in 0..8 {
                if crc & 0x80 != 0 {
                    crc = (crc << 1) ^ POLY;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn xor_empty_is_zero() {
        assert_eq!(crc8_xor(&[]), 0);
    }

    #[test]
    fn xor_folds_from_zero() {
        assert_eq!(crc8_xor(&[0x05]), 0x05);
        assert_eq!(crc8_xor(&[1, 1]), 0);
        // MSP_API_VERSION request: size=0, code=1
        assert_eq!(crc8_xor(&[0, 1]), 1);
    }

    #[test]
    fn dvb_s2_table_matches_bitwise() {
        let data: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        assert_eq!(crc8_dvb_s2(&data, 0), dvb_s2_bitwise(&data, 0));
        assert_eq!(crc8_dvb_s2(b"", 0), 0);
        assert_eq!(crc8_dvb_s2(&[0x00], 0), 0x00);
    }

    #[test]
    fn dvb_s2_chaining() {
        let header = [0u8, 100, 0, 2, 0];
        let payload = [0xAB, 0xCD];
        let mut whole = header.to_vec();
        whole.extend_from_slice(&payload);
        let chained = crc8_dvb_s2(&payload, crc8_dvb_s2(&header, 0));
        assert_eq!(chained, crc8_dvb_s2(&whole, 0));
    }

    #[test]
    fn dvb_s2_byte_at_a_time() {
        let data = [0x01, 0x02, 0x03, 0x40, 0x00];
        let bulk = crc8_dvb_s2(&data, 0);
        let mut incremental = 0;
        for b in data {
            incremental = crc8_dvb_s2(&[b], incremental);
        }
        assert_eq!(bulk, incremental);
    }
}
