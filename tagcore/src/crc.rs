use crate::frame::{RawFrame, TechType};

/// CRC-A, ITU-T V.41 polynomial with preset 0x6363 (ISO/IEC 14443-3 type A).
pub const NFCA_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xC6C6,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xBF05,
    residue: 0x0000,
};

/// CRC-B, ISO/IEC 13239 with preset 0xFFFF and inverted output (type B).
pub const NFCB_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF,
    check: 0x906E,
    residue: 0xF0B8,
};

pub fn crc_a(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&NFCA_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

pub fn crc_b(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&NFCB_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

/// Verify the trailing little-endian CRC of a frame against its technology.
///
/// Frames shorter than three bytes cannot carry a CRC and always fail.
pub fn check_frame_crc(frame: &RawFrame) -> bool {
    let data = frame.data();
    if data.len() <= 2 {
        return false;
    }
    let payload = &data[..data.len() - 2];
    let stored = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
    let computed = match frame.tech_type() {
        TechType::NfcB => crc_b(payload),
        _ => crc_a(payload),
    };
    stored == computed
}

/// Odd parity check for one byte: returns true when `value` plus its parity
/// bit has an odd number of set bits.
pub fn check_odd_parity(value: u8, parity: u32) -> bool {
    (value.count_ones() + (parity & 1)) % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    #[test]
    fn crc_a_test_vectors() {
        // HLTA and RATS with their on-air CRC bytes
        assert_eq!(crc_a(&[0x50, 0x00]), 0xCD57);
        assert_eq!(crc_a(&[0xE0, 0x80]), 0x7331);
        assert_eq!(crc_a("123456789".as_bytes()), 0xBF05);
    }

    #[test]
    fn crc_b_test_vector() {
        assert_eq!(crc_b("123456789".as_bytes()), 0x906E);
    }

    #[test]
    fn frame_crc_round_trip() {
        let mut frame = RawFrame::new(TechType::NfcA, FrameType::Poll);
        frame.put_slice(&[0x50, 0x00, 0x57, 0xCD]);
        assert!(check_frame_crc(&frame));

        let mut bad = RawFrame::new(TechType::NfcA, FrameType::Poll);
        bad.put_slice(&[0x50, 0x00, 0x57, 0xCE]);
        assert!(!check_frame_crc(&bad));

        let mut short = RawFrame::new(TechType::NfcA, FrameType::Poll);
        short.put_slice(&[0x26]);
        assert!(!check_frame_crc(&short));
    }

    #[test]
    fn parity_is_odd_per_byte() {
        // population count of b ^ p must be odd for a clean byte
        assert!(check_odd_parity(0x00, 1));
        assert!(!check_odd_parity(0x00, 0));
        assert!(check_odd_parity(0x01, 0));
        assert!(check_odd_parity(0xFF, 1));
        for value in 0u8..=255 {
            let parity = (value.count_ones() + 1) % 2;
            assert!(check_odd_parity(value, parity));
            assert!(!check_odd_parity(value, parity ^ 1));
        }
    }
}
