// nalix_core is the main nalix library implementing the runtime shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! A single parameterized CRC engine covering the CRC-8/16/32/64 variants
//! named as peripheral utilities. CRC-32 is pinned to the packet checksum
//! contract (reversed polynomial, init/final-xor all-ones); the others use
//! their common reflected catalog parameters.

/// The Rocksoft-style parameter set describing a CRC variant.
pub struct CrcParams {
    pub width: u8,
    pub poly: u64,
    pub init: u64,
    pub refin: bool,
    pub refout: bool,
    pub xorout: u64,
}

pub const CRC8: CrcParams = CrcParams { width: 8, poly: 0x07, init: 0x00, refin: false, refout: false, xorout: 0x00 };
pub const CRC16_ARC: CrcParams =
    CrcParams { width: 16, poly: 0x8005, init: 0x0000, refin: true, refout: true, xorout: 0x0000 };
/// Reversed polynomial 0xEDB88320 (forward form 0x04C11DB7), init
/// 0xFFFFFFFF, final XOR 0xFFFFFFFF (one's complement). Matches the packet
/// checksum contract exactly.
pub const CRC32: CrcParams =
    CrcParams { width: 32, poly: 0x04C1_1DB7, init: 0xFFFF_FFFF, refin: true, refout: true, xorout: 0xFFFF_FFFF };
pub const CRC64_XZ: CrcParams = CrcParams {
    width: 64,
    poly: 0x42F0_E1EB_A9EA_3693,
    init: 0xFFFF_FFFF_FFFF_FFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF_FFFF_FFFF_FFFF,
};

fn reflect(mut x: u64, bits: u8) -> u64 {
    let mut r = 0u64;
    for _ in 0..bits {
        r = (r << 1) | (x & 1);
        x >>= 1;
    }
    r
}

fn width_mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Computes the CRC of `data` under `params`, returned in the low `width`
/// bits of a `u64`.
pub fn compute(params: &CrcParams, data: &[u8]) -> u64 {
    let mask = width_mask(params.width);
    let top_bit = 1u64 << (params.width - 1);
    let mut crc = params.init & mask;

    for &byte in data {
        let mut b = byte as u64;
        if params.refin {
            b = reflect(b, 8);
        }
        crc ^= b << (params.width - 8);

        for _ in 0..8 {
            crc = if crc & top_bit != 0 { (crc << 1) ^ params.poly } else { crc << 1 };
            crc &= mask;
        }
    }

    if params.refout {
        crc = reflect(crc, params.width);
    }

    (crc ^ params.xorout) & mask
}

pub fn crc8(data: &[u8]) -> u8 {
    compute(&CRC8, data) as u8
}

pub fn crc16(data: &[u8]) -> u16 {
    compute(&CRC16_ARC, data) as u16
}

/// The CRC-32 used by the packet pipeline's checksum field.
pub fn crc32(data: &[u8]) -> u32 {
    compute(&CRC32, data) as u32
}

pub fn crc64(data: &[u8]) -> u64 {
    compute(&CRC64_XZ, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_the_rfc_check_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_of_empty_input_is_zero() {
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn crc_variants_are_deterministic() {
        assert_eq!(crc8(b"nalix"), crc8(b"nalix"));
        assert_eq!(crc16(b"nalix"), crc16(b"nalix"));
        assert_eq!(crc64(b"nalix"), crc64(b"nalix"));
    }

    #[test]
    fn flipping_a_byte_changes_the_crc32() {
        let a = crc32(b"packet-payload");
        let b = crc32(b"Packet-payload");
        assert_ne!(a, b);
    }
}
