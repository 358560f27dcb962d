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

//! XTEA, implemented directly from the reference algorithm since no
//! maintained RustCrypto crate covers it. Used with a 16-byte (128-bit)
//! key, reduced from 32 bytes by the envelope cipher dispatcher when a
//! 32-byte key is supplied.

const DELTA: u32 = 0x9E37_79B9;
pub const DEFAULT_ROUNDS: u32 = 32;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 8;

fn key_words(key: &[u8; KEY_LEN]) -> [u32; 4] {
    [
        u32::from_be_bytes(key[0..4].try_into().unwrap()),
        u32::from_be_bytes(key[4..8].try_into().unwrap()),
        u32::from_be_bytes(key[8..12].try_into().unwrap()),
        u32::from_be_bytes(key[12..16].try_into().unwrap()),
    ]
}

/// Encrypts a single 64-bit block in place, running `rounds` Feistel rounds.
pub fn encrypt_block(key: &[u8; KEY_LEN], rounds: u32, block: &mut [u8; BLOCK_LEN]) {
    let k = key_words(key);

    let mut v0 = u32::from_be_bytes(block[0..4].try_into().unwrap());
    let mut v1 = u32::from_be_bytes(block[4..8].try_into().unwrap());
    let mut sum: u32 = 0;

    for _ in 0..rounds {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ (sum.wrapping_add(k[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(k[((sum >> 11) & 3) as usize])),
        );
    }

    block[0..4].copy_from_slice(&v0.to_be_bytes());
    block[4..8].copy_from_slice(&v1.to_be_bytes());
}

/// Decrypts a single 64-bit block in place, running `rounds` Feistel rounds.
pub fn decrypt_block(key: &[u8; KEY_LEN], rounds: u32, block: &mut [u8; BLOCK_LEN]) {
    let k = key_words(key);

    let mut v0 = u32::from_be_bytes(block[0..4].try_into().unwrap());
    let mut v1 = u32::from_be_bytes(block[4..8].try_into().unwrap());
    let mut sum: u32 = DELTA.wrapping_mul(rounds);

    for _ in 0..rounds {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(k[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ (sum.wrapping_add(k[(sum & 3) as usize])),
        );
    }

    block[0..4].copy_from_slice(&v0.to_be_bytes());
    block[4..8].copy_from_slice(&v1.to_be_bytes());
}

/// Deterministically reduces a 32-byte key to the 16 bytes XTEA needs:
/// `out[i] = key[i] XOR key[i + 16]`.
pub fn reduce_key(key32: &[u8; 32]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    for i in 0..KEY_LEN {
        out[i] = key32[i] ^ key32[i + 16];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [0x7fu8; KEY_LEN];
        let original = *b"deadbeef";
        let mut block = original;

        encrypt_block(&key, DEFAULT_ROUNDS, &mut block);
        assert_ne!(block, original);

        decrypt_block(&key, DEFAULT_ROUNDS, &mut block);
        assert_eq!(block, original);
    }

    #[test]
    fn reduce_key_is_deterministic() {
        let key32 = [5u8; 32];
        assert_eq!(reduce_key(&key32), reduce_key(&key32));
        assert_eq!(reduce_key(&key32), [0u8; KEY_LEN]);
    }
}
