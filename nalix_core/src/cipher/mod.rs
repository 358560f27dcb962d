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

//! The envelope cipher dispatcher (C5): a unified AEAD / stream-CTR wire
//! format (`header || nonce || ciphertext [|| tag]`) over eight suites,
//! dispatched by a plain `match` on a `repr(u8)` enum rather than a trait
//! object, so the branch predictor sees a fixed, small jump table.

pub mod speck;
pub mod xtea;

use cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use poly1305::{universal_hash::UniversalHash, Key as PolyKey, Poly1305};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::CryptoError;

pub const MAGIC: [u8; 4] = *b"NALX";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// The eight cipher suites the dispatcher supports. Values are part of the
/// wire format; never renumber an existing variant.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Suite {
    ChaCha20 = 0,
    Salsa20 = 1,
    Speck = 2,
    Xtea = 3,
    ChaCha20Poly1305 = 4,
    Salsa20Poly1305 = 5,
    SpeckPoly1305 = 6,
    XteaPoly1305 = 7,
}

impl Suite {
    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        Ok(match id {
            0 => Suite::ChaCha20,
            1 => Suite::Salsa20,
            2 => Suite::Speck,
            3 => Suite::Xtea,
            4 => Suite::ChaCha20Poly1305,
            5 => Suite::Salsa20Poly1305,
            6 => Suite::SpeckPoly1305,
            7 => Suite::XteaPoly1305,
            other => return Err(CryptoError::UnsupportedSuite(other)),
        })
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Suite::ChaCha20 | Suite::ChaCha20Poly1305 => 12,
            Suite::Salsa20 | Suite::Salsa20Poly1305 => 8,
            Suite::Speck | Suite::SpeckPoly1305 => 16,
            Suite::Xtea | Suite::XteaPoly1305 => 8,
        }
    }

    pub fn is_aead(self) -> bool {
        matches!(
            self,
            Suite::ChaCha20Poly1305 | Suite::Salsa20Poly1305 | Suite::SpeckPoly1305 | Suite::XteaPoly1305
        )
    }

    fn block_len(self) -> usize {
        match self {
            Suite::ChaCha20 | Suite::ChaCha20Poly1305 | Suite::Salsa20 | Suite::Salsa20Poly1305 => 64,
            Suite::Speck | Suite::SpeckPoly1305 => speck::BLOCK_LEN,
            Suite::Xtea | Suite::XteaPoly1305 => xtea::BLOCK_LEN,
        }
    }

    /// Number of this suite's native blocks the 32-byte Poly1305 one-time
    /// key consumes, so AEAD data encryption can start on a fresh block.
    fn key_blocks(self) -> u32 {
        ((32 + self.block_len() - 1) / self.block_len()) as u32
    }
}

/// The fixed 12-byte little-endian envelope header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub suite_id: u8,
    pub flags: u8,
    pub nonce_len: u8,
    pub seq: u32,
}

impl EnvelopeHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = self.version;
        out[5] = self.suite_id;
        out[6] = self.flags;
        out[7] = self.nonce_len;
        out[8..12].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_LEN {
            return Err(CryptoError::Truncated);
        }
        if bytes[0..4] != MAGIC {
            return Err(CryptoError::BadMagic);
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            suite_id: bytes[5],
            flags: bytes[6],
            nonce_len: bytes[7],
            seq: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// Validates `key` against `suite`'s accepted lengths, reducing XTEA's
/// 32-byte form to its native 16-byte key. The reduction is a temporary
/// key derivative (spec: "Temporary key reductions ... are zeroed after
/// use"), so the result is wrapped in `Zeroizing` all the way back to the
/// caller rather than handed back as a plain `Vec<u8>`.
fn validate_key(suite: Suite, key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match suite {
        Suite::ChaCha20 | Suite::ChaCha20Poly1305 => {
            if key.len() != 32 {
                return Err(CryptoError::InvalidKeyLength { expected: "32", got: key.len() });
            }
            Ok(Zeroizing::new(key.to_vec()))
        }
        Suite::Salsa20 | Suite::Salsa20Poly1305 => {
            if key.len() != 16 && key.len() != 32 {
                return Err(CryptoError::InvalidKeyLength { expected: "16 or 32", got: key.len() });
            }
            Ok(Zeroizing::new(key.to_vec()))
        }
        Suite::Speck | Suite::SpeckPoly1305 => {
            if key.len() != speck::KEY_LEN {
                return Err(CryptoError::InvalidKeyLength { expected: "16", got: key.len() });
            }
            Ok(Zeroizing::new(key.to_vec()))
        }
        Suite::Xtea | Suite::XteaPoly1305 => match key.len() {
            16 => Ok(Zeroizing::new(key.to_vec())),
            32 => {
                let arr: [u8; 32] = key.try_into().expect("length checked");
                Ok(Zeroizing::new(xtea::reduce_key(&arr).to_vec()))
            }
            got => Err(CryptoError::InvalidKeyLength { expected: "16 or 32", got }),
        },
    }
}

fn chacha20_apply(key: &[u8], nonce: &[u8], block_seq: u32, buf: &mut [u8]) {
    let mut c =
        chacha20::ChaCha20::new_from_slices(key, nonce).expect("key/nonce length validated by caller");
    c.seek(block_seq as u64 * 64);
    c.apply_keystream(buf);
}

fn salsa20_apply(key: &[u8], nonce: &[u8], block_seq: u32, buf: &mut [u8]) {
    let mut c =
        salsa20::Salsa20::new_from_slices(key, nonce).expect("key/nonce length validated by caller");
    c.seek(block_seq as u64 * 64);
    c.apply_keystream(buf);
}

fn speck_ctr_apply(key: &[u8], nonce: &[u8], block_seq: u32, buf: &mut [u8]) {
    let key: [u8; speck::KEY_LEN] = key.try_into().expect("key validated by caller");
    let nonce_low = u64::from_le_bytes(nonce[0..8].try_into().expect("nonce_len == 16"));
    let nonce_high = u64::from_le_bytes(nonce[8..16].try_into().expect("nonce_len == 16"));
    let base = ((nonce_high as u128) << 64 | nonce_low as u128).wrapping_add(block_seq as u128);

    for (i, chunk) in buf.chunks_mut(speck::BLOCK_LEN).enumerate() {
        let counter_val = base.wrapping_add(i as u128);
        let low = counter_val as u64;
        let high = (counter_val >> 64) as u64;

        let mut block = [0u8; speck::BLOCK_LEN];
        block[0..8].copy_from_slice(&low.to_le_bytes());
        block[8..16].copy_from_slice(&high.to_le_bytes());
        speck::encrypt_block(&key, &mut block);

        for (b, k) in chunk.iter_mut().zip(block.iter()) {
            *b ^= k;
        }
    }
}

fn xtea_ctr_apply(key: &[u8], nonce: &[u8], block_seq: u32, buf: &mut [u8]) {
    let key: [u8; xtea::KEY_LEN] = key.try_into().expect("key validated by caller");
    let nonce_val = u64::from_le_bytes(nonce.try_into().expect("nonce_len == 8"));
    let base = nonce_val.wrapping_add(block_seq as u64);

    for (i, chunk) in buf.chunks_mut(xtea::BLOCK_LEN).enumerate() {
        let counter_val = base.wrapping_add(i as u64);
        let mut block = counter_val.to_le_bytes();
        xtea::encrypt_block(&key, xtea::DEFAULT_ROUNDS, &mut block);

        for (b, k) in chunk.iter_mut().zip(block.iter()) {
            *b ^= k;
        }
    }
}

fn apply_stream(suite: Suite, key: &[u8], nonce: &[u8], block_seq: u32, buf: &mut [u8]) {
    match suite {
        Suite::ChaCha20 | Suite::ChaCha20Poly1305 => chacha20_apply(key, nonce, block_seq, buf),
        Suite::Salsa20 | Suite::Salsa20Poly1305 => salsa20_apply(key, nonce, block_seq, buf),
        Suite::Speck | Suite::SpeckPoly1305 => speck_ctr_apply(key, nonce, block_seq, buf),
        Suite::Xtea | Suite::XteaPoly1305 => xtea_ctr_apply(key, nonce, block_seq, buf),
    }
}

fn derive_poly_key(suite: Suite, key: &[u8], nonce: &[u8], seq: u32) -> [u8; 32] {
    let mut block = [0u8; 32];
    apply_stream(suite, key, nonce, seq, &mut block);
    block
}

fn poly1305_tag(one_time_key: &[u8; 32], aad: &[u8], ciphertext: &[u8]) -> [u8; 16] {
    let mut mac = Poly1305::new(PolyKey::from_slice(one_time_key));
    mac.update_padded(aad);
    mac.update_padded(ciphertext);

    let mut lengths = [0u8; 16];
    lengths[0..8].copy_from_slice(&(aad.len() as u64).to_le_bytes());
    lengths[8..16].copy_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    mac.update_padded(&lengths);

    mac.finalize().into()
}

/// Encrypts `plaintext` under `key` with `suite`, producing a full
/// self-describing envelope. `seq` seeds both the header's sequence field
/// and the initial keystream counter; a random one is chosen if omitted.
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    suite: Suite,
    aad: &[u8],
    seq: Option<u32>,
) -> Result<Vec<u8>, CryptoError> {
    let key = validate_key(suite, key)?;

    let nonce_len = suite.nonce_len();
    let mut nonce = vec![0u8; nonce_len];
    rand::thread_rng().fill_bytes(&mut nonce);

    let seq = seq.unwrap_or_else(|| rand::thread_rng().next_u32());

    let header = EnvelopeHeader {
        version: VERSION,
        suite_id: suite.id(),
        flags: if suite.is_aead() { 0b0000_0001 } else { 0 },
        nonce_len: nonce_len as u8,
        seq,
    };
    let header_bytes = header.to_bytes();

    let mut ciphertext = plaintext.to_vec();

    if suite.is_aead() {
        let data_seq = seq.wrapping_add(suite.key_blocks());
        apply_stream(suite, &key, &nonce, data_seq, &mut ciphertext);
    } else {
        apply_stream(suite, &key, &nonce, seq, &mut ciphertext);
    }

    let tag_len = if suite.is_aead() { TAG_LEN } else { 0 };
    let mut out = Vec::with_capacity(HEADER_LEN + nonce_len + ciphertext.len() + tag_len);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    if suite.is_aead() {
        let full_aad: Vec<u8> = header_bytes.iter().chain(nonce.iter()).chain(aad.iter()).copied().collect();
        let one_time_key = derive_poly_key(suite, &key, &nonce, seq);
        let tag = poly1305_tag(&one_time_key, &full_aad, &ciphertext);
        out.extend_from_slice(&tag);
    }

    Ok(out)
}

/// Parses and decrypts an envelope. On any parse or authentication
/// failure, returns `(false, vec![])`: the caller never sees a partially
/// decrypted or unauthenticated plaintext.
pub fn decrypt(key: &[u8], envelope: &[u8], aad: &[u8]) -> (bool, Vec<u8>) {
    match try_decrypt(key, envelope, aad) {
        Ok(plaintext) => (true, plaintext),
        Err(_) => (false, Vec::new()),
    }
}

fn try_decrypt(key: &[u8], envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let header = EnvelopeHeader::parse(envelope)?;
    let suite = Suite::from_id(header.suite_id)?;

    if header.nonce_len as usize != suite.nonce_len() {
        return Err(CryptoError::Malformed);
    }

    let nonce_start = HEADER_LEN;
    let nonce_end = nonce_start + suite.nonce_len();
    let tag_len = if suite.is_aead() { TAG_LEN } else { 0 };

    if envelope.len() < nonce_end + tag_len {
        return Err(CryptoError::Malformed);
    }

    let nonce = &envelope[nonce_start..nonce_end];
    let ciphertext_end = envelope.len() - tag_len;
    let ciphertext = &envelope[nonce_end..ciphertext_end];

    let key = validate_key(suite, key)?;

    if suite.is_aead() {
        let tag = &envelope[ciphertext_end..];
        let full_aad: Vec<u8> = envelope[0..nonce_end].iter().chain(aad.iter()).copied().collect();
        let one_time_key = derive_poly_key(suite, &key, nonce, header.seq);
        let expected_tag = poly1305_tag(&one_time_key, &full_aad, ciphertext);

        if expected_tag.ct_eq(tag).unwrap_u8() != 1 {
            return Err(CryptoError::CipherFailure);
        }

        let mut plaintext = ciphertext.to_vec();
        let data_seq = header.seq.wrapping_add(suite.key_blocks());
        apply_stream(suite, &key, nonce, data_seq, &mut plaintext);
        Ok(plaintext)
    } else {
        let mut plaintext = ciphertext.to_vec();
        apply_stream(suite, &key, nonce, header.seq, &mut plaintext);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(suite: Suite, key: &[u8]) {
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let aad = b"connection-42";

        let envelope = encrypt(key, plaintext, suite, aad, Some(7)).unwrap();
        let (ok, decrypted) = decrypt(key, &envelope, aad);

        assert!(ok, "suite {:?} failed to round-trip", suite);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn all_suites_round_trip() {
        round_trip(Suite::ChaCha20, &[1u8; 32]);
        round_trip(Suite::Salsa20, &[2u8; 32]);
        round_trip(Suite::Speck, &[3u8; 16]);
        round_trip(Suite::Xtea, &[4u8; 16]);
        round_trip(Suite::ChaCha20Poly1305, &[5u8; 32]);
        round_trip(Suite::Salsa20Poly1305, &[6u8; 16]);
        round_trip(Suite::SpeckPoly1305, &[7u8; 16]);
        round_trip(Suite::XteaPoly1305, &[8u8; 16]);
    }

    #[test]
    fn xtea_accepts_32_byte_key_and_reduces_it() {
        round_trip(Suite::Xtea, &[9u8; 32]);
        round_trip(Suite::XteaPoly1305, &[9u8; 32]);
    }

    #[test]
    fn flipping_a_byte_of_an_aead_envelope_fails_authentication() {
        let key = [1u8; 32];
        let mut envelope = encrypt(&key, b"payload", Suite::ChaCha20Poly1305, b"", Some(1)).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;

        let (ok, plaintext) = decrypt(&key, &envelope, b"");
        assert!(!ok);
        assert!(plaintext.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut envelope = vec![0u8; HEADER_LEN + 12];
        envelope[0] = b'X';
        let (ok, _) = decrypt(&[1u8; 32], &envelope, b"");
        assert!(!ok);
    }

    #[test]
    fn wrong_key_length_is_an_encrypt_error() {
        let result = encrypt(&[1u8; 10], b"hi", Suite::ChaCha20, b"", None);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength { .. })));
    }
}
