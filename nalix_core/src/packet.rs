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

//! The packet pipeline (C1): an immutable packet value plus the
//! compress/decompress and encrypt/decrypt steps that each produce a new
//! packet rather than mutating one in place.

use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::{BufferPool, OwnedBuffer};
use crate::cipher::{self, Suite};
use crate::crc::crc32;
use crate::error::PacketError;

/// `op(2) + number(2) + checksum(4) + timestamp(8) + type(1) + flags(1) + priority(1)`.
pub const HEADER_SIZE: usize = 19;
/// Size of the length prefix `lz4_flex::compress_prepend_size` embeds.
pub const LZ4_HEADER_SIZE: usize = 4;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        const ENCRYPTED  = 0b0000_0010;
    }
}

/// An immutable packet. Every pipeline step returns a new `Packet`; none
/// mutate the one they were called on.
pub struct Packet {
    op_code: u16,
    number: u16,
    checksum: u32,
    timestamp: u64,
    type_: u8,
    flags: PacketFlags,
    priority: u8,
    payload: OwnedBuffer,
    pool: Arc<BufferPool>,
    stack_alloc_limit: usize,
    heap_alloc_limit: usize,
    packet_size_limit: usize,
}

impl Packet {
    /// Copies `payload_bytes` through the tiered allocator into a new
    /// packet. `checksum` is whatever the caller supplies; use
    /// [`crc32`](crate::crc::crc32) to compute one, or pass the result
    /// straight through for validation by [`Packet::is_valid_checksum`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op_code: u16,
        number: u16,
        checksum: u32,
        timestamp: u64,
        type_: u8,
        flags: PacketFlags,
        priority: u8,
        payload_bytes: &[u8],
        pool: &Arc<BufferPool>,
        stack_alloc_limit: usize,
        heap_alloc_limit: usize,
        packet_size_limit: usize,
    ) -> Result<Self, PacketError> {
        if payload_bytes.len() > packet_size_limit.saturating_sub(HEADER_SIZE) {
            return Err(PacketError::TooLarge);
        }

        let payload = OwnedBuffer::allocate(payload_bytes, pool, stack_alloc_limit, heap_alloc_limit);

        Ok(Self {
            op_code,
            number,
            checksum,
            timestamp,
            type_,
            flags,
            priority,
            payload,
            pool: Arc::clone(pool),
            stack_alloc_limit,
            heap_alloc_limit,
            packet_size_limit,
        })
    }

    pub fn op_code(&self) -> u16 {
        self.op_code
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn type_(&self) -> u8 {
        self.type_
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Compares the stored checksum against the CRC-32 of the payload.
    pub fn is_valid_checksum(&self) -> bool {
        self.checksum == crc32(self.payload.as_slice())
    }

    fn with_payload(&self, payload_bytes: &[u8], flags: PacketFlags) -> Self {
        Self {
            op_code: self.op_code,
            number: self.number,
            checksum: crc32(payload_bytes),
            timestamp: self.timestamp,
            type_: self.type_,
            flags,
            priority: self.priority,
            payload: OwnedBuffer::allocate(payload_bytes, &self.pool, self.stack_alloc_limit, self.heap_alloc_limit),
            pool: Arc::clone(&self.pool),
            stack_alloc_limit: self.stack_alloc_limit,
            heap_alloc_limit: self.heap_alloc_limit,
            packet_size_limit: self.packet_size_limit,
        }
    }

    /// Compresses the payload via LZ4, gated on a minimum size so small
    /// payloads that wouldn't shrink never pay the round trip.
    pub fn compress(&self, compress_min_bytes: usize) -> Result<Self, PacketError> {
        if self.payload.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        if self.flags.contains(PacketFlags::ENCRYPTED) {
            return Err(PacketError::WrongFlagState);
        }
        if self.payload.len() < compress_min_bytes {
            return Err(PacketError::NotBeneficial);
        }

        let compressed = lz4_flex::block::compress_prepend_size(self.payload.as_slice());
        if compressed.len() >= self.payload.len() {
            return Err(PacketError::NotBeneficial);
        }

        Ok(self.with_payload(&compressed, self.flags | PacketFlags::COMPRESSED))
    }

    /// Decompresses an LZ4-compressed payload back to its original bytes.
    pub fn decompress(&self) -> Result<Self, PacketError> {
        if self.payload.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        if !self.flags.contains(PacketFlags::COMPRESSED) {
            return Err(PacketError::WrongFlagState);
        }
        if self.payload.len() < LZ4_HEADER_SIZE {
            return Err(PacketError::InvalidLz4Header);
        }

        let decoded = lz4_flex::block::decompress_size_prepended(self.payload.as_slice())
            .map_err(|_| PacketError::InvalidLz4Header)?;

        Ok(self.with_payload(&decoded, self.flags - PacketFlags::COMPRESSED))
    }

    /// Encrypts the payload under `key` with the chosen suite, producing
    /// an envelope (see [`crate::cipher`]) as the new payload.
    pub fn encrypt(&self, key: &[u8], suite: Suite, aad: &[u8]) -> Result<Self, PacketError> {
        if self.payload.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        if self.flags.contains(PacketFlags::ENCRYPTED) {
            return Err(PacketError::WrongFlagState);
        }

        let envelope = cipher::encrypt(key, self.payload.as_slice(), suite, aad, None)?;

        Ok(self.with_payload(&envelope, self.flags | PacketFlags::ENCRYPTED))
    }

    /// Decrypts an encrypted payload. Leaves `self` untouched on failure;
    /// the caller gets a `PacketError` rather than a mutated packet.
    pub fn decrypt(&self, key: &[u8], aad: &[u8]) -> Result<Self, PacketError> {
        if self.payload.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        if !self.flags.contains(PacketFlags::ENCRYPTED) {
            return Err(PacketError::WrongFlagState);
        }

        let (ok, plaintext) = cipher::decrypt(key, self.payload.as_slice(), aad);
        if !ok {
            return Err(PacketError::DecryptionFailed);
        }

        Ok(self.with_payload(&plaintext, self.flags - PacketFlags::ENCRYPTED))
    }
}

impl Clone for Packet {
    /// Produces an independent packet with a freshly allocated payload
    /// copy, re-run through the tiered allocator rather than sharing the
    /// original's backing storage.
    fn clone(&self) -> Self {
        self.with_payload(self.payload.as_slice(), self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(pool: &Arc<BufferPool>, payload: &[u8]) -> Packet {
        Packet::new(1, 1, crc32(payload), 0, 0, PacketFlags::empty(), 0, payload, pool, 256, 65536, 1_048_576)
            .unwrap()
    }

    #[test]
    fn construction_computes_a_checksum_that_validates() {
        let pool = BufferPool::new();
        let packet = make(&pool, b"hello, nalix");
        assert!(packet.is_valid_checksum());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pool = BufferPool::new();
        let result = Packet::new(1, 1, 0, 0, 0, PacketFlags::empty(), 0, &vec![0u8; 100], &pool, 256, 65536, 50);
        assert!(matches!(result, Err(PacketError::TooLarge)));
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let pool = BufferPool::new();
        let payload = vec![b'a'; 2048];
        let packet = make(&pool, &payload);

        let compressed = packet.compress(512).unwrap();
        assert!(compressed.flags().contains(PacketFlags::COMPRESSED));
        assert!(compressed.payload().len() < payload.len());

        let decompressed = compressed.decompress().unwrap();
        assert!(!decompressed.flags().contains(PacketFlags::COMPRESSED));
        assert_eq!(decompressed.payload(), payload.as_slice());
    }

    #[test]
    fn compress_refuses_when_not_beneficial() {
        let pool = BufferPool::new();
        let payload = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let packet = make(&pool, &payload);
        let result = packet.compress(1);
        assert!(matches!(result, Err(PacketError::NotBeneficial)));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let pool = BufferPool::new();
        let payload = b"order: buy 100 shares";
        let packet = make(&pool, payload);
        let key = [9u8; 32];

        let encrypted = packet.encrypt(&key, Suite::ChaCha20Poly1305, b"conn-1").unwrap();
        assert!(encrypted.flags().contains(PacketFlags::ENCRYPTED));

        let decrypted = encrypted.decrypt(&key, b"conn-1").unwrap();
        assert_eq!(decrypted.payload(), payload);
    }

    #[test]
    fn decrypt_with_tampered_envelope_fails_without_mutating_state() {
        let pool = BufferPool::new();
        let packet = make(&pool, b"order: sell 50 shares");
        let key = [3u8; 32];

        let mut encrypted = packet.encrypt(&key, Suite::ChaCha20Poly1305, b"").unwrap();
        let tampered_payload: Vec<u8> = encrypted.payload().to_vec();
        let mut tampered_payload = tampered_payload;
        let last = tampered_payload.len() - 1;
        tampered_payload[last] ^= 1;
        encrypted = encrypted.with_payload(&tampered_payload, encrypted.flags());

        let result = encrypted.decrypt(&key, b"");
        assert!(matches!(result, Err(PacketError::DecryptionFailed)));
    }

    #[test]
    fn empty_payload_refuses_compression_and_encryption() {
        let pool = BufferPool::new();
        let packet = make(&pool, b"");
        assert!(matches!(packet.compress(1), Err(PacketError::EmptyPayload)));
        assert!(matches!(packet.encrypt(&[0u8; 32], Suite::ChaCha20, b""), Err(PacketError::EmptyPayload)));
    }

    #[test]
    fn clone_produces_an_independent_payload_copy() {
        let pool = BufferPool::new();
        let packet = make(&pool, b"shared nothing");
        let cloned = packet.clone();
        assert_eq!(packet.payload(), cloned.payload());
    }
}
