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

use nalix_core::buffer::BufferPool;
use nalix_core::cipher::Suite;
use nalix_core::crc::crc32;
use nalix_core::packet::{Packet, PacketFlags};

/// Compress -> encrypt -> decrypt -> decompress, with a payload large
/// enough to land in the pooled allocator tier, exercising C1, C4 and C5
/// together the way a real connection's send/receive path does.
#[test]
fn large_packet_round_trips_through_compress_encrypt_decrypt_decompress() {
    let pool = BufferPool::new();
    let key = [42u8; 32];
    let aad = b"conn-17";

    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    let original = Packet::new(
        7,
        1,
        crc32(&payload),
        1_700_000_000_000,
        0,
        PacketFlags::empty(),
        3,
        &payload,
        &pool,
        256,
        65_536,
        1 << 22,
    )
    .unwrap();

    let compressed = original.compress(512).unwrap();
    assert!(compressed.flags().contains(PacketFlags::COMPRESSED));
    assert!(compressed.payload().len() < payload.len());

    let encrypted = compressed.encrypt(&key, Suite::ChaCha20Poly1305, aad).unwrap();
    assert!(encrypted.flags().contains(PacketFlags::ENCRYPTED));
    assert!(encrypted.flags().contains(PacketFlags::COMPRESSED));

    let decrypted = encrypted.decrypt(&key, aad).unwrap();
    assert!(!decrypted.flags().contains(PacketFlags::ENCRYPTED));

    let decompressed = decrypted.decompress().unwrap();
    assert!(!decompressed.flags().contains(PacketFlags::COMPRESSED));
    assert_eq!(decompressed.payload(), payload.as_slice());
    assert_eq!(decompressed.op_code(), 7);
    assert!(decompressed.is_valid_checksum());
}

/// The reverse order (encrypt before compress) is rejected by the flag
/// guard rather than silently compressing ciphertext, so the pipeline
/// only ever compresses plaintext.
#[test]
fn compressing_an_already_encrypted_packet_is_rejected() {
    let pool = BufferPool::new();
    let key = [1u8; 32];
    let payload = vec![b'x'; 4096];

    let packet = Packet::new(1, 1, crc32(&payload), 0, 0, PacketFlags::empty(), 0, &payload, &pool, 256, 65_536, 1 << 22)
        .unwrap();
    let encrypted = packet.encrypt(&key, Suite::Salsa20Poly1305, b"").unwrap();

    assert!(encrypted.compress(1).is_err());
}

/// A tampered ciphertext fails authentication under every suite, rather
/// than only the default, confirming the dispatcher wires AEAD
/// verification through uniformly.
#[test]
fn tampering_is_caught_by_decrypt_across_all_suites() {
    let pool = BufferPool::new();
    let key32 = [5u8; 32];
    let key16 = [5u8; 16];

    for (suite, key) in [
        (Suite::ChaCha20Poly1305, key32.as_slice()),
        (Suite::Salsa20Poly1305, key32.as_slice()),
        (Suite::SpeckPoly1305, key16.as_slice()),
        (Suite::XteaPoly1305, key16.as_slice()),
    ] {
        let payload = b"order: sell 10 shares".to_vec();
        let packet =
            Packet::new(2, 1, crc32(&payload), 0, 0, PacketFlags::empty(), 0, &payload, &pool, 256, 65_536, 1 << 20)
                .unwrap();

        let encrypted = packet.encrypt(key, suite, b"aad").unwrap();
        let mut tampered = encrypted.payload().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;

        let tampered_packet = Packet::new(
            encrypted.op_code(),
            encrypted.number(),
            encrypted.checksum(),
            encrypted.timestamp(),
            encrypted.type_(),
            encrypted.flags(),
            encrypted.priority(),
            &tampered,
            &pool,
            256,
            65_536,
            1 << 20,
        )
        .unwrap();

        assert!(tampered_packet.decrypt(key, b"aad").is_err(), "suite {:?} should reject a tampered envelope", suite);
    }
}
