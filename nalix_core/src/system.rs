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

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;

/// Provides a `Vec<u8>` of `n` random bytes. Uses the thread-local generator
/// of the `rand` crate.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// Performs an HMAC-SHA256 hash computation.
pub fn hash_hmac(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac: Hmac<Sha256> =
        Hmac::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(data);
    let hmac = mac.finalize();

    hmac.into_bytes().to_vec()
}

/// Derives a key from a passphrase and salt using PBKDF2-HMAC-SHA256, the
/// peripheral key derivation utility named alongside SRP-6 and Ed25519.
pub fn hash_pbkdf2<P: AsRef<[u8]>>(
    passphrase: P,
    salt: &[u8],
    rounds: u32,
    out_len: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2_hmac::<Sha256>(passphrase.as_ref(), salt, rounds, &mut out);
    out
}

/// Generates a fresh Ed25519 keypair, the peripheral signing utility named
/// alongside SRP-6 and PBKDF2. Not used by the SRP-6a handshake itself;
/// available for callers that need to sign data independent of a session.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Signs `message` with `key`.
pub fn sign_ed25519(key: &SigningKey, message: &[u8]) -> Signature {
    key.sign(message)
}

/// Verifies an Ed25519 signature against `key`.
pub fn verify_ed25519(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify(message, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_produces_requested_length() {
        assert_eq!(random_bytes(32).len(), 32);
        assert_eq!(random_bytes(0).len(), 0);
    }

    #[test]
    fn hmac_is_deterministic() {
        let a = hash_hmac(b"secret", b"data");
        let b = hash_hmac(b"secret", b"data");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn pbkdf2_is_deterministic_and_sized() {
        let a = hash_pbkdf2("passphrase", b"salt", 1000, 32);
        let b = hash_pbkdf2("passphrase", b"salt", 1000, 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn ed25519_signature_verifies_against_the_matching_key_only() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let sig = sign_ed25519(&key, b"order: buy 100 shares");

        assert!(verify_ed25519(&key.verifying_key(), b"order: buy 100 shares", &sig));
        assert!(!verify_ed25519(&other.verifying_key(), b"order: buy 100 shares", &sig));
    }
}
