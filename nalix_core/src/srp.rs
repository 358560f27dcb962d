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

//! SRP-6a password-authenticated key exchange, a peripheral utility
//! alongside CRC and PBKDF2. Uses the RFC 5054 2048-bit group and SHA-256.

use num_bigint_dig::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};

use crate::system::random_bytes;

/// RFC 5054 2048-bit safe prime `N`.
const N_HEX: &str = "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B855F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773BCA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB694B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";
const G: u64 = 2;

fn n() -> BigUint {
    BigUint::parse_bytes(N_HEX.as_bytes(), 16).expect("N_HEX is a valid hex literal")
}

fn g() -> BigUint {
    BigUint::from(G)
}

fn h(parts: &[&[u8]]) -> BigUint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    BigUint::from_bytes_be(&hasher.finalize())
}

/// `k = H(N | PAD(g))`, the SRP-6a multiplier.
fn k() -> BigUint {
    let n = n();
    let mut g_bytes = g().to_bytes_be();
    let mut padded = vec![0u8; n.to_bytes_be().len() - g_bytes.len()];
    padded.append(&mut g_bytes);
    h(&[&n.to_bytes_be(), &padded])
}

/// Server-side verifier material stored instead of a plaintext password.
pub struct Verifier {
    pub salt: Vec<u8>,
    pub verifier: BigUint,
}

/// Derives `x = H(salt | H(username | ":" | password))` and the
/// corresponding verifier `v = g^x mod N`.
pub fn generate_verifier(username: &str, password: &str, salt: Option<Vec<u8>>) -> Verifier {
    let salt = salt.unwrap_or_else(|| random_bytes(16));
    let x = private_key(username, password, &salt);
    let verifier = g().modpow(&x, &n());

    Verifier { salt, verifier }
}

fn private_key(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let inner = h(&[username.as_bytes(), b":", password.as_bytes()]);
    h(&[salt, &inner.to_bytes_be()])
}

/// One side's ephemeral key pair: a private scalar and its public value.
pub struct Ephemeral {
    pub private: BigUint,
    pub public: BigUint,
}

/// Generates the client's ephemeral pair `a`, `A = g^a mod N`.
pub fn client_ephemeral() -> Ephemeral {
    let private = BigUint::from_bytes_be(&random_bytes(32));
    let public = g().modpow(&private, &n());
    Ephemeral { private, public }
}

/// Generates the server's ephemeral pair `b`, `B = k*v + g^b mod N`.
pub fn server_ephemeral(verifier: &BigUint) -> Ephemeral {
    let private = BigUint::from_bytes_be(&random_bytes(32));
    let public = (k() * verifier + g().modpow(&private, &n())) % n();
    Ephemeral { private, public }
}

fn scrambler(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    h(&[&a_pub.to_bytes_be(), &b_pub.to_bytes_be()])
}

/// Computes the client's session key `K = H(S)` where
/// `S = (B - k*g^x)^(a + u*x) mod N`.
pub fn client_session_key(
    username: &str,
    password: &str,
    salt: &[u8],
    client: &Ephemeral,
    server_public: &BigUint,
) -> Result<Vec<u8>, crate::CryptoError> {
    let n = n();
    if server_public.is_zero() || server_public % &n == BigUint::zero() {
        return Err(crate::CryptoError::Malformed);
    }

    let x = private_key(username, password, salt);
    let u = scrambler(&client.public, server_public);
    let gx = g().modpow(&x, &n);
    let base = (server_public + &n * &k() - (k() * gx) % &n) % &n;
    let exponent = &client.private + &u * &x;
    let s = base.modpow(&exponent, &n);

    Ok(h(&[&s.to_bytes_be()]).to_bytes_be())
}

/// Computes the server's session key `K = H(S)` where `S = (A * v^u)^b mod N`.
pub fn server_session_key(
    client_public: &BigUint,
    server: &Ephemeral,
    verifier: &BigUint,
) -> Result<Vec<u8>, crate::CryptoError> {
    let n = n();
    if client_public.is_zero() || client_public % &n == BigUint::zero() {
        return Err(crate::CryptoError::Malformed);
    }

    let u = scrambler(client_public, &server.public);
    let s = ((client_public * verifier.modpow(&u, &n)) % &n).modpow(&server.private, &n);

    Ok(h(&[&s.to_bytes_be()]).to_bytes_be())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_derive_the_same_session_key() {
        let verifier = generate_verifier("alice", "hunter2", None);
        let client = client_ephemeral();
        let server = server_ephemeral(&verifier.verifier);

        let client_key =
            client_session_key("alice", "hunter2", &verifier.salt, &client, &server.public).unwrap();
        let server_key = server_session_key(&client.public, &server, &verifier.verifier).unwrap();

        assert_eq!(client_key, server_key);
    }

    #[test]
    fn wrong_password_yields_a_different_session_key() {
        let verifier = generate_verifier("alice", "hunter2", None);
        let client = client_ephemeral();
        let server = server_ephemeral(&verifier.verifier);

        let client_key =
            client_session_key("alice", "wrong-password", &verifier.salt, &client, &server.public).unwrap();
        let server_key = server_session_key(&client.public, &server, &verifier.verifier).unwrap();

        assert_ne!(client_key, server_key);
    }

    #[test]
    fn zero_public_value_is_rejected() {
        let verifier = generate_verifier("alice", "hunter2", None);
        let server = server_ephemeral(&verifier.verifier);
        let result = server_session_key(&BigUint::zero(), &server, &verifier.verifier);
        assert!(result.is_err());
    }
}
