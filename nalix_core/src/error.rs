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

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `CryptoError` indicates a failure in the envelope cipher dispatcher (C5).
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The requested suite id is not implemented by the dispatcher.
    #[error("Unsupported cipher suite id: {0}")]
    UnsupportedSuite(u8),
    /// The provided key does not have a length accepted by the suite.
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: &'static str, got: usize },
    /// The provided nonce does not match the suite's fixed nonce length.
    #[error("Invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    /// The envelope is too short to contain a valid header.
    #[error("Envelope shorter than header")]
    Truncated,
    /// The envelope's magic bytes do not match `NALX`.
    #[error("Envelope magic mismatch")]
    BadMagic,
    /// The envelope's version field is not supported.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    /// The envelope's declared framing (nonce length, total length) is inconsistent.
    #[error("Malformed envelope framing")]
    Malformed,
    /// An underlying AEAD or stream cipher operation failed.
    #[error("Cipher operation failed")]
    CipherFailure,
}

/// A `PacketError` indicates a failure in the packet pipeline (C1).
#[derive(Debug, Error)]
pub enum PacketError {
    /// The operation requires a non-empty payload.
    #[error("Payload is empty")]
    EmptyPayload,
    /// The operation requires a flag state the packet does not have.
    #[error("Packet is in the wrong flag state for this operation")]
    WrongFlagState,
    /// The packet exceeds `PacketSizeLimit` minus the header size.
    #[error("Payload exceeds the configured size limit")]
    TooLarge,
    /// Compressing the payload did not reduce its size.
    #[error("Compression did not reduce payload size")]
    NotBeneficial,
    /// The LZ4 frame header embedded in a compressed payload is invalid.
    #[error("Invalid LZ4 frame header")]
    InvalidLz4Header,
    /// The stored checksum does not match the CRC-32 of the payload.
    #[error("Checksum mismatch")]
    InvalidChecksum,
    /// Decryption failed authentication; see the cipher module's failure semantics.
    #[error("Decryption failed authentication")]
    DecryptionFailed,
    /// A lower-level cipher error occured.
    #[error("Cipher error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A `WheelError` indicates misuse of the hashed timing wheel (C3) lifecycle.
#[derive(Debug, Error)]
pub enum WheelError {
    /// `activate` was called on an already-active wheel.
    #[error("Timing wheel is already active")]
    AlreadyActive,
    /// `deactivate` was called on a wheel that was never activated.
    #[error("Timing wheel is not active")]
    NotActive,
}

/// An `AllocError` indicates a failure of the tiered buffer allocator (C4).
#[derive(Debug, Error)]
pub enum AllocError {
    /// The process-wide pool could not satisfy a rental request.
    #[error("Pool allocation failed")]
    PoolExhausted,
}

/// A `ConfigError` indicates a failure loading or saving a [`crate::config::RuntimeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The permissions on the configuration file are insecure.
    #[error("Insecure config permissions (limit access to the owning user!)")]
    InsecurePerms,
    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// A `NetworkError` indicates an error condition on a network connection.
/// It may be a low-level connection issue or a high-level protocol error.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A network reception represents an illegal state transition on the local node.
    #[error("Illegal state transition")]
    IllegalTransition,
    /// Mutual authentication failed or was rejected by the remote.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    /// No candidate addresses were available to connect to.
    #[error("No addresses to connect to")]
    NoAddrs,
    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    /// A bincode (de)serialization error occured.
    #[error("Bincode (de)serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// A packet pipeline error occured while framing or deframing.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    /// A cryptographic error occured during handshake.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A `RemoteError` indicates an error condition on the current session
/// or the remote node. Carried inside protocol messages rather than
/// thrown, so it can cross the wire via `bincode`.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// Access is denied by the remote node.
    #[error("Access denied by remote node")]
    AccessDenied,
    /// The remote node was denied access.
    #[error("Remote node is unauthorized")]
    Unauthorized,
    /// A network transmission represents an illegal state transition on the remote node.
    #[error("Illegal state transition on remote node")]
    IllegalTransition,
    /// The hub rejected the connection (capacity exceeded with no eviction candidate).
    #[error("Connection rejected: hub at capacity")]
    HubCapacityExceeded,
}

/// The top-level error type composing every subsystem's error enum,
/// used at binary and public-API boundaries.
#[derive(Debug, Error)]
pub enum NalixError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Wheel error: {0}")]
    Wheel(#[from] WheelError),
    #[error("Allocator error: {0}")]
    Alloc(#[from] AllocError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
