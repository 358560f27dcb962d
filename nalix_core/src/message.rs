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

//! Wire messages exchanged between `nalix` and `nalixd`: SRP-6a handshake
//! frames, then framed packets once a connection is established.

use crate::cipher::Suite;
use crate::RemoteError;

use serde::{Deserialize, Serialize};

/// A handshake message. Serverbound unless noted; exchanged in strict
/// order (`Hello` -> `ServerChallenge` -> `ClientProof` -> `Accepted`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Start authentication, carrying the client's SRP public ephemeral.
    Hello(Hello),
    /// The verifier's salt and the server's public ephemeral. Clientbound.
    ServerChallenge(Result<ServerChallenge, RemoteError>),
    /// The client's identity proof derived from the shared session key.
    ClientProof(Result<ClientProof, RemoteError>),
    /// Authentication succeeded; the session key is now usable. Clientbound.
    Accepted(Result<Accepted, RemoteError>),
    /// Protocol error independent of the current state.
    Error(RemoteError),
}

/// Start authentication. Serverbound.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// The name the connecting node wants to authenticate as.
    pub node_name: String,
    /// Big-endian encoding of the client's SRP public ephemeral `A`.
    pub client_public: Vec<u8>,
}

/// The verifier's salt and the server's public ephemeral. Clientbound.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerChallenge {
    /// The salt used when the verifier was generated.
    pub salt: Vec<u8>,
    /// Big-endian encoding of the server's SRP public ephemeral `B`.
    pub server_public: Vec<u8>,
}

/// The client's identity proof. Serverbound.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientProof {
    /// `HMAC(session_key, salt)`.
    pub proof: Vec<u8>,
}

/// Authentication succeeded. Clientbound.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    /// The cipher suite the session's packets are encrypted under.
    pub suite: Suite,
}

/// A framed message exchanged after a successful handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FrameMessage {
    /// A packet on the wire, its header fields spelled out explicitly
    /// since [`crate::packet::Packet`] itself is not `Serialize` (it owns
    /// an allocator-backed buffer rather than a plain `Vec`).
    Packet(RawPacket),
    /// Keepalive; updates the peer's `last_ping_ms` without carrying data.
    Ping,
    /// Graceful shutdown, with an optional human-readable reason.
    Close(Option<String>),
    /// Protocol error independent of the current state.
    Error(RemoteError),
}

/// The on-wire representation of a [`crate::packet::Packet`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawPacket {
    pub op_code: u16,
    pub number: u16,
    pub checksum: u32,
    pub timestamp: u64,
    pub type_: u8,
    pub flags: u8,
    pub priority: u8,
    pub payload: Vec<u8>,
}
