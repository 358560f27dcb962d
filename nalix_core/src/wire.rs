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

//! TCP transport: SRP-6a mutual authentication producing a session key,
//! then length-framed [`FrameMessage`]s carrying packets.

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::ops::DerefMut;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use num_bigint_dig::BigUint;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::buffer::BufferPool;
use crate::cipher::Suite;
use crate::message::{Accepted, ClientProof, FrameMessage, Hello, HandshakeMessage, RawPacket, ServerChallenge};
use crate::packet::{Packet, PacketFlags};
use crate::srp::{self, Ephemeral, Verifier};
use crate::system;
use crate::{NetworkError, RemoteError};

pub const DEFAULT_PORT: u16 = 20406;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// An unauthenticated, client-initiated connection attempt.
pub struct NalixConn {
    stream: TcpStream,
}

impl NalixConn {
    /// Shorthand for `NalixConn::from(TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)?)`.
    pub fn new(addr: &SocketAddr) -> Result<Self, NetworkError> {
        Ok(TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)?.into())
    }

    /// Iterates candidate addresses until one connects, for dual-stack lookups.
    pub fn new_first_success<A>(addrs: A) -> Result<Self, NetworkError>
    where
        A: Iterator<Item = SocketAddr> + ExactSizeIterator + Clone,
    {
        for addr in addrs.clone() {
            match Self::new(&addr) {
                Ok(conn) => return Ok(conn),
                Err(e) if addrs.len() == 0 => return Err(e),
                _ => {}
            }
        }

        Err(NetworkError::NoAddrs)
    }

    /// Runs the SRP-6a client handshake, consuming `self`. On success the
    /// session's key is `H(S)`, the SRP premaster secret hashed with
    /// SHA-256 (see [`crate::srp`]) — 32 bytes, used directly as the
    /// packet pipeline's cipher key.
    pub fn authenticate(self, node_name: String, password: &str, suite: Suite) -> Result<Session, NetworkError> {
        let client = srp::client_ephemeral();

        self.send_handshake(&HandshakeMessage::Hello(Hello {
            node_name: node_name.clone(),
            client_public: client.public.to_bytes_be(),
        }))?;

        let challenge = match self.recv_handshake()? {
            HandshakeMessage::ServerChallenge(challenge) => challenge?,
            _ => {
                self.send_handshake(&HandshakeMessage::Error(RemoteError::IllegalTransition))?;
                return Err(NetworkError::IllegalTransition);
            }
        };

        let server_public = BigUint::from_bytes_be(&challenge.server_public);
        let key = srp::client_session_key(&node_name, password, &challenge.salt, &client, &server_public)?;
        let proof = system::hash_hmac(&key, &challenge.salt);

        self.send_handshake(&HandshakeMessage::ClientProof(Ok(ClientProof { proof })))?;

        match self.recv_handshake()? {
            HandshakeMessage::Accepted(accepted) => {
                let accepted = accepted?;
                Session::new(self.stream, key, accepted.suite, node_name)
            }
            _ => Err(NetworkError::IllegalTransition),
        }
    }

    fn send_handshake(&self, message: &HandshakeMessage) -> Result<(), NetworkError> {
        let buf = bincode::serialize(message)?;
        (&self.stream).write_all(&buf)?;
        Ok(())
    }

    fn recv_handshake(&self) -> Result<HandshakeMessage, NetworkError> {
        Ok(bincode::deserialize_from(&self.stream)?)
    }
}

impl From<TcpStream> for NalixConn {
    fn from(stream: TcpStream) -> Self {
        Self { stream }
    }
}

/// The server side of an unauthenticated connection attempt, accepted by
/// `nalixd`'s listen loop.
pub struct NalixServ {
    stream: TcpStream,
}

impl NalixServ {
    /// Runs the SRP-6a server handshake, consuming `self`. `find_verifier`
    /// looks up the stored [`Verifier`] for a claimed node name.
    pub fn authenticate(
        self,
        find_verifier: impl FnOnce(&str) -> Option<Verifier>,
        suite: Suite,
    ) -> Result<(Session, String), NetworkError> {
        let hello = match self.recv_handshake()? {
            HandshakeMessage::Hello(hello) => hello,
            _ => {
                self.send_handshake(&HandshakeMessage::ServerChallenge(Err(RemoteError::IllegalTransition)))?;
                return Err(NetworkError::IllegalTransition);
            }
        };

        let verifier = match find_verifier(&hello.node_name) {
            Some(v) => v,
            None => {
                self.send_handshake(&HandshakeMessage::ServerChallenge(Err(RemoteError::AccessDenied)))?;
                return Err(RemoteError::Unauthorized.into());
            }
        };

        let server: Ephemeral = srp::server_ephemeral(&verifier.verifier);
        let client_public = BigUint::from_bytes_be(&hello.client_public);

        self.send_handshake(&HandshakeMessage::ServerChallenge(Ok(ServerChallenge {
            salt: verifier.salt.clone(),
            server_public: server.public.to_bytes_be(),
        })))?;

        let client_proof = match self.recv_handshake()? {
            HandshakeMessage::ClientProof(p) => p?,
            _ => {
                self.send_handshake(&HandshakeMessage::Accepted(Err(RemoteError::IllegalTransition)))?;
                return Err(NetworkError::IllegalTransition);
            }
        };

        let key = srp::server_session_key(&client_public, &server, &verifier.verifier)?;
        let expected_proof = system::hash_hmac(&key, &verifier.salt);

        if !bool::from(client_proof.proof.ct_eq(&expected_proof)) {
            self.send_handshake(&HandshakeMessage::Accepted(Err(RemoteError::AccessDenied)))?;
            return Err(RemoteError::Unauthorized.into());
        }

        self.send_handshake(&HandshakeMessage::Accepted(Ok(Accepted { suite })))?;

        Ok((Session::new(self.stream, key, suite, hello.node_name.clone())?, hello.node_name))
    }

    fn send_handshake(&self, message: &HandshakeMessage) -> Result<(), NetworkError> {
        let buf = bincode::serialize(message)?;
        (&self.stream).write_all(&buf)?;
        Ok(())
    }

    fn recv_handshake(&self) -> Result<HandshakeMessage, NetworkError> {
        Ok(bincode::deserialize_from(&self.stream)?)
    }
}

impl From<TcpStream> for NalixServ {
    fn from(stream: TcpStream) -> Self {
        Self { stream }
    }
}

/// An authenticated connection ready to exchange framed packets. The
/// session key never leaves this struct except to feed
/// [`crate::packet::Packet::encrypt`]/`decrypt` directly.
pub struct Session {
    stream_read: Mutex<BufReader<TcpStream>>,
    stream_write: Mutex<BufWriter<TcpStream>>,
    key: Zeroizing<Vec<u8>>,
    suite: Suite,
    remote_node_name: String,
}

impl Session {
    pub(crate) fn new(stream: TcpStream, key: Vec<u8>, suite: Suite, remote_node_name: String) -> Result<Self, NetworkError> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(Self {
            stream_read: Mutex::new(BufReader::new(stream.try_clone()?)),
            stream_write: Mutex::new(BufWriter::new(stream)),
            key: Zeroizing::new(key),
            suite,
            remote_node_name,
        })
    }

    pub fn remote_node_name(&self) -> &str {
        &self.remote_node_name
    }

    pub fn suite(&self) -> Suite {
        self.suite
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Frames and writes a packet. The packet's own encryption state
    /// (whether `encrypt` was already called) is preserved as-is.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), NetworkError> {
        let raw = RawPacket {
            op_code: packet.op_code(),
            number: packet.number(),
            checksum: packet.checksum(),
            timestamp: packet.timestamp(),
            type_: packet.type_(),
            flags: packet.flags().bits(),
            priority: packet.priority(),
            payload: packet.payload().to_vec(),
        };

        self.send_frame(&FrameMessage::Packet(raw))
    }

    pub fn send_ping(&self) -> Result<(), NetworkError> {
        self.send_frame(&FrameMessage::Ping)
    }

    pub fn send_close(&self, reason: Option<&str>) -> Result<(), NetworkError> {
        self.send_frame(&FrameMessage::Close(reason.map(str::to_owned)))
    }

    /// Reads one framed message and, for `Packet` frames, reconstructs a
    /// [`Packet`] through the allocator.
    #[allow(clippy::too_many_arguments)]
    pub fn recv_packet(
        &self,
        pool: &Arc<BufferPool>,
        stack_alloc_limit: usize,
        heap_alloc_limit: usize,
        packet_size_limit: usize,
    ) -> Result<Option<Packet>, NetworkError> {
        match self.recv_frame()? {
            FrameMessage::Packet(raw) => {
                let flags = PacketFlags::from_bits_truncate(raw.flags);
                let packet = Packet::new(
                    raw.op_code,
                    raw.number,
                    raw.checksum,
                    raw.timestamp,
                    raw.type_,
                    flags,
                    raw.priority,
                    &raw.payload,
                    pool,
                    stack_alloc_limit,
                    heap_alloc_limit,
                    packet_size_limit,
                )?;
                Ok(Some(packet))
            }
            FrameMessage::Ping => Ok(None),
            FrameMessage::Close(_) => Err(NetworkError::IllegalTransition),
            FrameMessage::Error(e) => Err(e.into()),
        }
    }

    fn send_frame(&self, message: &FrameMessage) -> Result<(), NetworkError> {
        let mut w = self.stream_write.lock().expect("stream_write mutex poisoned");
        bincode::serialize_into(w.deref_mut(), message)?;
        w.flush()?;
        Ok(())
    }

    fn recv_frame(&self) -> Result<FrameMessage, NetworkError> {
        Ok(bincode::deserialize_from(self.stream_read.lock().expect("stream_read mutex poisoned").deref_mut())?)
    }
}
