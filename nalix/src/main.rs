// nalix is a client and administration tool for the nalix runtime.
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

mod error;
use error::*;

use nalix_core::buffer::BufferPool;
use nalix_core::cipher::Suite;
use nalix_core::config::{RuntimeConfig, UserStore};
use nalix_core::crc::crc32;
use nalix_core::srp;
use nalix_core::system;
use nalix_core::wire::{NalixConn, DEFAULT_PORT};

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate SRP-6a verifier material for a new account.
    ///
    /// Prints the salt and verifier as hex; an administrator adds them to
    /// the server's user store with `add-user --store`, or pastes them in
    /// by hand.
    GenVerifier {
        /// The node name the account will authenticate as.
        node_name: String,
    },
    /// Generate verifier material and add it directly to a user store file.
    AddUser {
        /// The node name the account will authenticate as.
        node_name: String,
        /// Path to the user store TOML file. Created if missing.
        #[arg(long, default_value = UserStore::PATH)]
        store: String,
    },
    /// Remove an account from a user store file.
    RmUser {
        /// The node name to remove.
        node_name: String,
        #[arg(long, default_value = UserStore::PATH)]
        store: String,
    },
    /// Compute the CRC-32 of a UTF-8 string argument.
    Crc32 {
        /// The input to checksum.
        input: String,
    },
    /// Authenticate to a running `nalixd` and report the result.
    Ping {
        /// The network address and optional port of the server.
        address: String,
        /// The node name to authenticate as.
        node_name: String,
    },
    /// Authenticate, then send one packet and print the echoed reply.
    Send {
        /// The network address and optional port of the server.
        address: String,
        /// The node name to authenticate as.
        node_name: String,
        /// The message payload to send.
        message: String,
        /// Compress the payload before sending.
        #[arg(long)]
        compress: bool,
        /// Encrypt the payload under the session key before sending.
        #[arg(long)]
        encrypt: bool,
    },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenVerifier { node_name } => {
            let password = rpassword::prompt_password("Enter new passphrase: ")?;
            let verifier = srp::generate_verifier(&node_name, &password, None);

            println!("node_name = \"{}\"", node_name);
            println!("salt      = \"{}\"", hex::encode(&verifier.salt));
            println!("verifier  = \"{}\"", hex::encode(verifier.verifier.to_bytes_be()));
        }
        Commands::AddUser { node_name, store } => {
            let password = rpassword::prompt_password("Enter new passphrase: ")?;
            let verifier = srp::generate_verifier(&node_name, &password, None);

            let mut users = UserStore::load_from(&store).unwrap_or_default();
            users.upsert(node_name.clone(), verifier.salt, verifier.verifier.to_bytes_be());
            users.save_to(&store)?;

            println!("Added {} to {}", node_name, store);
        }
        Commands::RmUser { node_name, store } => {
            let mut users = UserStore::load_from(&store)?;
            users.users.retain(|u| u.node_name != node_name);
            users.save_to(&store)?;

            println!("Removed {} from {}", node_name, store);
        }
        Commands::Crc32 { input } => {
            println!("{:08x}", crc32(input.as_bytes()));
        }
        Commands::Ping { address, node_name } => {
            let password = rpassword::prompt_password("Enter passphrase: ")?;
            let socket_addr = resolve(&address)?;

            let conn = NalixConn::new(&socket_addr)?;
            let session = conn.authenticate(node_name, &password, Suite::ChaCha20Poly1305)?;
            session.send_ping()?;

            println!("Authentication to {} successful (suite {:?})", address, session.suite());
        }
        Commands::Send { address, node_name, message, compress, encrypt } => {
            let password = rpassword::prompt_password("Enter passphrase: ")?;
            let socket_addr = resolve(&address)?;
            let config = RuntimeConfig::load().unwrap_or_default();

            let conn = NalixConn::new(&socket_addr)?;
            let session = conn.authenticate(node_name, &password, Suite::ChaCha20Poly1305)?;

            let pool = BufferPool::new();
            let payload = message.as_bytes();

            let mut packet = nalix_core::packet::Packet::new(
                0,
                0,
                crc32(payload),
                system::now_ms(),
                0,
                nalix_core::packet::PacketFlags::empty(),
                0,
                payload,
                &pool,
                config.stack_alloc_limit,
                config.heap_alloc_limit,
                config.packet_size_limit,
            )?;

            if compress {
                packet = packet.compress(config.compress_min_bytes)?;
            }
            if encrypt {
                packet = packet.encrypt(session.key(), session.suite(), node_name_aad(&session))?;
            }

            session.send_packet(&packet)?;
            println!("Sent {} bytes to {}", packet.payload().len(), address);

            if let Some(mut reply) =
                session.recv_packet(&pool, config.stack_alloc_limit, config.heap_alloc_limit, config.packet_size_limit)?
            {
                if reply.flags().contains(nalix_core::packet::PacketFlags::ENCRYPTED) {
                    reply = reply.decrypt(session.key(), node_name_aad(&session))?;
                }
                if reply.flags().contains(nalix_core::packet::PacketFlags::COMPRESSED) {
                    reply = reply.decompress()?;
                }

                println!("Reply: {}", String::from_utf8_lossy(reply.payload()));
            }
        }
    }

    Ok(())
}

fn node_name_aad(session: &nalix_core::wire::Session) -> &[u8] {
    session.remote_node_name().as_bytes()
}

fn resolve(address: &str) -> Result<SocketAddr> {
    match address.parse() {
        Ok(addr) => Ok(addr),
        Err(_) => Ok(SocketAddr::new(address.parse()?, DEFAULT_PORT)),
    }
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => eprintln!("Error: {}", e),
    }
}
