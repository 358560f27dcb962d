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

use crate::ConfigError;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use serde::{Deserialize, Serialize};

/// Capacity rejection policy applied by [`crate::hub::ConnectionHub::register`]
/// once `max_connections` is reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectPolicy {
    /// Refuse the new connection outright.
    RejectNew,
    /// Evict the oldest still-anonymous connection to make room.
    DropOldestAnonymous,
}

/// `RuntimeConfig` holds every tunable named in the external interfaces of
/// the runtime: hub capacity and eviction, the hashed timing wheel, the
/// tiered allocator's size classes, and the packet pipeline's compression
/// gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The network address `nalixd` binds to. The default is `[::]:20406` (dual stack).
    pub bind_addr: SocketAddr,

    /// Maximum number of simultaneously registered connections.
    pub max_connections: usize,
    /// Policy applied when `max_connections` is reached.
    pub reject_policy: RejectPolicy,
    /// Maximum accepted username length after trimming.
    pub max_username_length: usize,
    /// Whether usernames are trimmed of surrounding whitespace before validation.
    pub trim_usernames: bool,
    /// Fixed batch size for broadcast fan-out; `0` disables batching.
    pub broadcast_batch_size: usize,
    /// Maximum number of worker threads used by `close_all`'s parallel disconnect.
    pub parallel_disconnect_degree: usize,
    /// Grace period granted to in-flight unregister handlers before a close
    /// is considered stuck.
    pub unregister_drain_millis: u64,
    /// Enables verbose `[trace]`-tagged diagnostic logging.
    pub enable_trace_logs: bool,
    /// Initial capacity hint for the connection-by-id map.
    pub initial_connection_capacity: usize,
    /// Initial capacity hint for the username reverse-index maps.
    pub initial_username_capacity: usize,

    /// Duration of one hashed timing wheel tick, in milliseconds.
    pub tick_duration_ms: u64,
    /// Number of buckets in the hashed timing wheel.
    pub wheel_size: usize,
    /// Idle duration after which a connection is force-closed by the wheel.
    pub tcp_idle_timeout_ms: u64,

    /// Payloads at or below this size are allocated inline.
    pub stack_alloc_limit: usize,
    /// Payloads at or below this size (and above `stack_alloc_limit`) are pinned.
    pub heap_alloc_limit: usize,
    /// Maximum payload length a packet may carry, header excluded.
    pub packet_size_limit: usize,
    /// Minimum payload length eligible for compression.
    pub compress_min_bytes: usize,
    /// Interval between sweeps of the pooled-buffer tracker, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Age after which an untouched pooled buffer is reclaimed, in milliseconds.
    pub unused_threshold_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 20406),

            max_connections: 4096,
            reject_policy: RejectPolicy::DropOldestAnonymous,
            max_username_length: 32,
            trim_usernames: true,
            broadcast_batch_size: 256,
            parallel_disconnect_degree: 8,
            unregister_drain_millis: 200,
            enable_trace_logs: false,
            initial_connection_capacity: 1024,
            initial_username_capacity: 1024,

            tick_duration_ms: 100,
            wheel_size: 512,
            tcp_idle_timeout_ms: 60_000,

            stack_alloc_limit: 256,
            heap_alloc_limit: 64 * 1024,
            packet_size_limit: 1024 * 1024,
            compress_min_bytes: 512,
            cleanup_interval_ms: 15_000,
            unused_threshold_ms: 45_000,
        }
    }
}

impl RuntimeConfig {
    pub const PATH: &'static str = "/etc/nalix.conf";

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::PATH)
    }

    /// Loads the configuration file from an explicit path. Rejects the file
    /// if it is readable or writable by anyone other than its owner.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(ConfigError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::PATH)
    }

    /// Saves the configuration to an explicit path with `0600` permissions.
    pub fn save_to(&self, path: &str) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(path)?;

        write!(f, "{}", s)?;
        Ok(())
    }
}

/// A stored SRP-6a account: a node name plus the verifier material
/// `nalixd` authenticates it against. Never carries a plaintext password.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub node_name: String,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}

/// The on-disk account store consulted by `nalixd`'s handshake, mirroring
/// `RuntimeConfig`'s load/save discipline (owner-only permissions).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserStore {
    pub users: Vec<UserRecord>,
}

impl UserStore {
    pub const PATH: &'static str = "/etc/nalix.users";

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::PATH)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(ConfigError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::PATH)
    }

    pub fn save_to(&self, path: &str) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(path)?;

        write!(f, "{}", s)?;
        Ok(())
    }

    /// Looks up a node's verifier material by name, as consumed by
    /// [`crate::wire::NalixServ::authenticate`].
    pub fn find(&self, node_name: &str) -> Option<crate::srp::Verifier> {
        self.users.iter().find(|u| u.node_name == node_name).map(|u| crate::srp::Verifier {
            salt: u.salt.clone(),
            verifier: num_bigint_dig::BigUint::from_bytes_be(&u.verifier),
        })
    }

    /// Adds or replaces a user's verifier material.
    pub fn upsert(&mut self, node_name: String, salt: Vec<u8>, verifier: Vec<u8>) {
        self.users.retain(|u| u.node_name != node_name);
        self.users.push(UserRecord { node_name, salt, verifier });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_store_round_trips_through_toml() {
        let mut store = UserStore::default();
        store.upsert("alice".to_string(), vec![1, 2, 3], vec![4, 5, 6]);

        let serialized = toml::to_string_pretty(&store).unwrap();
        let deserialized: UserStore = toml::from_str(&serialized).unwrap();
        assert_eq!(store, deserialized);

        let verifier = deserialized.find("alice").unwrap();
        assert_eq!(verifier.salt, vec![1, 2, 3]);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RuntimeConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: RuntimeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn rejects_insecure_permissions() {
        let path = std::env::temp_dir().join(format!("nalix-config-test-{}", std::process::id()));
        let path_str = path.to_str().unwrap();

        RuntimeConfig::default().save_to(path_str).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = RuntimeConfig::load_from(path_str);
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(ConfigError::InsecurePerms)));
    }
}
