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

//! The connection hub (C2): a concurrent registry with reverse username
//! lookup, capacity-aware admission, and batched broadcast fan-out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::cipher::Suite;
use crate::config::{RejectPolicy, RuntimeConfig};
use crate::error::RemoteError;
use crate::system::now_ms;

type CloseSubscriber = Box<dyn Fn(&Connection, Option<&str>) + Send + Sync>;

/// A long-lived, registered peer. `close` is idempotent: the first caller
/// to win the compare-exchange on `closed` runs the subscribers; every
/// later caller is a no-op.
pub struct Connection {
    id: u64,
    remote: SocketAddr,
    secret: Zeroizing<[u8; 32]>,
    algorithm: Suite,
    permission_level: u8,
    last_ping_ms: AtomicU64,
    closed: AtomicBool,
    on_close: Mutex<Vec<CloseSubscriber>>,
}

impl Connection {
    pub fn new(id: u64, remote: SocketAddr, secret: [u8; 32], algorithm: Suite, permission_level: u8) -> Self {
        Self {
            id,
            remote,
            secret: Zeroizing::new(secret),
            algorithm,
            permission_level,
            last_ping_ms: AtomicU64::new(now_ms()),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn algorithm(&self) -> Suite {
        self.algorithm
    }

    pub fn permission_level(&self) -> u8 {
        self.permission_level
    }

    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_ping_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe_close<F>(&self, f: F)
    where
        F: Fn(&Connection, Option<&str>) + Send + Sync + 'static,
    {
        self.on_close.lock().expect("on_close mutex poisoned").push(Box::new(f));
    }

    /// Equivalent to `close_with_reason(None)`.
    pub fn close(&self) {
        self.close_with_reason(None);
    }

    /// Fires close subscribers exactly once, regardless of how many times
    /// or from how many threads `close`/`close_with_reason` is called.
    /// `reason` is passed through to every subscriber so a transport-level
    /// one can forward it on the wire (e.g. a `Close` frame).
    pub fn close_with_reason(&self, reason: Option<&str>) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let subscribers = self.on_close.lock().expect("on_close mutex poisoned");
            for subscriber in subscribers.iter() {
                subscriber(self, reason);
            }
        }
    }
}

fn normalize_username(raw: &str, cfg: &RuntimeConfig) -> Option<String> {
    let trimmed = if cfg.trim_usernames { raw.trim() } else { raw };
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(trimmed.chars().take(cfg.max_username_length).collect())
}

/// The concurrent connection registry. `by_id`/`name_by_id`/`id_by_name`
/// use `dashmap` so lookups and inserts never take a single global lock;
/// the anonymous eviction FIFO is the only point of global serialization,
/// matching the spec's admission algorithm which must dequeue in order.
pub struct ConnectionHub {
    by_id: DashMap<u64, Arc<Connection>>,
    name_by_id: DashMap<u64, String>,
    id_by_name: DashMap<String, u64>,
    anonymous_queue: Mutex<VecDeque<u64>>,
    count: AtomicUsize,
    disposed: AtomicBool,
    max_connections: usize,
    reject_policy: RejectPolicy,
    broadcast_batch_size: usize,
    parallel_disconnect_degree: usize,
}

impl ConnectionHub {
    pub fn new(cfg: &RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            by_id: DashMap::with_capacity(cfg.initial_connection_capacity),
            name_by_id: DashMap::with_capacity(cfg.initial_username_capacity),
            id_by_name: DashMap::with_capacity(cfg.initial_username_capacity),
            anonymous_queue: Mutex::new(VecDeque::new()),
            count: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            max_connections: cfg.max_connections,
            reject_policy: cfg.reject_policy,
            broadcast_batch_size: cfg.broadcast_batch_size,
            parallel_disconnect_degree: cfg.parallel_disconnect_degree,
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn try_evict_anonymous(&self) -> bool {
        let mut queue = self.anonymous_queue.lock().expect("anonymous_queue mutex poisoned");
        while let Some(candidate) = queue.pop_front() {
            let still_anonymous = self.by_id.contains_key(&candidate) && !self.name_by_id.contains_key(&candidate);
            if still_anonymous {
                let conn = self.by_id.get(&candidate).map(|e| Arc::clone(e.value()));
                drop(queue);
                self.unregister(candidate);
                if let Some(conn) = conn {
                    conn.close_with_reason(Some("evicted to make room for new connection"));
                }
                return true;
            }
        }
        false
    }

    /// Registers a live connection, subscribing it to fire `unregister` on
    /// close. Returns `false` if the hub is disposed, the id is already
    /// registered, or the hub is at capacity with no eviction candidate.
    pub fn register(self: &Arc<Self>, conn: Arc<Connection>) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        if self.by_id.contains_key(&conn.id()) {
            return false;
        }

        if self.count.load(Ordering::Acquire) >= self.max_connections {
            match self.reject_policy {
                RejectPolicy::RejectNew => return false,
                RejectPolicy::DropOldestAnonymous => {
                    if !self.try_evict_anonymous() {
                        return false;
                    }
                }
            }
        }

        let id = conn.id();
        {
            let hub = Arc::clone(self);
            conn.subscribe_close(move |c, _reason| hub.unregister(c.id()));
        }

        self.by_id.insert(id, conn);
        self.anonymous_queue.lock().expect("anonymous_queue mutex poisoned").push_back(id);
        self.count.fetch_add(1, Ordering::AcqRel);

        true
    }

    /// Removes a connection's registry entries. Safe to call from a close
    /// handler; calling it twice for the same id is a no-op the second time.
    pub fn unregister(&self, id: u64) {
        if self.by_id.remove(&id).is_none() {
            return;
        }
        if let Some((_, name)) = self.name_by_id.remove(&id) {
            self.id_by_name.remove(&name.to_ascii_lowercase());
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Binds `name` to `id`, displacing any previous binding either
    /// direction. Names are matched case-insensitively.
    pub fn associate_username(&self, id: u64, name: &str, cfg: &RuntimeConfig) -> Result<(), RemoteError> {
        let normalized = normalize_username(name, cfg).ok_or(RemoteError::IllegalTransition)?;
        let key = normalized.to_ascii_lowercase();

        if !self.by_id.contains_key(&id) {
            return Err(RemoteError::IllegalTransition);
        }

        if let Some((_, old_name)) = self.name_by_id.remove(&id) {
            self.id_by_name.remove(&old_name.to_ascii_lowercase());
        }
        if let Some((_, old_id)) = self.id_by_name.remove(&key) {
            self.name_by_id.remove(&old_id);
        }

        self.name_by_id.insert(id, normalized);
        self.id_by_name.insert(key, id);

        Ok(())
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.by_id.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        let id = *self.id_by_name.get(&name.to_ascii_lowercase())?;
        self.get_by_id(id)
    }

    /// A consistent point-in-time snapshot of live connections.
    pub fn list(&self) -> Vec<Arc<Connection>> {
        self.by_id.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Sends `msg` to every connection for which `send` succeeds, in
    /// batches of `broadcast_batch_size`, each batch run on its own set of
    /// scoped threads and joined before the next begins. A per-target
    /// failure is not fatal to the fan-out; `cancel` is checked before
    /// each batch starts.
    pub fn broadcast<T, S, C>(&self, msg: &T, send: S, cancel: C)
    where
        T: Sync,
        S: Fn(&Connection, &T) -> Result<(), RemoteError> + Sync,
        C: Fn() -> bool,
    {
        self.broadcast_where(msg, send, |_| true, cancel)
    }

    /// As [`broadcast`](Self::broadcast), restricted to connections for
    /// which `pred` (evaluated on the caller's thread) returns true.
    pub fn broadcast_where<T, S, P, C>(&self, msg: &T, send: S, pred: P, cancel: C)
    where
        T: Sync,
        S: Fn(&Connection, &T) -> Result<(), RemoteError> + Sync,
        P: Fn(&Connection) -> bool,
        C: Fn() -> bool,
    {
        let targets: Vec<Arc<Connection>> = self.list().into_iter().filter(|c| pred(c)).collect();
        let batch_size = if self.broadcast_batch_size == 0 { targets.len().max(1) } else { self.broadcast_batch_size };

        for batch in targets.chunks(batch_size) {
            if cancel() {
                return;
            }

            std::thread::scope(|scope| {
                for conn in batch {
                    let send = &send;
                    scope.spawn(move || {
                        if let Err(e) = send(conn, msg) {
                            eprintln!("[warn] broadcast send to connection {} failed: {}", conn.id(), e);
                        }
                    });
                }
            });
        }
    }

    /// Disconnects every registered connection, at most
    /// `parallel_disconnect_degree` at a time, then clears the registry.
    pub fn close_all(&self) {
        let targets = self.list();
        let degree = self.parallel_disconnect_degree.max(1);

        for batch in targets.chunks(degree) {
            std::thread::scope(|scope| {
                for conn in batch {
                    scope.spawn(move || conn.close());
                }
            });
        }

        self.by_id.clear();
        self.name_by_id.clear();
        self.id_by_name.clear();
        self.anonymous_queue.lock().expect("anonymous_queue mutex poisoned").clear();
        self.count.store(0, Ordering::Release);
        self.disposed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64) -> Arc<Connection> {
        Arc::new(Connection::new(id, "127.0.0.1:9000".parse().unwrap(), [0u8; 32], Suite::ChaCha20, 0))
    }

    #[test]
    fn register_then_get_by_id_round_trips() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        assert!(hub.register(conn(1)));
        assert!(hub.get_by_id(1).is_some());
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        assert!(hub.register(conn(1)));
        assert!(!hub.register(conn(1)));
    }

    #[test]
    fn close_unregisters_via_subscription() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        let c = conn(1);
        hub.register(Arc::clone(&c));
        c.close();
        assert!(hub.get_by_id(1).is_none());
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn associate_username_is_case_insensitive_on_lookup() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        let cfg = RuntimeConfig::default();
        hub.register(conn(1));
        hub.associate_username(1, "Alice", &cfg).unwrap();
        assert_eq!(hub.get_by_name("alice").unwrap().id(), 1);
    }

    #[test]
    fn reject_new_policy_refuses_over_capacity() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_connections = 1;
        cfg.reject_policy = RejectPolicy::RejectNew;
        let hub = ConnectionHub::new(&cfg);

        assert!(hub.register(conn(1)));
        assert!(!hub.register(conn(2)));
    }

    #[test]
    fn drop_oldest_anonymous_admits_new_connection() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_connections = 1;
        cfg.reject_policy = RejectPolicy::DropOldestAnonymous;
        let hub = ConnectionHub::new(&cfg);

        hub.register(conn(1));
        assert!(hub.register(conn(2)));
        assert!(hub.get_by_id(1).is_none());
        assert!(hub.get_by_id(2).is_some());
    }

    #[test]
    fn drop_oldest_anonymous_skips_named_connections() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_connections = 1;
        cfg.reject_policy = RejectPolicy::DropOldestAnonymous;
        let hub = ConnectionHub::new(&cfg);

        hub.register(conn(1));
        hub.associate_username(1, "bob", &cfg).unwrap();
        assert!(!hub.register(conn(2)));
    }

    #[test]
    fn close_all_clears_the_registry() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        hub.register(conn(1));
        hub.register(conn(2));
        hub.close_all();
        assert_eq!(hub.count(), 0);
        assert!(hub.list().is_empty());
    }

    #[test]
    fn broadcast_where_only_reaches_matching_connections() {
        let hub = ConnectionHub::new(&RuntimeConfig::default());
        hub.register(conn(1));
        hub.register(conn(2));

        let hits = std::sync::Mutex::new(Vec::new());
        hub.broadcast_where(
            &"ping".to_string(),
            |c, msg| {
                hits.lock().unwrap().push((c.id(), msg.clone()));
                Ok(())
            },
            |c| c.id() == 1,
            || false,
        );

        assert_eq!(hits.into_inner().unwrap(), vec![(1, "ping".to_string())]);
    }
}
