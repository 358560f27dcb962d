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

//! The hashed timing wheel (C3): one dedicated tick thread enforcing
//! connection idle timeouts without a per-connection timer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;

use crate::error::WheelError;
use crate::hub::Connection;

struct WheelTask {
    connection: Arc<Connection>,
    generation: u64,
    rounds: u64,
}

struct Bucket {
    tx: Sender<WheelTask>,
    rx: Receiver<WheelTask>,
}

/// Schedules connection idle checks into `wheel_size` buckets advanced
/// one per `tick_ms`. A connection is re-enqueued every tick until it
/// either pings again (pushing its deadline out) or goes idle past
/// `idle_timeout_ms`, at which point it is force-closed.
pub struct TimingWheel {
    buckets: Vec<Bucket>,
    active: DashMap<u64, u64>,
    next_generation: AtomicU64,
    tick_counter: AtomicU64,
    tick_ms: u64,
    wheel_size: u64,
    idle_timeout_ms: u64,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimingWheel {
    pub fn new(tick_ms: u64, wheel_size: usize, idle_timeout_ms: u64) -> Arc<Self> {
        let buckets = (0..wheel_size.max(1))
            .map(|_| {
                let (tx, rx) = unbounded();
                Bucket { tx, rx }
            })
            .collect();

        Arc::new(Self {
            buckets,
            active: DashMap::new(),
            next_generation: AtomicU64::new(0),
            tick_counter: AtomicU64::new(0),
            tick_ms,
            wheel_size: wheel_size.max(1) as u64,
            idle_timeout_ms,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    fn ticks_for(&self, millis: u64) -> u64 {
        (millis / self.tick_ms.max(1)).max(1)
    }

    fn enqueue(&self, connection: Arc<Connection>, generation: u64, ticks: u64) {
        let tick_counter = self.tick_counter.load(Ordering::Acquire);
        let bucket = (tick_counter + ticks) % self.wheel_size;
        let rounds = ticks / self.wheel_size;
        let task = WheelTask { connection, generation, rounds };
        let _ = self.buckets[bucket as usize].tx.send(task);
    }

    /// Registers `connection` for idle tracking. A no-op if it is already
    /// tracked. Subscribes to the connection's close event so that a
    /// connection closing for any other reason unregisters itself.
    pub fn register(self: &Arc<Self>, connection: Arc<Connection>) {
        let id = connection.id();
        if self.active.contains_key(&id) {
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        self.active.insert(id, generation);

        {
            let wheel = Arc::clone(self);
            connection.subscribe_close(move |c, _reason| wheel.unregister(c.id()));
        }

        let ticks = self.ticks_for(self.idle_timeout_ms);
        self.enqueue(connection, generation, ticks);
    }

    /// Stops tracking a connection. Safe to call redundantly; an
    /// in-flight task for this id is discarded as stale on next dequeue.
    pub fn unregister(&self, id: u64) {
        self.active.remove(&id);
    }

    /// Advances the wheel by one tick: drains the current bucket,
    /// discarding stale tasks, decrementing round counters, and either
    /// force-closing idle connections or rescheduling live ones.
    pub fn tick(&self) {
        let tick_counter = self.tick_counter.load(Ordering::Acquire);
        let bucket_index = (tick_counter % self.wheel_size) as usize;

        let mut drained = Vec::new();
        while let Ok(task) = self.buckets[bucket_index].rx.try_recv() {
            drained.push(task);
        }

        for mut task in drained {
            let id = task.connection.id();
            let is_live = self.active.get(&id).map(|g| *g == task.generation).unwrap_or(false);
            if !is_live {
                continue;
            }

            if task.rounds > 0 {
                task.rounds -= 1;
                let bucket = bucket_index as u64;
                let WheelTask { connection, generation, rounds } = task;
                let _ = self.buckets[bucket as usize].tx.send(WheelTask { connection, generation, rounds });
                continue;
            }

            let now = crate::system::now_ms();
            let idle = now.saturating_sub(task.connection.last_ping_ms());

            if idle >= self.idle_timeout_ms {
                task.connection.close();
                self.active.remove(&id);
            } else {
                let remaining = self.ticks_for(self.idle_timeout_ms.saturating_sub(idle));
                self.enqueue(task.connection, task.generation, remaining);
            }
        }

        self.tick_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Starts the tick loop on a dedicated thread. Idempotent: calling
    /// `activate` on an already-active wheel returns `AlreadyActive`.
    pub fn activate(self: &Arc<Self>) -> Result<(), WheelError> {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(WheelError::AlreadyActive);
        }

        let wheel = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while wheel.running.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(wheel.tick_ms));
                if !wheel.running.load(Ordering::Acquire) {
                    break;
                }
                wheel.tick();
            }
        });

        *self.worker.lock().expect("worker mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Stops the tick loop and drains every bucket without force-closing
    /// anything still pending.
    pub fn deactivate(&self) -> Result<(), WheelError> {
        if self.running.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(WheelError::NotActive);
        }

        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }

        for bucket in &self.buckets {
            while bucket.rx.try_recv().is_ok() {}
        }
        self.active.clear();

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Suite;

    fn conn(id: u64) -> Arc<Connection> {
        Arc::new(Connection::new(id, "127.0.0.1:9000".parse().unwrap(), [0u8; 32], Suite::ChaCha20, 0))
    }

    #[test]
    fn register_is_idempotent() {
        let wheel = TimingWheel::new(50, 8, 300);
        let c = conn(1);
        wheel.register(Arc::clone(&c));
        wheel.register(c);
        assert_eq!(wheel.active.len(), 1);
    }

    #[test]
    fn stale_task_discarded_after_unregister() {
        let wheel = TimingWheel::new(10, 4, 10);
        let c = conn(1);
        wheel.register(Arc::clone(&c));
        wheel.unregister(1);
        // the task is still physically enqueued; tick must discard it
        // without touching the connection.
        wheel.tick();
        assert!(!c.is_closed());
    }

    #[test]
    fn idle_connection_is_force_closed_within_the_expected_tick_window() {
        let wheel = TimingWheel::new(10, 4, 10);
        let c = conn(1);
        wheel.register(Arc::clone(&c));

        for _ in 0..8 {
            wheel.tick();
        }

        assert!(c.is_closed());
    }

    #[test]
    fn activation_is_idempotent_and_reversible() {
        let wheel = TimingWheel::new(10, 4, 50);
        assert!(wheel.activate().is_ok());
        assert!(matches!(wheel.activate(), Err(WheelError::AlreadyActive)));
        assert!(wheel.deactivate().is_ok());
        assert!(matches!(wheel.deactivate(), Err(WheelError::NotActive)));
    }
}
