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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalix_core::cipher::Suite;
use nalix_core::config::{RejectPolicy, RuntimeConfig};
use nalix_core::hub::{Connection, ConnectionHub};
use nalix_core::wheel::TimingWheel;

fn conn(id: u64) -> Arc<Connection> {
    Arc::new(Connection::new(id, "127.0.0.1:9000".parse().unwrap(), [0u8; 32], Suite::ChaCha20, 0))
}

/// Registering a connection into both the hub and the wheel, then closing
/// it, must unregister it from both without anyone having to call
/// `hub.unregister`/`wheel.unregister` by hand -- the close subscription
/// each registers is the only thing keeping the two in sync.
#[test]
fn closing_a_connection_unregisters_it_from_hub_and_wheel() {
    let cfg = RuntimeConfig::default();
    let hub = ConnectionHub::new(&cfg);
    let wheel = TimingWheel::new(10, 4, 10_000);

    let c = conn(1);
    assert!(hub.register(Arc::clone(&c)));
    wheel.register(Arc::clone(&c));

    c.close();

    assert!(hub.get_by_id(1).is_none());
    assert_eq!(hub.count(), 0);
    // stale_task_discarded_after_unregister (wheel.rs) covers the wheel's
    // own unregister bookkeeping directly; here we just confirm the close
    // subscription actually fired for both registries from one `close()`.
}

/// Capacity-triggered eviction must actually close the evicted connection
/// -- not just drop it from the hub's bookkeeping -- so a handler loop
/// blocked on `while !connection.is_closed()` observes the close and a
/// subscriber (e.g. the daemon's close-to-wire-frame bridge) is told why.
#[test]
fn eviction_under_capacity_actually_closes_the_evicted_connection() {
    let mut cfg = RuntimeConfig::default();
    cfg.max_connections = 1;
    cfg.reject_policy = RejectPolicy::DropOldestAnonymous;
    let hub = ConnectionHub::new(&cfg);

    let evicted = conn(1);
    assert!(hub.register(Arc::clone(&evicted)));
    assert!(!evicted.is_closed());

    let observed_reason = Arc::new(std::sync::Mutex::new(None));
    {
        let observed_reason = Arc::clone(&observed_reason);
        evicted.subscribe_close(move |_c, reason| {
            *observed_reason.lock().unwrap() = reason.map(str::to_owned);
        });
    }

    let newcomer = conn(2);
    assert!(hub.register(newcomer));

    assert!(evicted.is_closed(), "eviction must actually close the displaced connection");
    assert!(hub.get_by_id(1).is_none());
    assert_eq!(
        observed_reason.lock().unwrap().as_deref(),
        Some("evicted to make room for new connection")
    );
}

/// A connection that goes idle past `tcp_idle_timeout_ms` is force-closed
/// by the wheel's tick loop and, through its close subscription, also
/// disappears from the hub -- the C2/C3 interaction the spec's idle
/// timeout scenario describes end to end.
#[test]
fn idle_connection_is_force_closed_and_drops_out_of_the_hub() {
    let cfg = RuntimeConfig::default();
    let hub = ConnectionHub::new(&cfg);
    let wheel = TimingWheel::new(10, 4, 10);

    let c = conn(1);
    hub.register(Arc::clone(&c));
    wheel.register(Arc::clone(&c));

    for _ in 0..8 {
        wheel.tick();
    }

    assert!(c.is_closed());
    assert!(hub.get_by_id(1).is_none());
}

/// Close subscribers are at-most-once regardless of how many callers race
/// to close the same connection concurrently.
#[test]
fn concurrent_close_calls_fire_subscribers_exactly_once() {
    let c = conn(1);
    let fire_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    {
        let fire_count = Arc::clone(&fire_count);
        c.subscribe_close(move |_c, _reason| {
            fire_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let c = Arc::clone(&c);
            let done = Arc::clone(&done);
            scope.spawn(move || {
                c.close();
                done.store(true, Ordering::SeqCst);
            });
        }
    });

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}
