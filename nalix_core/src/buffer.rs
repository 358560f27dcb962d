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

//! The tiered buffer allocator (C4). Payloads are copied into one of three
//! ownership tiers chosen by length against the configured size classes,
//! mirroring `allocate`/`drop` as the only contract C1 relies on.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use slab::Slab;

use crate::system::now_ms;
use crate::AllocError;

/// Per-size-class cap on how many released backing arrays a free list
/// keeps around. Past this, a released buffer is just dropped rather than
/// held onto indefinitely for a size class nothing is renting anymore.
const FREE_LIST_CLASS_CAP: usize = 64;

fn empty_sentinel() -> Arc<[u8]> {
    static EMPTY: OnceLock<Arc<[u8]>> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::from(Vec::new().into_boxed_slice())).clone()
}

fn empty_boxed_sentinel() -> Arc<Box<[u8]>> {
    static EMPTY: OnceLock<Arc<Box<[u8]>>> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::new(Vec::new().into_boxed_slice())).clone()
}

/// A tagged union over the three ownership tiers a payload can land in.
/// All tiers share backing storage via `Arc`, so cloning an `OwnedBuffer`
/// (as `Packet::clone` does) never copies bytes.
#[derive(Clone)]
pub enum OwnedBuffer {
    /// `0 < len <= stack_alloc_limit`. Small, copied eagerly.
    Inline(Arc<[u8]>),
    /// `stack_alloc_limit < len <= heap_alloc_limit`. Copied in 64-byte chunks.
    Pinned(Arc<[u8]>),
    /// `len > heap_alloc_limit`. Rented from the process-wide pool.
    Pooled(PooledBuffer),
}

impl OwnedBuffer {
    /// Copies `src` into a buffer of the tier selected by its length.
    pub fn allocate(
        src: &[u8],
        pool: &Arc<BufferPool>,
        stack_alloc_limit: usize,
        heap_alloc_limit: usize,
    ) -> Self {
        let len = src.len();

        if len == 0 {
            return OwnedBuffer::Inline(empty_sentinel());
        }

        if len <= stack_alloc_limit {
            return OwnedBuffer::Inline(Arc::from(src.to_vec().into_boxed_slice()));
        }

        if len <= heap_alloc_limit {
            let mut data = vec![0u8; len];
            for (chunk_dst, chunk_src) in data.chunks_mut(64).zip(src.chunks(64)) {
                chunk_dst.copy_from_slice(chunk_src);
            }
            return OwnedBuffer::Pinned(Arc::from(data.into_boxed_slice()));
        }

        OwnedBuffer::Pooled(pool.rent(src))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            OwnedBuffer::Inline(a) | OwnedBuffer::Pinned(a) => a,
            OwnedBuffer::Pooled(p) => p.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for OwnedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

struct TrackerEntry {
    generation: u64,
    last_access_ms: AtomicU64,
}

struct PoolInner {
    active: Slab<TrackerEntry>,
    next_generation: u64,
    /// Backing arrays returned by a released `PooledBuffer`, keyed by their
    /// exact byte length so a later rental of the same size reuses the
    /// allocation instead of copying into a fresh one.
    free_list: HashMap<usize, Vec<Box<[u8]>>>,
}

/// A process-wide ledger of pooled rentals backing the `Pooled` tier.
/// Tracks each rental's generation and last-access time in a slab keyed
/// by slot index, so a stale handle can never be mistaken for a live one
/// and the sweeper can reclaim by age without a global lock on the data
/// itself (the bytes are owned independently via `Arc`).
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    max_active: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(u64::MAX)
    }

    pub fn with_capacity(max_active: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                active: Slab::new(),
                next_generation: 0,
                free_list: HashMap::new(),
            }),
            max_active: AtomicU64::new(max_active),
        })
    }

    fn rent(self: &Arc<Self>, src: &[u8]) -> PooledBuffer {
        self.try_rent(src).expect("unbounded pool rental cannot be exhausted")
    }

    /// Attempts to rent a buffer, reporting exhaustion rather than growing
    /// without bound once `max_active` rentals are outstanding.
    pub fn try_rent(self: &Arc<Self>, src: &[u8]) -> Result<PooledBuffer, AllocError> {
        let mut inner = self.inner.lock().expect("buffer pool mutex poisoned");

        if inner.active.len() as u64 >= self.max_active.load(Ordering::Relaxed) {
            return Err(AllocError::PoolExhausted);
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let key = inner.active.insert(TrackerEntry {
            generation,
            last_access_ms: AtomicU64::new(now_ms()),
        });

        let data = match inner.free_list.get_mut(&src.len()).and_then(Vec::pop) {
            Some(mut reused) => {
                reused.copy_from_slice(src);
                reused
            }
            None => src.to_vec().into_boxed_slice(),
        };

        Ok(PooledBuffer {
            pool: Arc::clone(self),
            key,
            generation,
            released: Arc::new(AtomicBool::new(false)),
            data: Arc::new(data),
        })
    }

    fn touch(&self, key: usize, generation: u64) {
        let inner = self.inner.lock().expect("buffer pool mutex poisoned");
        if let Some(entry) = inner.active.get(key) {
            if entry.generation == generation {
                entry.last_access_ms.store(now_ms(), Ordering::Relaxed);
            }
        }
    }

    fn forget(&self, key: usize, generation: u64) {
        let mut inner = self.inner.lock().expect("buffer pool mutex poisoned");
        if inner.active.contains(key) && inner.active[key].generation == generation {
            inner.active.remove(key);
        }
    }

    /// Like `forget`, but additionally hands the (already zeroed) backing
    /// array back to the free list so a future rental of the same size can
    /// reuse it instead of allocating fresh.
    fn forget_and_recycle(&self, key: usize, generation: u64, buf: Box<[u8]>) {
        let mut inner = self.inner.lock().expect("buffer pool mutex poisoned");
        if inner.active.contains(key) && inner.active[key].generation == generation {
            inner.active.remove(key);
        }

        let class = inner.free_list.entry(buf.len()).or_default();
        if class.len() < FREE_LIST_CLASS_CAP {
            class.push(buf);
        }
    }

    /// Reclaims tracker entries whose handle has been untouched for longer
    /// than `unused_threshold_ms`. A stuck handle past the threshold is
    /// assumed leaked; the slot is freed so the pool's capacity accounting
    /// does not grow unbounded. Never propagates a failure outward.
    pub fn sweep(&self, unused_threshold_ms: u64) {
        let mut inner = self.inner.lock().expect("buffer pool mutex poisoned");
        let now = now_ms();

        let stale: Vec<usize> = inner
            .active
            .iter()
            .filter(|(_, entry)| {
                now.saturating_sub(entry.last_access_ms.load(Ordering::Relaxed)) >= unused_threshold_ms
            })
            .map(|(key, _)| key)
            .collect();

        for key in stale {
            inner.active.remove(key);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("buffer pool mutex poisoned").active.len()
    }
}

/// A release handle over a single pooled allocation. The release triggers
/// exactly once, whether via explicit [`PooledBuffer::release`] or via
/// `Drop`, whichever runs first. Bytes are zeroed on release if this is the
/// last reference to the backing storage.
#[derive(Clone)]
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    key: usize,
    generation: u64,
    released: Arc<AtomicBool>,
    data: Arc<Box<[u8]>>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.pool.touch(self.key, self.generation);
        &self.data
    }

    /// Zeroes (if this is the sole reference) and returns the buffer to the
    /// pool's tracker, recycling the backing array into the pool's free
    /// list for its size class. Idempotent: calling it twice, or calling it
    /// and then letting the value drop, only runs the release once. If
    /// another clone of this `PooledBuffer` is still alive, the backing
    /// array can't be reclaimed yet, so only the tracker entry is dropped.
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let owned = std::mem::replace(&mut self.data, empty_boxed_sentinel());
        match Arc::try_unwrap(owned) {
            Ok(mut buf) => {
                buf.iter_mut().for_each(|b| *b = 0);
                self.pool.forget_and_recycle(self.key, self.generation, buf);
            }
            Err(shared) => {
                self.data = shared;
                self.pool.forget(self.key, self.generation);
            }
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if Arc::strong_count(&self.released) == 1 {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_uses_inline_sentinel() {
        let pool = BufferPool::new();
        let buf = OwnedBuffer::allocate(&[], &pool, 256, 65536);
        assert!(buf.is_empty());
        assert!(matches!(buf, OwnedBuffer::Inline(_)));
    }

    #[test]
    fn small_payload_is_inline_and_copies_contents() {
        let pool = BufferPool::new();
        let buf = OwnedBuffer::allocate(b"hello", &pool, 256, 65536);
        assert!(matches!(buf, OwnedBuffer::Inline(_)));
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn mid_payload_is_pinned() {
        let pool = BufferPool::new();
        let data = vec![7u8; 300];
        let buf = OwnedBuffer::allocate(&data, &pool, 256, 65536);
        assert!(matches!(buf, OwnedBuffer::Pinned(_)));
        assert_eq!(buf.as_slice(), data.as_slice());
    }

    #[test]
    fn large_payload_is_pooled_and_round_trips() {
        let pool = BufferPool::new();
        let data = vec![9u8; 70_000];
        let buf = OwnedBuffer::allocate(&data, &pool, 256, 65536);
        assert!(matches!(buf, OwnedBuffer::Pooled(_)));
        assert_eq!(buf.as_slice(), data.as_slice());
    }

    #[test]
    fn explicit_release_is_idempotent() {
        let pool = BufferPool::new();
        let mut pooled = pool.rent(&vec![5u8; 70_000]);
        pooled.release();
        pooled.release();
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn dropping_a_pooled_buffer_frees_its_tracker_slot() {
        let pool = BufferPool::new();
        {
            let _pooled = pool.rent(&vec![5u8; 70_000]);
            assert_eq!(pool.active_count(), 1);
        }
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn sweep_reclaims_entries_past_threshold() {
        let pool = BufferPool::new();
        let pooled = pool.rent(&vec![1u8; 70_000]);
        pool.sweep(0);
        assert_eq!(pool.active_count(), 0);
        drop(pooled);
    }

    #[test]
    fn released_backing_array_is_reused_by_a_same_size_rental() {
        let pool = BufferPool::new();
        let mut first = pool.rent(&vec![5u8; 70_000]);
        let first_ptr = first.as_slice().as_ptr();
        first.release();

        let second = pool.rent(&vec![9u8; 70_000]);
        assert_eq!(second.as_slice().as_ptr(), first_ptr);
        assert_eq!(second.as_slice(), vec![9u8; 70_000].as_slice());
    }

    #[test]
    fn try_rent_reports_exhaustion_at_capacity() {
        let pool = BufferPool::with_capacity(1);
        let _first = pool.try_rent(&vec![1u8; 70_000]).unwrap();
        let result = pool.try_rent(&vec![1u8; 70_000]);
        assert!(matches!(result, Err(AllocError::PoolExhausted)));
    }
}
