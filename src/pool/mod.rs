//! Generic resource pool
//!
//! Per-token entries hold a small fixed array of slots; each slot is
//! `Unallocated`, `Available`, `CheckedOut` or `Locked`. Acquisition is
//! fail-fast: contention surfaces as `EntryUnavailable` and callers choose
//! their retry policy, so pools never deadlock against each other.
//!
//! An acquired resource is owned exclusively by its caller through a
//! [`PoolHandle`]; dropping the handle returns the resource to its slot.

pub mod kinds;

use crate::error::{EngineError, Result};
use crate::table::token::TableToken;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Factory<T> = Box<dyn Fn(&TableToken) -> Result<T> + Send + Sync>;
/// Per-thread observer for test harnesses asserting leak-freedom.
pub type SupervisorHook = Box<dyn Fn(PoolEvent, &TableToken) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Acquire,
    Release,
    Evict,
}

enum Slot<T> {
    Unallocated,
    Available { resource: T, since: Instant },
    CheckedOut,
    Locked,
}

struct Entry<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

struct PoolInner<T> {
    busy_reason: &'static str,
    entries: DashMap<String, Arc<Entry<T>>, ahash::RandomState>,
    factory: Factory<T>,
    slots_per_entry: usize,
    idle_ttl: Duration,
    busy: AtomicUsize,
    closed: AtomicBool,
    supervisor: Mutex<Option<SupervisorHook>>,
}

impl<T> PoolInner<T> {
    fn notify(&self, event: PoolEvent, token: &TableToken) {
        if let Some(hook) = self.supervisor.lock().as_ref() {
            hook(event, token);
        }
    }
}

pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        busy_reason: &'static str,
        slots_per_entry: usize,
        idle_ttl: Duration,
        factory: Factory<T>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                busy_reason,
                entries: DashMap::with_hasher(ahash::RandomState::new()),
                factory,
                slots_per_entry,
                idle_ttl,
                busy: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    fn entry(&self, token: &TableToken) -> Arc<Entry<T>> {
        self.inner
            .entries
            .entry(token.dir_name().to_string())
            .or_insert_with(|| {
                let mut slots = Vec::with_capacity(self.inner.slots_per_entry);
                slots.resize_with(self.inner.slots_per_entry, || Slot::Unallocated);
                Arc::new(Entry {
                    slots: Mutex::new(slots),
                })
            })
            .clone()
    }

    /// Check a resource out, constructing one when a slot is free. Fails with
    /// `EntryUnavailable` when the entry is locked or at capacity; there is
    /// no blocking wait.
    pub fn get(&self, token: &TableToken) -> Result<PoolHandle<T>> {
        let entry = self.entry(token);
        let mut slots = entry.slots.lock();

        if slots.iter().any(|s| matches!(s, Slot::Locked)) {
            return Err(EngineError::EntryUnavailable {
                table: token.table_name().to_string(),
                reason: "locked",
            });
        }
        // Prefer a warm resource over constructing a new one.
        let position = slots
            .iter()
            .position(|s| matches!(s, Slot::Available { .. }))
            .or_else(|| slots.iter().position(|s| matches!(s, Slot::Unallocated)));
        let Some(index) = position else {
            return Err(EngineError::EntryUnavailable {
                table: token.table_name().to_string(),
                reason: self.inner.busy_reason,
            });
        };

        let resource = match std::mem::replace(&mut slots[index], Slot::CheckedOut) {
            Slot::Available { resource, .. } => resource,
            Slot::Unallocated => match (self.inner.factory)(token) {
                Ok(resource) => resource,
                Err(err) => {
                    slots[index] = Slot::Unallocated;
                    return Err(err);
                }
            },
            _ => unreachable!("slot state checked above"),
        };
        drop(slots);

        self.inner.busy.fetch_add(1, Ordering::AcqRel);
        self.inner.notify(PoolEvent::Acquire, token);
        Ok(PoolHandle {
            resource: Some(resource),
            token: token.clone(),
            entry,
            slot: index,
            inner: self.inner.clone(),
        })
    }

    /// Atomically transition every slot of the token to `Locked`. When any
    /// slot is checked out the entry is left untouched and the busy reason is
    /// returned. Idle resources are closed by the transition.
    pub fn lock(&self, token: &TableToken) -> std::result::Result<(), &'static str> {
        let entry = self.entry(token);
        let mut slots = entry.slots.lock();
        if slots.iter().any(|s| matches!(s, Slot::CheckedOut)) {
            return Err(self.inner.busy_reason);
        }
        for slot in slots.iter_mut() {
            if let Slot::Available { .. } = slot {
                self.inner.notify(PoolEvent::Evict, token);
            }
            *slot = Slot::Locked;
        }
        Ok(())
    }

    pub fn unlock(&self, token: &TableToken) {
        let entry = self.entry(token);
        let mut slots = entry.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(slot, Slot::Locked) {
                *slot = Slot::Unallocated;
            }
        }
    }

    /// Close resources idle longer than the configured interval. Returns
    /// whether any slot was freed, so the maintenance job can report useful
    /// work.
    pub fn release_inactive(&self) -> bool {
        let mut freed = false;
        for entry in self.inner.entries.iter() {
            let mut slots = entry.value().slots.lock();
            for slot in slots.iter_mut() {
                if let Slot::Available { since, .. } = slot {
                    if since.elapsed() >= self.inner.idle_ttl {
                        *slot = Slot::Unallocated;
                        freed = true;
                    }
                }
            }
        }
        freed
    }

    /// Close all idle resources immediately.
    pub fn release_all(&self) {
        for entry in self.inner.entries.iter() {
            let mut slots = entry.value().slots.lock();
            for slot in slots.iter_mut() {
                if matches!(slot, Slot::Available { .. }) {
                    *slot = Slot::Unallocated;
                }
            }
        }
    }

    /// Drop the token's entry entirely; used after a table is dropped while
    /// its pools are locked.
    pub fn purge(&self, token: &TableToken) {
        self.inner.entries.remove(token.dir_name());
    }

    pub fn busy_count(&self) -> usize {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Mark the pool closed: released resources are dropped instead of
    /// returned to their slot.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.release_all();
    }

    pub fn set_supervisor(&self, hook: Option<SupervisorHook>) {
        *self.inner.supervisor.lock() = hook;
    }
}

/// Exclusive ownership of one pooled resource; the drop hook re-inserts it
/// into its slot.
pub struct PoolHandle<T: Send + 'static> {
    resource: Option<T>,
    token: TableToken,
    entry: Arc<Entry<T>>,
    slot: usize,
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> std::fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("token", &self.token)
            .field("slot", &self.slot)
            .finish()
    }
}

impl<T: Send + 'static> PoolHandle<T> {
    pub fn token(&self) -> &TableToken {
        &self.token
    }

    /// Close the resource instead of returning it to the pool (used when the
    /// resource is known to be broken).
    pub fn close_resource(mut self) {
        self.resource = None;
    }
}

impl<T: Send + 'static> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource present until drop")
    }
}

impl<T: Send + 'static> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource present until drop")
    }
}

impl<T: Send + 'static> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        let mut slots = self.entry.slots.lock();
        if let Slot::CheckedOut = slots[self.slot] {
            slots[self.slot] = match self.resource.take() {
                Some(resource) if !self.inner.closed.load(Ordering::Acquire) => Slot::Available {
                    resource,
                    since: Instant::now(),
                },
                _ => Slot::Unallocated,
            };
        }
        drop(slots);
        self.inner.busy.fetch_sub(1, Ordering::AcqRel);
        self.inner.notify(PoolEvent::Release, &self.token);
    }
}
