//! # Object Pool
//!
//! Arena of reusable objects handed out as RAII guards, so hot paths that
//! assemble many small packets per tick do not churn the allocator.
//!
//! ## Ownership
//! Every instance is either *checked out* (owned by the holder of the
//! [`Pooled`] guard) or *available* (owned by the pool). The guard releases
//! its slot when dropped, so release happens on every exit path including
//! early returns and `?`. A released guard cannot be used again because it no
//! longer exists.
//!
//! Slots are addressed by a [`PoolHandle`] (index + generation). The
//! generation is bumped on every release, which makes a stale handle
//! detectable instead of silently aliasing a newer checkout.
//!
//! ## Leak Detection
//! When enabled, each checkout is timestamped. [`ObjectPool::sweep_leaks`]
//! reports every instance held past the threshold exactly once. The report is
//! diagnostic only: the instance is never reclaimed behind its holder's back.
//!
//! ## Thread Safety
//! Pools are always internally synchronised and cheap to clone; clones share
//! the same slots. Guards may be moved to other threads when `T: Send`.
//!
//! ## Usage
//! ```rust
//! use tickwire::utils::pool::{ObjectPool, PoolSettings, Recycle};
//!
//! #[derive(Default)]
//! struct Scratch(Vec<u8>);
//!
//! impl Recycle for Scratch {
//!     fn recycle(&mut self) {
//!         self.0.clear();
//!     }
//! }
//!
//! let pool = ObjectPool::new(PoolSettings::default(), Scratch::default);
//! {
//!     let mut scratch = pool.checkout().unwrap();
//!     scratch.0.extend_from_slice(b"tick");
//! } // released here
//! assert_eq!(pool.stats().available, 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{constants, ProtocolError, Result};

/// Objects that can be reset and handed out again
pub trait Recycle {
    /// Return the object to its freshly-constructed state.
    fn recycle(&mut self);

    /// Whether the object is worth keeping after use.
    ///
    /// Returning `false` drops the instance on release; the slot is refilled
    /// from the factory on a later checkout.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Slot address of a checked-out object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    index: usize,
    generation: u32,
}

impl PoolHandle {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Pool sizing and diagnostics
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    /// Instances constructed up front
    pub initial_size: usize,
    /// Upper bound on live instances; `None` lets the pool grow
    pub max_size: Option<usize>,
    /// Report checkouts held longer than this; `None` disables tracking
    pub leak_threshold: Option<Duration>,
}

/// A checkout held past the leak threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    pub handle: PoolHandle,
    pub held_for: Duration,
}

impl LeakReport {
    pub fn to_error(&self) -> ProtocolError {
        ProtocolError::PoolExhaustionSuspected {
            index: self.handle.index,
            held_ms: self.held_for.as_millis(),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots ever created
    pub created: usize,
    /// Slots currently owned by the pool
    pub available: usize,
    /// Slots currently owned by callers
    pub checked_out: usize,
    /// Lifetime checkouts
    pub total_checkouts: u64,
    /// Lifetime leak reports
    pub leaks_reported: u64,
}

enum SlotState<T> {
    /// `None` when the previous instance was not worth keeping
    Available(Option<T>),
    CheckedOut {
        since: Option<Instant>,
        reported: bool,
    },
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    total_checkouts: u64,
    leaks_reported: u64,
}

type Factory<T> = dyn Fn() -> T + Send + Sync;

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    factory: Box<Factory<T>>,
    settings: PoolSettings,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // Slot bookkeeping is updated atomically under the lock and never
        // panics midway, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!(reason = constants::ERR_POOL_LOCK_POISONED, "Recovering pool state");
            poisoned.into_inner()
        })
    }

    /// Put `item` back into the slot `handle` points at.
    ///
    /// Returns `false` if the slot is not checked out under that handle.
    fn give_back(&self, handle: PoolHandle, item: Option<T>) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(handle.index) else {
            return false;
        };
        if slot.generation != handle.generation
            || !matches!(slot.state, SlotState::CheckedOut { .. })
        {
            return false;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Available(item);
        state.free.push(handle.index);
        true
    }
}

/// Generic pool of recyclable objects
pub struct ObjectPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Recycle + Default> ObjectPool<T> {
    /// Create a pool, constructing `settings.initial_size` instances up front.
    pub fn new<F>(settings: PoolSettings, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let initial = match settings.max_size {
            Some(max) => settings.initial_size.min(max),
            None => settings.initial_size,
        };

        let mut slots = Vec::with_capacity(initial);
        for _ in 0..initial {
            slots.push(Slot {
                generation: 0,
                state: SlotState::Available(Some(factory())),
            });
        }
        // Pop order hands out slot 0 first
        let free = (0..initial).rev().collect();

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    slots,
                    free,
                    total_checkouts: 0,
                    leaks_reported: 0,
                }),
                factory: Box::new(factory),
                settings,
            }),
        }
    }

    /// Growable pool with `initial_size` instances built up front and no
    /// leak tracking.
    pub fn with_capacity<F>(initial_size: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(
            PoolSettings {
                initial_size,
                ..Default::default()
            },
            factory,
        )
    }

    /// Take an instance out of the pool.
    ///
    /// Reuses a free slot when one exists, otherwise constructs a new
    /// instance. Fixed-size pools fail with `PoolExhausted` once every slot is
    /// checked out.
    pub fn checkout(&self) -> Result<Pooled<T>> {
        let since = self.shared.settings.leak_threshold.map(|_| Instant::now());
        let checked_out = SlotState::CheckedOut {
            since,
            reported: false,
        };

        let (handle, item) = {
            let mut state = self.shared.lock();
            state.total_checkouts += 1;

            if let Some(index) = state.free.pop() {
                let slot = &mut state.slots[index];
                let previous = std::mem::replace(&mut slot.state, checked_out);
                let item = match previous {
                    SlotState::Available(item) => item,
                    SlotState::CheckedOut { .. } => None,
                };
                (
                    PoolHandle {
                        index,
                        generation: slot.generation,
                    },
                    item,
                )
            } else {
                let created = state.slots.len();
                if let Some(max) = self.shared.settings.max_size {
                    if created >= max {
                        state.total_checkouts -= 1;
                        warn!(capacity = max, "Object pool exhausted");
                        return Err(ProtocolError::PoolExhausted(max));
                    }
                }
                state.slots.push(Slot {
                    generation: 0,
                    state: checked_out,
                });
                debug!(slots = created + 1, "Object pool grew");
                (
                    PoolHandle {
                        index: created,
                        generation: 0,
                    },
                    None,
                )
            }
        };

        // Construct outside the lock so a slow or panicking factory cannot stall the pool
        let item = item.unwrap_or_else(|| (self.shared.factory)());

        Ok(Pooled {
            item,
            handle,
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Release a guard explicitly, verifying it belongs to this pool.
    ///
    /// A guard from another pool yields `NotOwned` and is returned to the
    /// pool it actually came from.
    pub fn release(&self, mut item: Pooled<T>) -> Result<()> {
        if !std::ptr::eq(item.pool.as_ptr(), Arc::as_ptr(&self.shared)) {
            warn!(slot = item.handle.index, "Release of object not owned by this pool");
            return Err(ProtocolError::NotOwned);
        }

        let mut value = std::mem::take(&mut item.item);
        let handle = item.handle;
        // Disarm the guard's own release
        item.pool = Weak::new();

        value.recycle();
        let keep = value.is_reusable().then_some(value);
        if self.shared.give_back(handle, keep) {
            Ok(())
        } else {
            warn!(slot = handle.index, "Release of slot that is not checked out");
            Err(ProtocolError::NotOwned)
        }
    }
}

impl<T> ObjectPool<T> {
    /// Whether `handle` still names an outstanding checkout.
    pub fn is_checked_out(&self, handle: PoolHandle) -> bool {
        let state = self.shared.lock();
        state.slots.get(handle.index).is_some_and(|slot| {
            slot.generation == handle.generation
                && matches!(slot.state, SlotState::CheckedOut { .. })
        })
    }

    /// Report checkouts held past the leak threshold.
    ///
    /// Each stale checkout is reported once. Nothing is reclaimed.
    pub fn sweep_leaks(&self) -> Vec<LeakReport> {
        let Some(threshold) = self.shared.settings.leak_threshold else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut reports = Vec::new();
        {
            let mut state = self.shared.lock();
            for (index, slot) in state.slots.iter_mut().enumerate() {
                if let SlotState::CheckedOut {
                    since: Some(since),
                    reported,
                } = &mut slot.state
                {
                    let held_for = now.saturating_duration_since(*since);
                    if !*reported && held_for >= threshold {
                        *reported = true;
                        reports.push(LeakReport {
                            handle: PoolHandle {
                                index,
                                generation: slot.generation,
                            },
                            held_for,
                        });
                    }
                }
            }
            state.leaks_reported += reports.len() as u64;
        }

        for report in &reports {
            error!(
                slot = report.handle.index,
                held_ms = report.held_for.as_millis() as u64,
                error = %report.to_error(),
                "Pooled object held past leak threshold"
            );
        }
        reports
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let created = state.slots.len();
        let available = state.free.len();
        PoolStats {
            created,
            available,
            checked_out: created - available,
            total_checkouts: state.total_checkouts,
            leaks_reported: state.leaks_reported,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }
}

/// A checked-out object that returns to its pool when dropped
pub struct Pooled<T: Recycle + Default> {
    item: T,
    handle: PoolHandle,
    pool: Weak<Shared<T>>,
}

impl<T: Recycle + Default> Pooled<T> {
    #[inline]
    pub fn handle(&self) -> PoolHandle {
        self.handle
    }

    /// Take the object out of pool management.
    ///
    /// The slot is freed and refilled from the factory on a later checkout.
    pub fn into_inner(mut self) -> T {
        let item = std::mem::take(&mut self.item);
        if let Some(shared) = self.pool.upgrade() {
            shared.give_back(self.handle, None);
        }
        self.pool = Weak::new();
        item
    }
}

impl<T: Recycle + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        // Pool already torn down: the instance is simply freed
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let mut item = std::mem::take(&mut self.item);
        item.recycle();
        let keep = item.is_reusable().then_some(item);
        if !shared.give_back(self.handle, keep) {
            warn!(slot = self.handle.index, "Pooled object dropped for a stale slot");
        }
    }
}

impl<T: Recycle + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T: Recycle + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

impl<T: Recycle + Default + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("handle", &self.handle)
            .field("item", &self.item)
            .finish()
    }
}
