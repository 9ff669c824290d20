//! Blocking mutex with priority donation
//!
//! Design:
//! - The holder may re-acquire a recursive mutex up to [`MAX_RECURSION_DEPTH`]
//!   times; a non-recursive mutex allows depth 1 and re-acquiring it panics.
//! - A contender whose priority exceeds the holder's donates it. Donation
//!   follows the chain holder -> mutex it waits on -> that mutex's holder and
//!   stops at the first thread that already runs at least that high.
//! - Releasing the last level recomputes the releaser's priority from its
//!   real priority and the waiters of the mutexes it still holds, then hands
//!   the mutex to the highest-priority waiter.
//!
//! Locking: the internal state lock is a spinlock and is never held across a
//! block. The holder cell is a leaf lock so donation chains can be walked
//! without taking other mutexes' state locks.

use super::cpu;
use super::queue::ThreadQueue;
use super::spinlock::SpinLock;
use super::thread::{Thread, ThreadId, ThreadState};
use super::Kernel;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Deepest nesting allowed for a recursive mutex
pub const MAX_RECURSION_DEPTH: u32 = u8::MAX as u32;

#[derive(Debug)]
struct MutexState {
    waiters: ThreadQueue,
}

pub(crate) struct MutexCore {
    state: SpinLock<MutexState>,
    holder: spin::Mutex<Option<Arc<Thread>>>,
    /// Only touched by the holder, or by the releaser while handing off
    depth: AtomicU32,
    max_depth: u32,
}

impl MutexCore {
    pub(crate) fn holder(&self) -> Option<Arc<Thread>> {
        self.holder.lock().clone()
    }

    fn is_held_by(&self, thread: &Arc<Thread>) -> bool {
        self.holder
            .lock()
            .as_ref()
            .is_some_and(|holder| Arc::ptr_eq(holder, thread))
    }

    /// Highest priority among the live threads waiting for this mutex
    pub(crate) fn max_waiter_priority(&self) -> Option<u8> {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|waiter| waiter.state() != ThreadState::Dying)
            .map(|waiter| waiter.priority())
            .max()
    }
}

pub struct Mutex {
    core: Arc<MutexCore>,
}

impl Mutex {
    pub fn new(recursive: bool) -> Self {
        let max_depth = if recursive { MAX_RECURSION_DEPTH } else { 1 };
        Self {
            core: Arc::new(MutexCore {
                state: SpinLock::new(MutexState {
                    waiters: ThreadQueue::new(),
                }),
                holder: spin::Mutex::new(None),
                depth: AtomicU32::new(0),
                max_depth,
            }),
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.core.max_depth > 1
    }

    pub fn holder_id(&self) -> Option<ThreadId> {
        self.core.holder().map(|holder| holder.id())
    }

    pub fn is_held(&self) -> bool {
        self.core.holder().is_some()
    }

    /// Current recursion depth; zero when free
    pub fn depth(&self) -> u32 {
        self.core.depth.load(Ordering::SeqCst)
    }

    pub fn waiter_count(&self) -> usize {
        self.core.state.lock().waiters.len()
    }

    /// Acquire the mutex, blocking while another thread holds it
    pub fn acquire(&self) {
        let kernel = Kernel::current();
        let current = kernel.current_thread();
        let core = &self.core;

        if core.is_held_by(&current) {
            let depth = core.depth.load(Ordering::SeqCst);
            assert!(
                depth < core.max_depth,
                "{} exceeded the recursion depth of a mutex ({})",
                current.id(),
                core.max_depth
            );
            current.set_waiting_on(None);
            core.depth.store(depth + 1, Ordering::SeqCst);
            return;
        }

        let saved = cpu::intr_disable();
        let mut state = core.state.lock();

        {
            let mut holder = core.holder.lock();
            if holder.is_none() {
                *holder = Some(current.clone());
                core.depth.store(1, Ordering::SeqCst);
            }
        }

        while !core.is_held_by(&current) {
            if let Some(holder) = core.holder()
                && current.priority() > holder.priority()
            {
                donate_priority(&kernel, &current, &holder);
            }
            state.waiters.insert_ordered(current.clone());
            current.set_waiting_on(Some(core.clone()));
            kernel.take_block_lock();
            drop(state);
            kernel.block();
            state = core.state.lock();
        }

        current.set_waiting_on(None);
        current.add_acquired(core.clone());
        drop(state);
        cpu::intr_set_state(saved);
    }

    /// Release one level; the last level hands the mutex to a waiter
    pub fn release(&self) {
        let kernel = Kernel::current();
        let current = kernel.current_thread();
        let core = &self.core;

        assert!(
            core.is_held_by(&current),
            "{} released a mutex it does not hold",
            current.id()
        );

        let depth = core.depth.load(Ordering::SeqCst);
        if depth > 1 {
            core.depth.store(depth - 1, Ordering::SeqCst);
            return;
        }

        let mut state = core.state.lock();
        current.remove_acquired(core);
        recompute_priority(&current);

        // the exiting check in unblock runs under the waiter's block lock
        let next = loop {
            let Some(waiter) = state.waiters.pop_highest() else {
                break None;
            };
            *core.holder.lock() = Some(waiter.clone());
            core.depth.store(1, Ordering::SeqCst);
            if kernel.unblock(&waiter) {
                break Some(waiter);
            }
            debug!("{} skips {}, it is exiting", current.id(), waiter.id());
        };

        match next {
            Some(next) => debug!("{} hands a mutex to {}", current.id(), next.id()),
            None => {
                *core.holder.lock() = None;
                core.depth.store(0, Ordering::SeqCst);
            }
        }
        drop(state);
    }

    /// Acquire and return a guard that releases on drop
    pub fn lock(&self) -> MutexGuard<'_> {
        self.acquire();
        MutexGuard { mutex: self }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("holder", &self.holder_id())
            .field("depth", &self.depth())
            .field("recursive", &self.is_recursive())
            .finish()
    }
}

/// Releases one level of a [`Mutex`] when dropped
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // a thread that already left the kernel (exit, shutdown) keeps it held
        if Kernel::try_current().is_some() {
            self.mutex.release();
        }
    }
}

/// Raise the holder chain to the donor's priority
pub(crate) fn donate_priority(kernel: &Kernel, donor: &Arc<Thread>, holder: &Arc<Thread>) {
    let priority = donor.priority();
    let mut target = Some(holder.clone());
    while let Some(thread) = target {
        if priority <= thread.priority() {
            break;
        }
        thread.set_priority(priority);
        kernel.reposition_ready(&thread);
        target = thread.waiting_on().and_then(|mutex| mutex.holder());
    }
}

/// Take an exiting thread off the wait list it sits on and lower the holder
/// chain it was donating to
pub(crate) fn withdraw_waiter(kernel: &Kernel, thread: &Arc<Thread>) {
    let Some(core) = thread.waiting_on() else {
        return;
    };
    thread.set_waiting_on(None);
    if !core.state.lock().waiters.remove(thread) {
        return;
    }

    let mut lowered = false;
    let mut target = core.holder();
    while let Some(holder) = target {
        let before = holder.priority();
        recompute_priority(&holder);
        if holder.priority() == before {
            break;
        }
        lowered = true;
        kernel.reposition_ready(&holder);
        target = holder.waiting_on().and_then(|mutex| mutex.holder());
    }
    if lowered {
        debug!("{} withdrew, holder chain of its mutex lowered", thread.id());
        kernel.broadcast_reschedule();
    }
}

/// Effective priority = max(real priority, waiters of every held mutex)
pub(crate) fn recompute_priority(thread: &Thread) {
    let donated = thread
        .acquired_mutexes()
        .iter()
        .filter_map(|mutex| mutex.max_waiter_priority())
        .max();
    let priority = donated.map_or(thread.real_priority(), |donated| {
        donated.max(thread.real_priority())
    });
    thread.set_priority(priority);
}
