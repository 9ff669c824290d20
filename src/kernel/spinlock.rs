//! Interrupt-safe spinlock with owner tracking
//!
//! Wraps a [`spin::mutex::TicketMutex`] (FIFO fairness between CPUs) and adds
//! what the scheduler needs on top of it:
//!
//! - Waiting for a ticket yields the host thread between checks, so a CPU
//!   whose holder was descheduled by the host does not burn the waiter's slice.
//!
//! - Acquiring masks interrupts on the current CPU; releasing restores the
//!   state that was saved at acquire time.
//! - The owning CPU is recorded, so code can ask "does this CPU hold it?" and
//!   a CPU that tries to take a lock it already holds fails loudly instead of
//!   spinning forever.
//! - A held lock can be handed across a context switch: the thread that
//!   switches away forgets its guard and the thread that resumes releases the
//!   lock explicitly.
//!
//! Lock ordering: a thread's block lock and resource locks are always taken
//! before the ready-list lock.

use super::cpu::{self, IntrState};
use spin::mutex::{TicketMutex, TicketMutexGuard};
use spin::relax::Yield;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

const NO_OWNER: usize = usize::MAX;
/// Owner tag for host threads that are not running kernel code
const EXTERNAL_OWNER: usize = usize::MAX - 1;

pub struct SpinLock<T> {
    inner: TicketMutex<T, Yield>,
    owner: AtomicUsize,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: TicketMutex::new(value),
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Mask interrupts and spin until the lock is ours
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let saved = cpu::intr_disable();
        let tag = owner_tag();
        if tag != EXTERNAL_OWNER {
            assert_ne!(
                self.owner.load(Ordering::Acquire),
                tag,
                "spinlock acquired twice by cpu {tag}"
            );
        }
        let guard = self.inner.lock();
        self.owner.store(tag, Ordering::Release);
        SpinLockGuard {
            lock: self,
            guard: ManuallyDrop::new(guard),
            saved,
        }
    }

    /// True if the calling CPU holds this lock
    pub fn is_owned_by_current_cpu(&self) -> bool {
        cpu::current_cpu_index().is_some_and(|index| self.owner.load(Ordering::Acquire) == index)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Release a lock whose guard was handed off with [`SpinLockGuard::hand_off`].
    ///
    /// Interrupts are left as they are.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current CPU through a handed-off guard and
    /// no live guard may refer to it.
    pub unsafe fn release_handed_off(&self) {
        assert!(
            self.is_owned_by_current_cpu(),
            "releasing a handed-off spinlock not owned by this cpu"
        );
        self.owner.store(NO_OWNER, Ordering::Release);
        unsafe { self.inner.force_unlock() };
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            tag => Some(tag),
        };
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .field("owner", &owner)
            .finish_non_exhaustive()
    }
}

fn owner_tag() -> usize {
    cpu::current_cpu_index().unwrap_or(EXTERNAL_OWNER)
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    guard: ManuallyDrop<TicketMutexGuard<'a, T>>,
    saved: IntrState,
}

impl<T> SpinLockGuard<'_, T> {
    /// Keep the lock held past this guard, with interrupts left masked.
    ///
    /// Whoever runs next on this CPU releases it with
    /// [`SpinLock::release_handed_off`].
    pub fn hand_off(self) {
        let _held = ManuallyDrop::new(self);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Release);
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        cpu::intr_set_state(self.saved);
    }
}
