//! Wait/notify events
//!
//! An [`Event`] is a signalled flag with a list of blocked waiters, built
//! directly on the scheduler's block/unblock primitives.
//!
//! - Notification events stay signalled until cleared and release every
//!   waiter.
//! - Synchronization events release one waiter per signal and reset when that
//!   waiter consumes the signal.

use super::cpu;
use super::queue::ThreadQueue;
use super::spinlock::SpinLock;
use super::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Notification,
    Synchronization,
}

#[derive(Debug)]
struct EventState {
    signaled: bool,
    waiters: ThreadQueue,
}

pub struct Event {
    kind: EventKind,
    state: SpinLock<EventState>,
}

impl Event {
    pub fn new(kind: EventKind, signaled: bool) -> Self {
        Self {
            kind,
            state: SpinLock::new(EventState {
                signaled,
                waiters: ThreadQueue::new(),
            }),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Set the event and wake waiters
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        let woken: Vec<_> = match self.kind {
            EventKind::Notification => state.waiters.drain().collect(),
            EventKind::Synchronization => state.waiters.pop_front().into_iter().collect(),
        };
        for thread in woken {
            if let Some(kernel) = thread.kernel() {
                kernel.unblock(&thread);
            }
        }
    }

    pub fn clear(&self) {
        self.state.lock().signaled = false;
    }

    /// Block the calling kernel thread until the event is signalled
    pub fn wait(&self) {
        let kernel = Kernel::current();
        let current = kernel.current_thread();

        let saved = cpu::intr_disable();
        let mut state = self.state.lock();
        while !state.signaled {
            state.waiters.push_back(current.clone());
            kernel.take_block_lock();
            drop(state);
            kernel.block();
            state = self.state.lock();
        }
        if self.kind == EventKind::Synchronization {
            state.signaled = false;
        }
        drop(state);
        cpu::intr_set_state(saved);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("kind", &self.kind).finish_non_exhaustive()
    }
}
