//! Context switch primitive
//!
//! Every kernel thread owns a [`RunToken`]. Switching from A to B resumes B's
//! token and parks A on its own; a dying thread resumes its successor and
//! simply stops. The token is a latch, so a resume that arrives before the
//! matching park is not lost.
//!
//! Threads that leave the kernel without returning (exit, forced termination,
//! shutdown) unwind their host stack with an [`Unwind`] payload that the host
//! thread's entry point swallows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Payload used to unwind a host thread out of kernel code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unwind {
    /// The thread called exit (possibly forced)
    Exited,
    /// The kernel was shut down while the thread was parked
    Shutdown,
}

pub(crate) fn unwind(reason: Unwind) -> ! {
    std::panic::resume_unwind(Box::new(reason))
}

/// Kernel shut down while waiting for the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShutDown;

#[derive(Debug, Default)]
pub(crate) struct RunToken {
    resumed: Mutex<bool>,
    wakeup: Condvar,
}

impl RunToken {
    pub fn resume(&self) {
        let mut resumed = self.resumed.lock().unwrap_or_else(PoisonError::into_inner);
        *resumed = true;
        self.wakeup.notify_one();
    }

    /// Wait until resumed; a pending resume is consumed immediately
    pub fn park(&self, shutdown: &AtomicBool) -> Result<(), ShutDown> {
        let mut resumed = self.resumed.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *resumed {
                *resumed = false;
                return Ok(());
            }
            if shutdown.load(Ordering::SeqCst) {
                return Err(ShutDown);
            }
            resumed = self
                .wakeup
                .wait(resumed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake a parked owner so it can observe the shutdown flag
    pub fn interrupt(&self) {
        let _resumed = self.resumed.lock().unwrap_or_else(PoisonError::into_inner);
        self.wakeup.notify_all();
    }
}
