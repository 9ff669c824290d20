//! Logical CPUs
//!
//! Each [`Cpu`] carries the per-processor scheduling state: the running thread,
//! the thread that ran before the last switch, the idle thread, tick counters,
//! the pending-reschedule flag and a simulated interrupt flag.
//!
//! Design:
//! - A host thread that runs kernel code is bound to exactly one kernel thread;
//!   the thread records which CPU it currently occupies. The binding plays the
//!   role of the per-CPU "current thread" register.
//! - Interrupt masking is a per-CPU flag. Host threads that are not bound to a
//!   kernel thread have no CPU: masking is a no-op for them and they always
//!   observe interrupts as disabled.
//! - A halted CPU sleeps on a condvar and is woken by a reschedule request
//!   (the IPI broadcast), by its clock period expiring, or by shutdown.

use super::error::{KernelError, KernelResult};
use super::thread::Thread;
use super::Kernel;
use serde::Serialize;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;

// ============================================================================
// Host thread binding
// ============================================================================

/// Kernel thread running on the calling host thread
pub(crate) struct Binding {
    pub kernel: Kernel,
    pub thread: Arc<Thread>,
}

thread_local! {
    static BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

pub(crate) fn bind(kernel: Kernel, thread: Arc<Thread>) -> KernelResult<()> {
    BINDING.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(KernelError::AlreadyBound);
        }
        *slot = Some(Binding { kernel, thread });
        Ok(())
    })
}

pub(crate) fn unbind() -> Option<Binding> {
    BINDING.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

pub(crate) fn with_binding<R>(f: impl FnOnce(&Binding) -> R) -> Option<R> {
    BINDING
        .try_with(|slot| slot.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

/// Index of the CPU the calling host thread runs on, if it runs kernel code
pub(crate) fn current_cpu_index() -> Option<usize> {
    with_binding(|binding| binding.thread.cpu_index())
}

fn with_current_cpu<R>(f: impl FnOnce(&Cpu) -> R) -> Option<R> {
    with_binding(|binding| f(binding.kernel.cpu(binding.thread.cpu_index())))
}

// ============================================================================
// Interrupt masking
// ============================================================================

/// Saved interrupt flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntrState {
    Enabled,
    Disabled,
}

impl IntrState {
    fn from_flag(enabled: bool) -> Self {
        if enabled {
            IntrState::Enabled
        } else {
            IntrState::Disabled
        }
    }
}

/// Mask interrupts on the current CPU, returning the previous state
pub fn intr_disable() -> IntrState {
    with_current_cpu(|cpu| cpu.swap_intr(false)).unwrap_or(IntrState::Disabled)
}

/// Unmask interrupts on the current CPU, returning the previous state
pub fn intr_enable() -> IntrState {
    with_current_cpu(|cpu| cpu.swap_intr(true)).unwrap_or(IntrState::Disabled)
}

/// Restore a state returned by [`intr_disable`] or [`intr_enable`]
pub fn intr_set_state(state: IntrState) {
    with_current_cpu(|cpu| cpu.swap_intr(state == IntrState::Enabled));
}

pub fn intr_state() -> IntrState {
    with_current_cpu(|cpu| IntrState::from_flag(cpu.intr_enabled.load(Ordering::SeqCst)))
        .unwrap_or(IntrState::Disabled)
}

// ============================================================================
// Halt
// ============================================================================

/// Why a halted CPU resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltOutcome {
    /// A reschedule request arrived
    Interrupted,
    /// The clock period elapsed
    ClockTick,
    Shutdown,
}

#[derive(Debug, Default)]
struct Halt {
    pending: Mutex<bool>,
    wakeup: Condvar,
}

impl Halt {
    fn wait(&self, period: Duration, shutdown: &AtomicBool) -> HaltOutcome {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return HaltOutcome::Shutdown;
            }
            if *pending {
                *pending = false;
                return HaltOutcome::Interrupted;
            }
            let (guard, result) = self
                .wakeup
                .wait_timeout(pending, period)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
            if result.timed_out() && !*pending && !shutdown.load(Ordering::SeqCst) {
                return HaltOutcome::ClockTick;
            }
        }
    }

    fn wake(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.wakeup.notify_all();
    }
}

// ============================================================================
// Per-CPU state
// ============================================================================

/// Tick counters of one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub index: usize,
    /// Ticks that landed while the idle thread was running
    pub idle_ticks: u64,
    /// Ticks that landed while any other thread was running
    pub kernel_ticks: u64,
}

pub struct Cpu {
    index: usize,
    intr_enabled: AtomicBool,
    yield_requested: AtomicBool,
    current: spin::Mutex<Option<Arc<Thread>>>,
    previous: spin::Mutex<Option<Arc<Thread>>>,
    idle: OnceLock<Arc<Thread>>,
    running_thread_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    kernel_ticks: AtomicU64,
    halt: Halt,
}

impl Cpu {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            intr_enabled: AtomicBool::new(false),
            yield_requested: AtomicBool::new(false),
            current: spin::Mutex::new(None),
            previous: spin::Mutex::new(None),
            idle: OnceLock::new(),
            running_thread_ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            kernel_ticks: AtomicU64::new(0),
            halt: Halt::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn swap_intr(&self, enabled: bool) -> IntrState {
        IntrState::from_flag(self.intr_enabled.swap(enabled, Ordering::SeqCst))
    }

    pub(crate) fn current(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    pub(crate) fn set_current(&self, thread: Arc<Thread>) {
        *self.current.lock() = Some(thread);
    }

    pub(crate) fn previous(&self) -> Option<Arc<Thread>> {
        self.previous.lock().clone()
    }

    pub(crate) fn set_previous(&self, thread: Option<Arc<Thread>>) {
        *self.previous.lock() = thread;
    }

    pub(crate) fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.idle.get().cloned()
    }

    pub(crate) fn set_idle_thread(&self, thread: Arc<Thread>) {
        let installed = self.idle.set(thread).is_ok();
        assert!(installed, "cpu {} already has an idle thread", self.index);
    }

    pub(crate) fn is_idle_thread(&self, thread: &Arc<Thread>) -> bool {
        self.idle.get().is_some_and(|idle| Arc::ptr_eq(idle, thread))
    }

    /// Deliver a reschedule request (the yield IPI)
    pub(crate) fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::SeqCst);
        self.halt.wake();
    }

    /// Reschedule request raised by this CPU for itself; no wakeup needed
    pub(crate) fn request_local_yield(&self) {
        self.yield_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn take_yield_request(&self) -> bool {
        self.yield_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn reset_running_ticks(&self) {
        self.running_thread_ticks.store(0, Ordering::SeqCst);
    }

    /// Account one clock tick; returns the ticks the running thread has used
    pub(crate) fn account_tick(&self, idle: bool) -> u64 {
        if idle {
            self.idle_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.kernel_ticks.fetch_add(1, Ordering::Relaxed);
        }
        self.running_thread_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn halt(&self, period: Duration, shutdown: &AtomicBool) -> HaltOutcome {
        self.halt.wait(period, shutdown)
    }

    pub(crate) fn wake(&self) {
        self.halt.wake();
    }

    pub fn stats(&self) -> CpuStats {
        CpuStats {
            index: self.index,
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            kernel_ticks: self.kernel_ticks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("index", &self.index)
            .field("intr_enabled", &self.intr_enabled.load(Ordering::Relaxed))
            .field("yield_requested", &self.yield_requested())
            .finish_non_exhaustive()
    }
}
