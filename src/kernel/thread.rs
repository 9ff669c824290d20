//! Thread control blocks
//!
//! A [`Thread`] is the unit the scheduler runs. It is always reached through an
//! `Arc`, but its *lifetime in the kernel* is governed by an explicit reference
//! count: the count starts at one for the thread itself, every
//! [`ThreadHandle`] adds one, and the transition to zero destroys the thread
//! (it leaves the all-threads list, its stacks are returned, its owner is told).
//!
//! State machine:
//!
//! ```text
//! Blocked --unblock--> Ready --scheduled--> Running --yield/preempt--> Ready
//!                                              |  \--block--> Blocked
//!                                              \--exit--> Dying --last reference--> destroyed
//! ```

use super::error::{KernelError, KernelResult};
use super::event::{Event, EventKind};
use super::mutex::MutexCore;
use super::process::{ExecutionContext, UserStack};
use super::spinlock::SpinLock;
use super::stack::KernelStack;
use super::switch::RunToken;
use super::{Kernel, KernelShared};
use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Distance between consecutive thread ids
pub const TID_INCREMENT: u64 = 4;

/// Unique identifier for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Scheduling priority; larger values run first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(16);
    pub const MAXIMUM: Priority = Priority(31);

    pub fn new(value: u8) -> KernelResult<Self> {
        if value > Self::MAXIMUM.0 {
            return Err(KernelError::InvalidPriority(u32::from(value)));
        }
        Ok(Priority(value))
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = KernelError;

    fn try_from(value: u8) -> KernelResult<Self> {
        Priority::new(value)
    }
}

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    /// In the ready list, waiting for a CPU
    Ready,
    /// Executing on a CPU
    Running,
    /// Waiting for an unblock
    Blocked,
    /// Exited; waiting for its last reference to go away
    Dying,
}

impl ThreadState {
    const fn as_u8(self) -> u8 {
        match self {
            ThreadState::Ready => 0,
            ThreadState::Running => 1,
            ThreadState::Blocked => 2,
            ThreadState::Dying => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Dying,
        }
    }
}

/// How a thread finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitStatus {
    /// Returned from its entry function or called exit
    Code(i32),
    /// Exited because of a termination request
    Terminated,
    /// Its entry function panicked
    Panicked,
}

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus::Code(0);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

const FLAG_TERMINATE_PENDING: u8 = 1 << 0;
const FLAG_FORCE_TERMINATED: u8 = 1 << 1;

/// Per-thread tick accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadTicks {
    /// Clock ticks that landed while the thread was running
    pub completed: u64,
    /// Times the thread gave up the CPU on its own (yield or block)
    pub early: u64,
    /// Times the scheduler picked the thread again without switching
    pub uninterrupted: u64,
}

#[derive(Debug, Default)]
struct TickCounters {
    completed: AtomicU64,
    early: AtomicU64,
    uninterrupted: AtomicU64,
}

/// Snapshot of a thread for introspection
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority: u8,
    pub real_priority: u8,
    pub cpu: usize,
    pub references: usize,
    pub ticks: ThreadTicks,
}

/// Everything needed to build a control block
pub(crate) struct ThreadParams {
    pub id: ThreadId,
    pub name: String,
    pub priority: Priority,
    pub owner: Arc<dyn ExecutionContext>,
    pub kernel_stack: Option<KernelStack>,
    pub kernel: Weak<KernelShared>,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    state: AtomicU8,
    /// Effective priority, including donations
    priority: AtomicU8,
    real_priority: AtomicU8,
    flags: AtomicU8,
    ref_count: AtomicUsize,
    cpu: AtomicUsize,
    /// Held from "about to block" until the switch away has completed
    pub(crate) block_lock: SpinLock<()>,
    pub(crate) run_token: RunToken,
    waiting_on: spin::Mutex<Option<Arc<MutexCore>>>,
    acquired: spin::Mutex<Vec<Arc<MutexCore>>>,
    termination: Event,
    exit_status: spin::Mutex<Option<ExitStatus>>,
    owner: Arc<dyn ExecutionContext>,
    kernel: Weak<KernelShared>,
    kernel_stack: spin::Mutex<Option<KernelStack>>,
    user_stack: spin::Mutex<Option<UserStack>>,
    ticks: TickCounters,
}

impl Thread {
    pub(crate) fn new(params: ThreadParams) -> Self {
        Self {
            id: params.id,
            name: params.name,
            state: AtomicU8::new(ThreadState::Blocked.as_u8()),
            priority: AtomicU8::new(params.priority.value()),
            real_priority: AtomicU8::new(params.priority.value()),
            flags: AtomicU8::new(0),
            ref_count: AtomicUsize::new(1),
            cpu: AtomicUsize::new(0),
            block_lock: SpinLock::new(()),
            run_token: RunToken::default(),
            waiting_on: spin::Mutex::new(None),
            acquired: spin::Mutex::new(Vec::new()),
            termination: Event::new(EventKind::Notification, false),
            exit_status: spin::Mutex::new(None),
            owner: params.owner,
            kernel: params.kernel,
            kernel_stack: spin::Mutex::new(params.kernel_stack),
            user_stack: spin::Mutex::new(None),
            ticks: TickCounters::default(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Effective priority: the real priority raised by any donation
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Priority the thread asked for
    pub fn real_priority(&self) -> u8 {
        self.real_priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_real_priority(&self, priority: Priority) {
        self.real_priority.store(priority.value(), Ordering::SeqCst);
    }

    /// CPU the thread last ran on
    pub fn cpu_index(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cpu(&self, index: usize) {
        self.cpu.store(index, Ordering::SeqCst);
    }

    pub fn owner(&self) -> &Arc<dyn ExecutionContext> {
        &self.owner
    }

    pub(crate) fn kernel(&self) -> Option<Kernel> {
        self.kernel.upgrade().map(Kernel::from_shared)
    }

    // ------------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------------

    pub fn references(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn reference(&self) {
        let previous = self.ref_count.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "{} referenced after destruction", self.id);
    }

    /// Drop one reference; true when it was the last one
    pub(crate) fn release_reference(&self) -> bool {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{} reference count underflow", self.id);
        previous == 1
    }

    // ------------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------------

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock()
    }

    pub(crate) fn set_exit_status(&self, status: ExitStatus) {
        *self.exit_status.lock() = Some(status);
    }

    pub(crate) fn termination_event(&self) -> &Event {
        &self.termination
    }

    pub fn is_terminate_pending(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_TERMINATE_PENDING != 0
    }

    pub(crate) fn request_termination(&self) {
        self.flags.fetch_or(FLAG_TERMINATE_PENDING, Ordering::SeqCst);
    }

    pub fn was_force_terminated(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_FORCE_TERMINATED != 0
    }

    pub(crate) fn mark_force_terminated(&self) {
        self.flags.fetch_or(FLAG_FORCE_TERMINATED, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Mutex bookkeeping
    // ------------------------------------------------------------------------

    pub(crate) fn waiting_on(&self) -> Option<Arc<MutexCore>> {
        self.waiting_on.lock().clone()
    }

    pub(crate) fn set_waiting_on(&self, mutex: Option<Arc<MutexCore>>) {
        *self.waiting_on.lock() = mutex;
    }

    pub(crate) fn add_acquired(&self, mutex: Arc<MutexCore>) {
        self.acquired.lock().push(mutex);
    }

    pub(crate) fn remove_acquired(&self, mutex: &Arc<MutexCore>) {
        self.acquired.lock().retain(|held| !Arc::ptr_eq(held, mutex));
    }

    pub(crate) fn acquired_mutexes(&self) -> Vec<Arc<MutexCore>> {
        self.acquired.lock().clone()
    }

    /// Number of mutexes currently held
    pub fn held_mutexes(&self) -> usize {
        self.acquired.lock().len()
    }

    // ------------------------------------------------------------------------
    // Stacks
    // ------------------------------------------------------------------------

    pub(crate) fn take_kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack.lock().take()
    }

    pub(crate) fn set_user_stack(&self, stack: UserStack) {
        *self.user_stack.lock() = Some(stack);
    }

    pub(crate) fn take_user_stack(&self) -> Option<UserStack> {
        self.user_stack.lock().take()
    }

    pub fn user_stack(&self) -> Option<UserStack> {
        *self.user_stack.lock()
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    pub fn ticks(&self) -> ThreadTicks {
        ThreadTicks {
            completed: self.ticks.completed.load(Ordering::Relaxed),
            early: self.ticks.early.load(Ordering::Relaxed),
            uninterrupted: self.ticks.uninterrupted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_completed_tick(&self) {
        self.ticks.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_early_tick(&self) {
        self.ticks.early.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_uninterrupted_tick(&self) {
        self.ticks.uninterrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            priority: self.priority(),
            real_priority: self.real_priority(),
            cpu: self.cpu_index(),
            references: self.references(),
            ticks: self.ticks(),
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("real_priority", &self.real_priority())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A counted reference to a thread
///
/// Cloning takes a reference; dropping closes it. The last close of an exited
/// thread destroys it.
pub struct ThreadHandle {
    thread: Arc<Thread>,
}

impl ThreadHandle {
    /// Wrap a thread whose reference has already been taken
    pub(crate) fn adopt(thread: Arc<Thread>) -> Self {
        Self { thread }
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Block until the thread exits, returning its exit status
    pub fn wait_for_termination(&self) -> ExitStatus {
        self.thread.termination.wait();
        match self.thread.exit_status() {
            Some(status) => status,
            None => panic!("{} signalled termination without a status", self.thread.id),
        }
    }

    /// Ask the thread to exit the next time it yields or blocks
    pub fn terminate(&self) {
        self.thread.request_termination();
    }
}

impl Deref for ThreadHandle {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.thread
    }
}

impl Clone for ThreadHandle {
    fn clone(&self) -> Self {
        self.thread.reference();
        Self {
            thread: self.thread.clone(),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        match self.thread.kernel() {
            Some(kernel) => kernel.dereference(&self.thread),
            None => {
                self.thread.release_reference();
            }
        }
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ThreadHandle").field(&self.thread).finish()
    }
}
