//! Owning execution contexts
//!
//! Every thread belongs to an execution context (a process). The scheduler does
//! not manage processes; it only calls back into the owner when one of its
//! threads is created, terminates or is destroyed, when the CPU moves into the
//! owner's address space, and when a user-mode thread needs a user stack.
//!
//! Two contexts ship with the crate:
//! - [`SystemProcess`]: the kernel itself, kernel space only
//! - [`UserProcess`]: a user-space context that hands out simulated user stacks

use super::thread::{Thread, ThreadId};
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// A user-mode stack region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStack {
    /// Owner-specific handle
    pub slot: usize,
    /// Lowest address of the region
    pub base: u64,
    pub size: usize,
}

/// Hooks the scheduler needs from a thread's owner
pub trait ExecutionContext: Send + Sync {
    fn pid(&self) -> Pid;

    fn name(&self) -> &str;

    /// Kernel-space contexts never get user stacks
    fn is_kernel_space(&self) -> bool;

    /// A thread was created in this context
    fn insert_thread(&self, thread: &Thread);

    /// A thread of this context was destroyed
    fn remove_thread(&self, thread: &Thread);

    /// A thread of this context exited (it is not destroyed yet)
    fn notify_thread_termination(&self, thread: &Thread);

    /// The CPU is about to run a thread of this context after one of another
    fn switch_address_space(&self) {}

    fn allocate_user_stack(&self, size: usize) -> Option<UserStack> {
        let _ = size;
        None
    }

    fn free_user_stack(&self, stack: UserStack) {
        let _ = stack;
    }
}

/// Thread bookkeeping shared by the built-in contexts
#[derive(Debug, Default)]
struct Members {
    threads: spin::Mutex<Vec<ThreadId>>,
    terminated: AtomicU64,
    address_space_switches: AtomicU64,
}

impl Members {
    fn insert(&self, id: ThreadId) {
        self.threads.lock().push(id);
    }

    fn remove(&self, id: ThreadId) {
        self.threads.lock().retain(|member| *member != id);
    }

    fn ids(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }
}

// ============================================================================
// System process
// ============================================================================

/// The kernel's own execution context
#[derive(Debug, Default)]
pub struct SystemProcess {
    members: Members,
}

impl SystemProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the live (not yet destroyed) threads
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.members.ids()
    }

    pub fn terminated_threads(&self) -> u64 {
        self.members.terminated.load(Ordering::Relaxed)
    }
}

impl ExecutionContext for SystemProcess {
    fn pid(&self) -> Pid {
        Pid(0)
    }

    fn name(&self) -> &str {
        "system"
    }

    fn is_kernel_space(&self) -> bool {
        true
    }

    fn insert_thread(&self, thread: &Thread) {
        self.members.insert(thread.id());
    }

    fn remove_thread(&self, thread: &Thread) {
        self.members.remove(thread.id());
    }

    fn notify_thread_termination(&self, _thread: &Thread) {
        self.members.terminated.fetch_add(1, Ordering::Relaxed);
    }

    fn switch_address_space(&self) {
        self.members
            .address_space_switches
            .fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// User process
// ============================================================================

/// Base of the simulated user stack area
const USER_STACK_AREA: u64 = 0x0000_7000_0000_0000;

/// A user-space execution context
///
/// User stacks are carved out of a simulated region; `stack_limit` caps how
/// many may be live at once.
#[derive(Debug)]
pub struct UserProcess {
    pid: Pid,
    name: String,
    members: Members,
    stacks: spin::Mutex<Slab<usize>>,
    stack_limit: Option<usize>,
}

impl UserProcess {
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            members: Members::default(),
            stacks: spin::Mutex::new(Slab::new()),
            stack_limit: None,
        }
    }

    /// Allow at most `limit` live user stacks
    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = Some(limit);
        self
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.members.ids()
    }

    pub fn terminated_threads(&self) -> u64 {
        self.members.terminated.load(Ordering::Relaxed)
    }

    /// Number of times the CPU entered this address space
    pub fn address_space_switches(&self) -> u64 {
        self.members.address_space_switches.load(Ordering::Relaxed)
    }

    pub fn live_stacks(&self) -> usize {
        self.stacks.lock().len()
    }
}

impl ExecutionContext for UserProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_kernel_space(&self) -> bool {
        false
    }

    fn insert_thread(&self, thread: &Thread) {
        self.members.insert(thread.id());
    }

    fn remove_thread(&self, thread: &Thread) {
        self.members.remove(thread.id());
    }

    fn notify_thread_termination(&self, _thread: &Thread) {
        self.members.terminated.fetch_add(1, Ordering::Relaxed);
    }

    fn switch_address_space(&self) {
        self.members
            .address_space_switches
            .fetch_add(1, Ordering::Relaxed);
    }

    fn allocate_user_stack(&self, size: usize) -> Option<UserStack> {
        let mut stacks = self.stacks.lock();
        if self.stack_limit.is_some_and(|limit| stacks.len() >= limit) {
            return None;
        }
        let slot = stacks.insert(size);
        Some(UserStack {
            slot,
            base: USER_STACK_AREA + (slot as u64) * (size as u64),
            size,
        })
    }

    fn free_user_stack(&self, stack: UserStack) {
        let mut stacks = self.stacks.lock();
        if stacks.contains(stack.slot) {
            stacks.remove(stack.slot);
        }
    }
}
