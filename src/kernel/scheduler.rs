//! Scheduler
//!
//! Thread creation and destruction, and every state transition between them.
//!
//! Design:
//! - One global ready list, ordered by effective priority (FIFO among
//!   equals). A CPU always runs the head of the list, or its idle thread when
//!   the list is empty.
//! - A thread blocks by taking its own block lock, making itself findable
//!   (a wait list), releasing the resource lock and calling [`Kernel::block`].
//!   The block lock stays held until the switch away has completed, so a
//!   concurrent unblock cannot resume a thread that is still running.
//! - The ready-list lock is held across every switch: the outgoing thread
//!   takes it and the incoming thread releases it in
//!   [`Kernel::cleanup_post_schedule`].
//! - Unblocking asks every CPU to reschedule; a CPU honours the request at its
//!   next interrupt return.
//! - A thread that exits is reclaimed by whichever thread runs next on its
//!   CPU, once its last reference is gone.

use super::cpu::{self, HaltOutcome, IntrState};
use super::error::{KernelError, KernelResult};
use super::event::Event;
use super::mutex;
use super::process::ExecutionContext;
use super::queue::ThreadQueue;
use super::spinlock::SpinLockGuard;
use super::switch::{self, Unwind};
use super::thread::{
    ExitStatus, Priority, TID_INCREMENT, Thread, ThreadHandle, ThreadId, ThreadInfo, ThreadParams,
    ThreadState,
};
use super::Kernel;
use log::{debug, error, trace, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread as host;
use std::time::Duration;

/// Entry point of a kernel thread
type Entry = Box<dyn FnOnce(&Kernel) -> ExitStatus + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Regular,
    /// Runs only when nothing else is ready on its CPU
    Idle,
}

impl Kernel {
    // ========================================================================
    // Creation and destruction
    // ========================================================================

    /// Create a kernel-space thread and make it ready.
    ///
    /// The returned handle holds a reference; dropping it closes the handle
    /// without affecting the running thread.
    pub fn create_thread<F>(&self, name: &str, priority: u8, entry: F) -> KernelResult<ThreadHandle>
    where
        F: FnOnce(&Kernel) -> ExitStatus + Send + 'static,
    {
        let owner: Arc<dyn ExecutionContext> = self.shared.system.clone();
        self.create_thread_in(name, priority, owner, entry)
    }

    /// Create a thread owned by `owner`
    pub fn create_thread_in<F>(
        &self,
        name: &str,
        priority: u8,
        owner: Arc<dyn ExecutionContext>,
        entry: F,
    ) -> KernelResult<ThreadHandle>
    where
        F: FnOnce(&Kernel) -> ExitStatus + Send + 'static,
    {
        if name.is_empty() {
            return Err(KernelError::InvalidName);
        }
        let priority = Priority::new(priority)?;
        self.spawn_thread(name, priority, owner, ThreadRole::Regular, Box::new(entry))
    }

    pub(crate) fn spawn_idle_thread<F>(&self, name: &str, entry: F) -> KernelResult<ThreadHandle>
    where
        F: FnOnce(&Kernel) -> ExitStatus + Send + 'static,
    {
        let owner: Arc<dyn ExecutionContext> = self.shared.system.clone();
        self.spawn_thread(name, Priority::DEFAULT, owner, ThreadRole::Idle, Box::new(entry))
    }

    fn spawn_thread(
        &self,
        name: &str,
        priority: Priority,
        owner: Arc<dyn ExecutionContext>,
        role: ThreadRole,
        entry: Entry,
    ) -> KernelResult<ThreadHandle> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }

        let thread = self.init_thread(name, priority, owner.clone(), true)?;
        owner.insert_thread(&thread);
        thread.reference();
        let handle = ThreadHandle::adopt(thread.clone());

        if let Err(err) = self.prepare_thread(&thread, entry) {
            warn!("creating thread {name} failed: {err}");
            drop(handle);
            self.dereference(&thread);
            return Err(err);
        }

        debug!(
            "{} ({}) created with priority {}",
            thread.id(),
            thread.name(),
            thread.priority()
        );
        match role {
            ThreadRole::Regular => {
                self.unblock(&thread);
            }
            ThreadRole::Idle => {
                let cpu = self.current_cpu();
                thread.set_cpu(cpu.index());
                thread.set_state(ThreadState::Ready);
                cpu.set_idle_thread(thread.clone());
            }
        }
        Ok(handle)
    }

    /// Allocate a control block and publish it in the all-threads list
    pub(crate) fn init_thread(
        &self,
        name: &str,
        priority: Priority,
        owner: Arc<dyn ExecutionContext>,
        with_kernel_stack: bool,
    ) -> KernelResult<Arc<Thread>> {
        let kernel_stack = if with_kernel_stack {
            let stack = self
                .shared
                .stacks
                .allocate(self.shared.config.stack_size)
                .ok_or(KernelError::AllocationFailed("kernel stack"))?;
            Some(stack)
        } else {
            None
        };

        let thread = Arc::new(Thread::new(ThreadParams {
            id: self.next_thread_id(),
            name: name.to_string(),
            priority,
            owner,
            kernel_stack,
            kernel: Arc::downgrade(&self.shared),
        }));
        self.shared.all_threads.lock().insert_ordered(thread.clone());
        Ok(thread)
    }

    fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.shared.next_tid.fetch_add(TID_INCREMENT, Ordering::SeqCst))
    }

    /// User stack and host thread; the host thread waits for its first switch
    fn prepare_thread(&self, thread: &Arc<Thread>, entry: Entry) -> KernelResult<()> {
        let owner = thread.owner();
        if !owner.is_kernel_space() {
            let stack = owner
                .allocate_user_stack(self.shared.config.user_stack_size)
                .ok_or(KernelError::AllocationFailed("user stack"))?;
            thread.set_user_stack(stack);
        }

        let kernel = self.clone();
        let runner = thread.clone();
        host::Builder::new()
            .name(thread.name().to_string())
            .stack_size(self.shared.config.stack_size)
            .spawn(move || thread_main(kernel, runner, entry))
            .map(drop)
            .map_err(|_| KernelError::AllocationFailed("host thread"))
    }

    /// Drop one reference; the last one destroys the thread
    pub(crate) fn dereference(&self, thread: &Arc<Thread>) {
        if thread.release_reference() {
            self.destroy(thread);
        }
    }

    fn destroy(&self, thread: &Arc<Thread>) {
        self.shared.all_threads.lock().remove(thread);
        if let Some(stack) = thread.take_user_stack() {
            thread.owner().free_user_stack(stack);
        }
        thread.owner().remove_thread(thread);
        if let Some(stack) = thread.take_kernel_stack() {
            self.shared.stacks.free(stack);
        }
        debug!("{} ({}) destroyed", thread.id(), thread.name());
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// The kernel thread running on the calling host thread
    pub fn current_thread(&self) -> Arc<Thread> {
        match cpu::with_binding(|binding| binding.thread.clone()) {
            Some(thread) => thread,
            None => panic!("not running on a kernel thread"),
        }
    }

    /// Take the current thread's block lock ahead of [`block`](Self::block).
    ///
    /// Leaves interrupts disabled.
    pub fn take_block_lock(&self) {
        self.current_thread().block_lock.lock().hand_off();
    }

    /// Give up the CPU until another thread unblocks the caller.
    ///
    /// The caller must have interrupts disabled and hold its block lock.
    pub fn block(&self) {
        let current = self.current_thread();
        assert_eq!(
            cpu::intr_state(),
            IntrState::Disabled,
            "{} blocked with interrupts enabled",
            current.id()
        );
        assert!(
            current.block_lock.is_owned_by_current_cpu(),
            "{} blocked without holding its block lock",
            current.id()
        );
        if current.is_terminate_pending() {
            self.forced_exit();
        }

        current.count_early_tick();
        current.set_state(ThreadState::Blocked);
        let ready = self.shared.ready.lock();
        self.schedule(ready);
    }

    /// Make a blocked thread ready and ask every CPU to reschedule.
    ///
    /// Returns false, and does nothing, if the thread is already exiting.
    pub fn unblock(&self, thread: &Arc<Thread>) -> bool {
        let block_lock = thread.block_lock.lock();
        match thread.state() {
            ThreadState::Blocked => {}
            ThreadState::Dying => {
                debug!("{} is exiting, unblock ignored", thread.id());
                return false;
            }
            other => panic!("unblocking {} in state {other:?}", thread.id()),
        }
        {
            let mut ready = self.shared.ready.lock();
            thread.set_state(ThreadState::Ready);
            ready.insert_ordered(thread.clone());
        }
        drop(block_lock);
        self.broadcast_reschedule();
        true
    }

    /// Put the current thread back in the ready list and reschedule
    pub fn yield_now(&self) {
        let current = self.current_thread();
        let saved = cpu::intr_disable();
        let forced = self.current_cpu().take_yield_request();
        if current.is_terminate_pending() {
            self.forced_exit();
        }

        let mut ready = self.shared.ready.lock();
        if !self.current_cpu().is_idle_thread(&current) {
            ready.insert_ordered(current.clone());
        }
        if !forced {
            current.count_early_tick();
        }
        current.set_state(ThreadState::Ready);
        self.schedule(ready);

        cpu::intr_set_state(saved);
    }

    /// Exit the current thread. Never returns.
    pub fn exit_thread(&self, status: ExitStatus) -> ! {
        self.retire_current(status);
        leave_kernel(Unwind::Exited)
    }

    fn forced_exit(&self) -> ! {
        let current = self.current_thread();
        current.mark_force_terminated();
        self.exit_thread(ExitStatus::Terminated)
    }

    /// Mark the current thread dying, publish its status and switch away for
    /// good. Returns on the (now retired) host thread.
    pub(crate) fn retire_current(&self, status: ExitStatus) {
        let current = self.current_thread();
        cpu::intr_disable();
        // Dying must be visible before the block lock is free, so an unblock
        // racing with this exit backs off instead of waking a dead thread
        current.set_state(ThreadState::Dying);
        if current.block_lock.is_owned_by_current_cpu() {
            // SAFETY: taken by this thread via take_block_lock and never released
            unsafe { current.block_lock.release_handed_off() };
        }
        mutex::withdraw_waiter(self, &current);

        current.set_exit_status(status);
        debug!("{} ({}) exited with {status:?}", current.id(), current.name());
        current.termination_event().signal();
        current.owner().notify_thread_termination(&current);

        let ready = self.shared.ready.lock();
        self.schedule(ready);
    }

    /// Change the current thread's real priority.
    ///
    /// The effective priority is recomputed; if a ready thread now outranks
    /// the caller, the caller yields.
    pub fn set_priority(&self, priority: u8) -> KernelResult<()> {
        let priority = Priority::new(priority)?;
        let current = self.current_thread();
        current.set_real_priority(priority);
        mutex::recompute_priority(&current);

        let outranked = {
            let ready = self.shared.ready.lock();
            ready.iter().any(|thread| thread.priority() > current.priority())
        };
        if outranked {
            self.yield_now();
        }
        Ok(())
    }

    /// Re-sort a ready thread whose priority changed
    pub(crate) fn reposition_ready(&self, thread: &Arc<Thread>) {
        let mut ready = self.shared.ready.lock();
        if thread.state() == ThreadState::Ready && ready.remove(thread) {
            ready.insert_ordered(thread.clone());
        }
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Clock tick accounting for the current CPU.
    ///
    /// Requests a reschedule once the running thread has used its slice.
    pub fn thread_tick(&self) {
        let current = self.current_thread();
        let cpu = self.current_cpu();
        let used = cpu.account_tick(cpu.is_idle_thread(&current));
        current.count_completed_tick();
        if used >= self.shared.config.time_slice_ticks {
            trace!("cpu {}: {} used its time slice", cpu.index(), current.id());
            cpu.request_local_yield();
        }
    }

    /// Deliver a clock interrupt to the current CPU.
    ///
    /// Runs the thread tick and the timer tick, then the interrupt-return
    /// check. Returns false if interrupts were masked and nothing happened.
    pub fn clock_interrupt(&self) -> bool {
        if cpu::intr_state() == IntrState::Disabled {
            return false;
        }
        let saved = cpu::intr_disable();
        self.thread_tick();
        self.check_timers();
        cpu::intr_set_state(saved);
        self.interrupt_return();
        true
    }

    /// Yield if a reschedule was requested for this CPU
    pub fn interrupt_return(&self) {
        if self.current_cpu().yield_requested() {
            self.yield_now();
        }
    }

    pub(crate) fn broadcast_reschedule(&self) {
        for cpu in &self.shared.cpus {
            cpu.request_yield();
        }
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Pick the next thread and switch to it.
    ///
    /// Consumes the ready-list guard; the lock stays held across the switch.
    fn schedule(&self, mut ready: SpinLockGuard<'_, ThreadQueue>) {
        assert_eq!(
            cpu::intr_state(),
            IntrState::Disabled,
            "schedule called with interrupts enabled"
        );
        let current = self.current_thread();
        let cpu = self.current_cpu();
        cpu.set_previous(Some(current.clone()));

        let next = match ready.pop_front().or_else(|| cpu.idle_thread()) {
            Some(next) => next,
            None => panic!("cpu {} has no thread to run", cpu.index()),
        };
        next.set_state(ThreadState::Running);
        ready.hand_off();

        if Arc::ptr_eq(&next, &current) {
            current.count_uninterrupted_tick();
            self.cleanup_post_schedule();
            return;
        }

        if !Arc::ptr_eq(current.owner(), next.owner()) {
            next.owner().switch_address_space();
        }
        next.set_cpu(cpu.index());
        cpu.set_current(next.clone());
        trace!("cpu {}: switch {} -> {}", cpu.index(), current.id(), next.id());

        let retiring = current.state() == ThreadState::Dying;
        next.run_token.resume();
        if retiring {
            return;
        }
        if current.run_token.park(&self.shared.shutdown).is_err() {
            leave_kernel(Unwind::Shutdown);
        }
        self.cleanup_post_schedule();
    }

    /// First thing a thread does after being switched to
    pub(crate) fn cleanup_post_schedule(&self) {
        assert_eq!(
            cpu::intr_state(),
            IntrState::Disabled,
            "post-switch cleanup with interrupts enabled"
        );
        let cpu = self.current_cpu();
        cpu.reset_running_ticks();
        let previous = cpu.previous();

        // SAFETY: the thread that switched to us handed the ready lock over
        unsafe { self.shared.ready.release_handed_off() };

        let Some(previous) = previous else {
            return;
        };
        if previous.block_lock.is_owned_by_current_cpu() {
            assert!(
                previous.state() == ThreadState::Blocked || cpu.is_idle_thread(&previous),
                "{} switched out holding its block lock in state {:?}",
                previous.id(),
                previous.state()
            );
            // SAFETY: taken by `previous` before blocking on this cpu
            unsafe { previous.block_lock.release_handed_off() };
        } else if previous.state() == ThreadState::Dying {
            cpu.set_previous(None);
            self.dereference(&previous);
        }
    }

    pub(crate) fn idle_loop(&self, started: &Event) -> ExitStatus {
        started.signal();
        let period = Duration::from_micros(self.shared.config.tick_period_us);
        loop {
            cpu::intr_disable();
            self.take_block_lock();
            self.block();

            cpu::intr_enable();
            match self.current_cpu().halt(period, &self.shared.shutdown) {
                HaltOutcome::Shutdown => leave_kernel(Unwind::Shutdown),
                HaltOutcome::ClockTick => {
                    self.clock_interrupt();
                }
                HaltOutcome::Interrupted => self.interrupt_return(),
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Call `f` for every live thread, in all-threads order.
    ///
    /// Runs on a snapshot, so `f` may use the kernel freely.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Thread)) {
        let threads: Vec<Arc<Thread>> = self.shared.all_threads.lock().iter().cloned().collect();
        for thread in &threads {
            f(thread);
        }
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        let mut infos = Vec::new();
        self.for_each_thread(|thread| infos.push(thread.info()));
        infos
    }

    pub fn thread_count(&self) -> usize {
        self.shared.all_threads.lock().len()
    }

    /// Ready list contents, head first
    pub fn ready_threads(&self) -> Vec<ThreadInfo> {
        self.shared.ready.lock().iter().map(|thread| thread.info()).collect()
    }

    /// All-threads list as JSON
    pub fn dump_threads(&self) -> KernelResult<String> {
        Ok(serde_json::to_string_pretty(&self.threads())?)
    }
}

/// Leave kernel code for good on this host thread
fn leave_kernel(reason: Unwind) -> ! {
    drop(cpu::unbind());
    switch::unwind(reason)
}

/// Host thread body of every spawned kernel thread
fn thread_main(kernel: Kernel, thread: Arc<Thread>, entry: Entry) {
    if cpu::bind(kernel.clone(), thread.clone()).is_err() {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if thread.run_token.park(&kernel.shared.shutdown).is_err() {
            return None;
        }
        kernel.cleanup_post_schedule();
        cpu::intr_enable();
        Some(entry(&kernel))
    }));

    let bound = cpu::current_cpu_index().is_some();
    match outcome {
        Ok(Some(status)) if bound && !kernel.is_shut_down() => kernel.retire_current(status),
        Ok(_) => {}
        Err(payload) if payload.downcast_ref::<Unwind>().is_some() => {}
        Err(payload) => {
            error!(
                "{} ({}) panicked: {}",
                thread.id(),
                thread.name(),
                panic_message(payload.as_ref())
            );
            if bound && !kernel.is_shut_down() {
                kernel.retire_current(ExitStatus::Panicked);
            }
        }
    }
    cpu::unbind();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
