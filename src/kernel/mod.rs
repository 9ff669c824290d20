//! The kernel - threads, scheduling and synchronization
//!
//! A small preemptive kernel core:
//! - Threads with fixed priorities, run highest-priority-first
//! - A mutex that lends its waiters' priority to its holder
//! - Timers and wait/notify events that threads block on
//!
//! The kernel runs on host threads. Each kernel thread is backed by one host
//! thread, and only the thread a logical CPU has selected is allowed to run;
//! everything else is parked. The host thread that boots the kernel becomes
//! the main thread of CPU 0.
//!
//! ```no_run
//! use priosched::kernel::{ExitStatus, Kernel, KernelConfig};
//!
//! let kernel = Kernel::boot(KernelConfig::default()).unwrap();
//! let worker = kernel
//!     .create_thread("worker", 20, |_kernel| ExitStatus::Code(7))
//!     .unwrap();
//! assert_eq!(worker.wait_for_termination(), ExitStatus::Code(7));
//! kernel.shutdown();
//! ```

pub mod clock;
pub mod config;
pub mod cpu;
pub mod error;
pub mod event;
pub mod mutex;
pub mod process;
mod queue;
pub mod scheduler;
pub mod spinlock;
pub mod stack;
mod switch;
pub mod thread;
pub mod timer;


pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::KernelConfig;
pub use cpu::{CpuStats, IntrState};
pub use error::{KernelError, KernelResult};
pub use event::{Event, EventKind};
pub use mutex::{Mutex, MutexGuard};
pub use process::{ExecutionContext, Pid, SystemProcess, UserProcess, UserStack};
pub use thread::{ExitStatus, Priority, Thread, ThreadHandle, ThreadId, ThreadInfo, ThreadState};
pub use timer::{Timer, TimerKind};

use cpu::Cpu;
use log::info;
use queue::ThreadQueue;
use spinlock::SpinLock;
use stack::StackPool;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread as host;
use timer::TimerRegistry;

/// State shared by every handle to one kernel
pub(crate) struct KernelShared {
    pub config: KernelConfig,
    pub clock: Arc<dyn Clock>,
    pub cpus: Vec<Cpu>,
    /// Every live thread, ordered by priority at creation
    pub all_threads: SpinLock<ThreadQueue>,
    pub ready: SpinLock<ThreadQueue>,
    pub next_tid: AtomicU64,
    pub timers: TimerRegistry,
    pub stacks: StackPool,
    pub system: Arc<SystemProcess>,
    pub shutdown: AtomicBool,
}

/// Handle to a running kernel
///
/// Cheap to clone; every clone refers to the same kernel.
#[derive(Clone)]
pub struct Kernel {
    shared: Arc<KernelShared>,
}

impl Kernel {
    /// Boot with the host's monotonic clock
    pub fn boot(config: KernelConfig) -> KernelResult<Kernel> {
        Self::boot_with(config, Arc::new(MonotonicClock::new()))
    }

    /// Boot a kernel and make the calling host thread CPU 0's main thread
    pub fn boot_with(config: KernelConfig, clock: Arc<dyn Clock>) -> KernelResult<Kernel> {
        config.validate()?;
        if cpu::current_cpu_index().is_some() {
            return Err(KernelError::AlreadyBound);
        }

        let shared = Arc::new(KernelShared {
            cpus: (0..config.cpu_count).map(Cpu::new).collect(),
            stacks: StackPool::new(config.kernel_stack_budget),
            config,
            clock,
            all_threads: SpinLock::new(ThreadQueue::new()),
            ready: SpinLock::new(ThreadQueue::new()),
            next_tid: AtomicU64::new(0),
            timers: TimerRegistry::new(),
            system: Arc::new(SystemProcess::new()),
            shutdown: AtomicBool::new(false),
        });
        let kernel = Kernel { shared };

        kernel.init_main_thread(0)?;
        let booted = kernel
            .init_idle_thread()
            .and_then(|()| kernel.start_secondary_cpus());
        if let Err(err) = booted {
            kernel.shutdown();
            return Err(err);
        }

        info!(
            "kernel booted on {} cpu(s), time slice {} tick(s)",
            kernel.cpu_count(),
            kernel.shared.config.time_slice_ticks
        );
        Ok(kernel)
    }

    pub(crate) fn from_shared(shared: Arc<KernelShared>) -> Self {
        Self { shared }
    }

    /// The kernel the calling kernel thread belongs to.
    ///
    /// Panics when called from a host thread that runs no kernel thread.
    pub fn current() -> Kernel {
        match Self::try_current() {
            Some(kernel) => kernel,
            None => panic!("not running on a kernel thread"),
        }
    }

    pub fn try_current() -> Option<Kernel> {
        cpu::with_binding(|binding| binding.kernel.clone())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    pub fn now_micros(&self) -> u64 {
        self.shared.clock.now_micros()
    }

    pub fn cpu_count(&self) -> usize {
        self.shared.cpus.len()
    }

    pub(crate) fn cpu(&self, index: usize) -> &Cpu {
        &self.shared.cpus[index]
    }

    pub(crate) fn current_cpu(&self) -> &Cpu {
        self.cpu(self.current_thread().cpu_index())
    }

    pub fn cpu_stats(&self) -> Vec<CpuStats> {
        self.shared.cpus.iter().map(Cpu::stats).collect()
    }

    /// The kernel's own execution context
    pub fn system_process(&self) -> &Arc<SystemProcess> {
        &self.shared.system
    }

    /// Kernel stacks currently handed out
    pub fn kernel_stacks_in_use(&self) -> usize {
        self.shared.stacks.in_use()
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Create a timer; it does nothing until started
    pub fn create_timer(&self, kind: TimerKind, time_us: u64) -> KernelResult<Timer> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }
        Timer::create(&self.shared, kind, time_us)
    }

    /// Signal every started timer whose trigger time has passed
    pub fn check_timers(&self) -> usize {
        self.shared.timers.check_all(self.now_micros())
    }

    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.shared.timers.next_deadline()
    }

    pub fn timer_count(&self) -> usize {
        self.shared.timers.len()
    }

    // ========================================================================
    // Boot and shutdown
    // ========================================================================

    fn init_main_thread(&self, index: usize) -> KernelResult<()> {
        let system: Arc<dyn ExecutionContext> = self.shared.system.clone();
        let name = format!("main-{index:02x}");
        let thread = self.init_thread(&name, Priority::DEFAULT, system.clone(), false)?;
        thread.set_cpu(index);
        thread.set_state(ThreadState::Running);
        if let Err(err) = cpu::bind(self.clone(), thread.clone()) {
            self.dereference(&thread);
            return Err(err);
        }
        self.cpu(index).set_current(thread.clone());
        system.insert_thread(&thread);
        Ok(())
    }

    fn init_idle_thread(&self) -> KernelResult<()> {
        let index = self.current_thread().cpu_index();
        let started = Arc::new(Event::new(EventKind::Synchronization, false));
        let signal = started.clone();
        let idle = self.spawn_idle_thread(&format!("idle-{index:02x}"), move |kernel| {
            kernel.idle_loop(&signal)
        })?;
        drop(idle);

        cpu::intr_enable();
        started.wait();
        Ok(())
    }

    fn start_secondary_cpus(&self) -> KernelResult<()> {
        let (done_tx, done_rx) = mpsc::channel();
        for index in 1..self.cpu_count() {
            let kernel = self.clone();
            let done_tx = done_tx.clone();
            host::Builder::new()
                .name(format!("main-{index:02x}"))
                .stack_size(self.shared.config.stack_size)
                .spawn(move || kernel.run_secondary_cpu(index, done_tx))
                .map_err(|_| KernelError::AllocationFailed("secondary cpu thread"))?;
        }
        drop(done_tx);

        for _ in 1..self.cpu_count() {
            match done_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(KernelError::AllocationFailed("secondary cpu")),
            }
        }
        Ok(())
    }

    /// Body of a secondary CPU's main thread: bring the CPU up, then exit
    fn run_secondary_cpu(self, index: usize, done: mpsc::Sender<KernelResult<()>>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let result = self
                .init_main_thread(index)
                .and_then(|()| self.init_idle_thread());
            let started = result.is_ok();
            let _ = done.send(result);
            if started {
                self.retire_current(ExitStatus::SUCCESS);
            }
        }));
        if outcome.is_err() {
            let _ = done.send(Err(KernelError::ShutDown));
        }
        cpu::unbind();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the kernel.
    ///
    /// Parked and halted threads wake up and leave; blocking calls made after
    /// this point never return. The calling host thread is released from the
    /// kernel if it was running one of its threads.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("kernel shutting down");

        for cpu in &self.shared.cpus {
            cpu.wake();
        }
        let threads: Vec<Arc<Thread>> = self.shared.all_threads.lock().iter().cloned().collect();
        for thread in threads {
            thread.run_token.interrupt();
        }

        let ours = cpu::with_binding(|binding| Arc::ptr_eq(&binding.kernel.shared, &self.shared));
        if ours == Some(true) {
            cpu::unbind();
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("cpus", &self.cpu_count())
            .field("threads", &self.thread_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
