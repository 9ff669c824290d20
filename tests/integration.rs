//! Integration tests for the priosched kernel
//!
//! Every test boots its own kernel on the test's host thread, which becomes
//! CPU 0's main thread (priority 16). Threads are driven by priorities and
//! events, so the interleavings below are deterministic on a single CPU.

use priosched::kernel::cpu;
use priosched::kernel::{
    Event, EventKind, ExecutionContext, ExitStatus, Kernel, KernelConfig, KernelError,
    ManualClock, Mutex, Pid, ThreadState, TimerKind, UserProcess,
};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A booted kernel that shuts down when the test ends
struct TestKernel {
    kernel: Kernel,
    clock: Arc<ManualClock>,
}

impl Deref for TestKernel {
    type Target = Kernel;

    fn deref(&self) -> &Kernel {
        &self.kernel
    }
}

impl Drop for TestKernel {
    fn drop(&mut self) {
        self.kernel.shutdown();
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boot a single-CPU kernel on a manual clock
fn init_test() -> TestKernel {
    init_test_with(KernelConfig::default().tick_period_us(500))
}

fn init_test_with(config: KernelConfig) -> TestKernel {
    init_logging();
    let clock = Arc::new(ManualClock::new(0));
    let kernel = Kernel::boot_with(config, clock.clone()).unwrap();
    TestKernel { kernel, clock }
}

fn flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn notification() -> Arc<Event> {
    Arc::new(Event::new(EventKind::Notification, false))
}

// ============================================================================
// Boot
// ============================================================================

#[test]
fn test_boot_creates_main_and_idle() {
    let kernel = init_test();
    let names: Vec<String> = kernel.threads().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"main-00".to_string()));
    assert!(names.contains(&"idle-00".to_string()));
    assert_eq!(kernel.thread_count(), 2);

    let main = kernel.current_thread();
    assert_eq!(main.state(), ThreadState::Running);
    assert_eq!(main.priority(), 16);
    assert_eq!(cpu::intr_state(), cpu::IntrState::Enabled);
}

#[test]
fn test_boot_twice_on_one_host_thread_fails() {
    let kernel = init_test();
    let err = Kernel::boot(KernelConfig::default()).unwrap_err();
    assert_eq!(err, KernelError::AlreadyBound);
    assert!(!kernel.is_shut_down());
}

#[test]
fn test_boot_rejects_invalid_config() {
    init_logging();
    let err = Kernel::boot(KernelConfig::default().cpu_count(0)).unwrap_err();
    assert!(matches!(err, KernelError::InvalidConfig(_)));
    assert!(Kernel::try_current().is_none());
}

#[test]
fn test_shutdown_releases_host_thread() {
    let kernel = init_test();
    kernel.shutdown();
    assert!(kernel.is_shut_down());
    assert!(Kernel::try_current().is_none());
    assert_eq!(
        kernel.create_thread("late", 1, |_| ExitStatus::SUCCESS).unwrap_err(),
        KernelError::ShutDown
    );
    assert_eq!(
        kernel.create_timer(TimerKind::Absolute, 10).unwrap_err(),
        KernelError::ShutDown
    );
}

// ============================================================================
// Thread lifecycle
// ============================================================================

#[test]
fn test_thread_runs_and_reports_exit_code() {
    let kernel = init_test();
    let worker = kernel
        .create_thread("worker", 20, |_| ExitStatus::Code(7))
        .unwrap();
    assert_eq!(worker.wait_for_termination(), ExitStatus::Code(7));
    assert_eq!(worker.state(), ThreadState::Dying);
}

#[test]
fn test_explicit_exit() {
    let kernel = init_test();
    let mutex = Arc::new(Mutex::new(false));
    let held = mutex.clone();
    let worker = kernel
        .create_thread("exiter", 20, move |kernel| {
            let _guard = held.lock();
            kernel.exit_thread(ExitStatus::Code(42))
        })
        .unwrap();
    assert_eq!(worker.wait_for_termination(), ExitStatus::Code(42));
    // exiting does not run the guard's release
    assert_eq!(mutex.holder_id(), Some(worker.id()));
}

#[test]
fn test_create_thread_validation() {
    let kernel = init_test();
    let count = kernel.thread_count();

    let err = kernel.create_thread("", 1, |_| ExitStatus::SUCCESS).unwrap_err();
    assert_eq!(err, KernelError::InvalidName);

    let err = kernel.create_thread("hot", 32, |_| ExitStatus::SUCCESS).unwrap_err();
    assert_eq!(err, KernelError::InvalidPriority(32));

    assert_eq!(kernel.thread_count(), count);
}

#[test]
fn test_kernel_stack_budget_exhausted() {
    let stack = 128 * 1024;
    // one stack for the idle thread, nothing left for workers
    let kernel = init_test_with(
        KernelConfig::default()
            .stack_size(stack)
            .kernel_stack_budget(stack)
            .tick_period_us(500),
    );
    let count = kernel.thread_count();
    assert_eq!(kernel.kernel_stacks_in_use(), 1);

    let err = kernel
        .create_thread("starved", 1, |_| ExitStatus::SUCCESS)
        .unwrap_err();
    assert_eq!(err, KernelError::AllocationFailed("kernel stack"));
    assert_eq!(kernel.thread_count(), count);
    assert_eq!(kernel.kernel_stacks_in_use(), 1);
}

#[test]
fn test_forced_termination() {
    let kernel = init_test();
    let worker = kernel
        .create_thread("spinner", 16, |kernel| loop {
            kernel.yield_now();
        })
        .unwrap();
    worker.terminate();
    assert!(worker.is_terminate_pending());
    assert_eq!(worker.wait_for_termination(), ExitStatus::Terminated);
    assert!(worker.was_force_terminated());
}

#[test]
fn test_terminate_blocked_thread_takes_effect_on_next_block() {
    let kernel = init_test();
    let gate = notification();
    let rounds = Arc::new(AtomicUsize::new(0));

    let worker = {
        let gate = gate.clone();
        let rounds = rounds.clone();
        kernel
            .create_thread("sleeper", 20, move |_| loop {
                gate.wait();
                gate.clear();
                rounds.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    kernel.yield_now();
    assert_eq!(worker.state(), ThreadState::Blocked);
    worker.terminate();
    gate.signal();
    assert_eq!(worker.wait_for_termination(), ExitStatus::Terminated);
    assert_eq!(rounds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_thread_is_retired() {
    let kernel = init_test();
    let worker = kernel
        .create_thread("doomed", 20, |_| panic!("entry failed"))
        .unwrap();
    assert_eq!(worker.wait_for_termination(), ExitStatus::Panicked);

    // the kernel keeps scheduling afterwards
    let next = kernel
        .create_thread("survivor", 20, |_| ExitStatus::SUCCESS)
        .unwrap();
    assert!(next.wait_for_termination().is_success());
}

#[test]
fn test_handle_drop_destroys_exited_thread() {
    let kernel = init_test();
    let count = kernel.thread_count();
    let stacks = kernel.kernel_stacks_in_use();

    let worker = kernel
        .create_thread("short", 20, |_| ExitStatus::SUCCESS)
        .unwrap();
    assert_eq!(kernel.thread_count(), count + 1);
    assert_eq!(kernel.kernel_stacks_in_use(), stacks + 1);
    worker.wait_for_termination();

    drop(worker);
    assert_eq!(kernel.thread_count(), count);
    assert_eq!(kernel.kernel_stacks_in_use(), stacks);
}

#[test]
fn test_detached_thread_reclaimed_after_exit() {
    let kernel = init_test();
    let count = kernel.thread_count();
    let done = notification();

    let signal = done.clone();
    drop(
        kernel
            .create_thread("detached", 20, move |_| {
                signal.signal();
                ExitStatus::SUCCESS
            })
            .unwrap(),
    );
    done.wait();
    // reclaimed by the thread that ran after it
    assert_eq!(kernel.thread_count(), count);
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_higher_priority_runs_first() {
    let kernel = init_test();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let handles: Vec<_> = [3u8, 11, 7]
        .into_iter()
        .map(|priority| {
            let order = order.clone();
            kernel
                .create_thread(&format!("p{priority}"), priority, move |_| {
                    order.lock().unwrap().push(priority);
                    ExitStatus::SUCCESS
                })
                .unwrap()
        })
        .collect();

    kernel.set_priority(0).unwrap();
    for handle in &handles {
        handle.wait_for_termination();
    }
    assert_eq!(*order.lock().unwrap(), vec![11, 7, 3]);
}

#[test]
fn test_set_priority_yields_only_when_outranked() {
    let kernel = init_test();
    let ran = flag();

    let seen = ran.clone();
    let worker = kernel
        .create_thread("mid", 10, move |_| {
            seen.store(true, Ordering::SeqCst);
            ExitStatus::SUCCESS
        })
        .unwrap();

    kernel.set_priority(20).unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(kernel.current_thread().real_priority(), 20);

    kernel.set_priority(5).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    worker.wait_for_termination();

    assert_eq!(
        kernel.set_priority(40).unwrap_err(),
        KernelError::InvalidPriority(40)
    );
}

#[test]
fn test_clock_interrupt_round_robin() {
    let kernel = init_test();
    let ran = flag();

    let seen = ran.clone();
    let worker = kernel
        .create_thread("peer", 16, move |_| {
            seen.store(true, Ordering::SeqCst);
            ExitStatus::SUCCESS
        })
        .unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    assert!(kernel.clock_interrupt());
    assert!(ran.load(Ordering::SeqCst));
    worker.wait_for_termination();

    let main = kernel.current_thread();
    assert!(main.ticks().completed >= 1);
    assert!(kernel.cpu_stats()[0].kernel_ticks >= 1);
}

#[test]
fn test_clock_interrupt_masked() {
    let kernel = init_test();
    let saved = cpu::intr_disable();
    assert!(!kernel.clock_interrupt());
    cpu::intr_set_state(saved);
    assert_eq!(kernel.current_thread().ticks().completed, 0);
}

#[test]
fn test_time_slice_longer_than_one_tick() {
    let kernel = init_test_with(
        KernelConfig::default()
            .time_slice_ticks(3)
            .tick_period_us(500),
    );
    // drop the reschedule request left over from boot
    kernel.yield_now();

    let ran = flag();
    let seen = ran.clone();
    let worker = kernel
        .create_thread("peer", 16, move |_| {
            seen.store(true, Ordering::SeqCst);
            ExitStatus::SUCCESS
        })
        .unwrap();
    // creating the peer asked for a reschedule; consume it
    kernel.yield_now();
    assert!(ran.load(Ordering::SeqCst));
    worker.wait_for_termination();

    let before = kernel.current_thread().ticks().uninterrupted;
    kernel.clock_interrupt();
    kernel.clock_interrupt();
    assert_eq!(kernel.current_thread().ticks().uninterrupted, before);
    kernel.clock_interrupt();
    assert_eq!(kernel.current_thread().ticks().uninterrupted, before + 1);
}

// ============================================================================
// Mutexes and priority donation
// ============================================================================

#[test]
fn test_donation_and_handoff_order() {
    let kernel = init_test();
    let mutex = Arc::new(Mutex::new(false));
    let holding = notification();
    let go = notification();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let holder = {
        let (mutex, holding, go) = (mutex.clone(), holding.clone(), go.clone());
        kernel
            .create_thread("holder", 1, move |_| {
                mutex.acquire();
                holding.signal();
                go.wait();
                mutex.release();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    holding.wait();
    assert_eq!(mutex.holder_id(), Some(holder.id()));

    let contenders: Vec<_> = [3u8, 7]
        .into_iter()
        .map(|priority| {
            let (mutex, order) = (mutex.clone(), order.clone());
            kernel
                .create_thread(&format!("c{priority}"), priority, move |_| {
                    let _guard = mutex.lock();
                    order.lock().unwrap().push(priority);
                    ExitStatus::SUCCESS
                })
                .unwrap()
        })
        .collect();

    kernel.set_priority(0).unwrap();
    assert_eq!(mutex.waiter_count(), 2);
    assert_eq!(holder.priority(), 7);
    assert_eq!(holder.real_priority(), 1);

    go.signal();
    holder.wait_for_termination();
    for contender in &contenders {
        contender.wait_for_termination();
    }
    assert_eq!(*order.lock().unwrap(), vec![7, 3]);
    assert_eq!(holder.priority(), 1);
    assert!(!mutex.is_held());
}

#[test]
fn test_transitive_donation() {
    let kernel = init_test();
    let outer = Arc::new(Mutex::new(false));
    let inner = Arc::new(Mutex::new(false));
    let inner_held = notification();
    let outer_held = notification();
    let release_inner = notification();

    let t3_after = Arc::new(AtomicU8::new(0));
    let t2_with_inner = Arc::new(AtomicU8::new(0));
    let t2_after_inner = Arc::new(AtomicU8::new(0));
    let t2_after_outer = Arc::new(AtomicU8::new(0));

    let t3 = {
        let (inner, inner_held, release_inner) =
            (inner.clone(), inner_held.clone(), release_inner.clone());
        let t3_after = t3_after.clone();
        kernel
            .create_thread("t3", 5, move |kernel| {
                inner.acquire();
                inner_held.signal();
                release_inner.wait();
                inner.release();
                t3_after.store(kernel.current_thread().priority(), Ordering::SeqCst);
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    inner_held.wait();

    let t2 = {
        let (outer, inner, outer_held) = (outer.clone(), inner.clone(), outer_held.clone());
        let (with_inner, after_inner, after_outer) = (
            t2_with_inner.clone(),
            t2_after_inner.clone(),
            t2_after_outer.clone(),
        );
        kernel
            .create_thread("t2", 5, move |kernel| {
                outer.acquire();
                outer_held.signal();
                inner.acquire();
                let me = kernel.current_thread();
                with_inner.store(me.priority(), Ordering::SeqCst);
                inner.release();
                after_inner.store(me.priority(), Ordering::SeqCst);
                outer.release();
                after_outer.store(me.priority(), Ordering::SeqCst);
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    outer_held.wait();

    let t1 = {
        let outer = outer.clone();
        kernel
            .create_thread("t1", 10, move |_| {
                let _guard = outer.lock();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };

    kernel.set_priority(0).unwrap();
    assert_eq!(t1.state(), ThreadState::Blocked);
    assert_eq!(t2.priority(), 10);
    assert_eq!(t3.priority(), 10);
    assert_eq!(t3.real_priority(), 5);

    release_inner.signal();
    for handle in [&t1, &t2, &t3] {
        assert!(handle.wait_for_termination().is_success());
    }

    assert_eq!(t3_after.load(Ordering::SeqCst), 5);
    assert_eq!(t2_with_inner.load(Ordering::SeqCst), 10);
    assert_eq!(t2_after_inner.load(Ordering::SeqCst), 10);
    assert_eq!(t2_after_outer.load(Ordering::SeqCst), 5);
}

#[test]
fn test_recursive_mutex_depth() {
    let _kernel = init_test();
    let mutex = Mutex::new(true);
    for depth in 1..=3 {
        mutex.acquire();
        assert_eq!(mutex.depth(), depth);
    }
    for _ in 0..3 {
        mutex.release();
    }
    assert!(!mutex.is_held());
}

#[test]
#[should_panic(expected = "recursion depth")]
fn test_non_recursive_reacquire_panics() {
    let _kernel = init_test();
    let mutex = Mutex::new(false);
    mutex.acquire();
    mutex.acquire();
}

#[test]
fn test_guard_releases_on_drop() {
    let kernel = init_test();
    let mutex = Mutex::new(false);
    {
        let _guard = mutex.lock();
        assert_eq!(mutex.holder_id(), Some(kernel.current_thread().id()));
        assert_eq!(kernel.current_thread().held_mutexes(), 1);
    }
    assert!(!mutex.is_held());
    assert_eq!(kernel.current_thread().held_mutexes(), 0);
}

#[test]
fn test_terminated_waiter_withdraws_its_donation() {
    let kernel = init_test();
    let mutex = Arc::new(Mutex::new(false));
    mutex.acquire();

    let waiter = {
        let mutex = mutex.clone();
        kernel
            .create_thread("quitter", 20, move |_| {
                let _guard = mutex.lock();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    // the request is noticed when the waiter blocks on the mutex
    waiter.terminate();
    kernel.yield_now();
    assert_eq!(waiter.wait_for_termination(), ExitStatus::Terminated);
    assert_eq!(waiter.state(), ThreadState::Dying);
    assert_eq!(mutex.waiter_count(), 0);
    assert_eq!(kernel.current_thread().priority(), 16);

    mutex.release();
    assert!(!mutex.is_held());
    assert_eq!(kernel.current_thread().priority(), 16);
}

#[test]
fn test_terminated_waiter_lowers_whole_chain() {
    let kernel = init_test();
    let outer = Arc::new(Mutex::new(false));
    let inner = Arc::new(Mutex::new(false));
    outer.acquire();

    // middle holds inner and waits for outer, which main holds
    let middle = {
        let (outer, inner) = (outer.clone(), inner.clone());
        kernel
            .create_thread("middle", 18, move |_| {
                let _inner = inner.lock();
                let _outer = outer.lock();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    kernel.yield_now();
    assert_eq!(middle.state(), ThreadState::Blocked);
    assert_eq!(kernel.current_thread().priority(), 18);

    let top = {
        let inner = inner.clone();
        kernel
            .create_thread("top", 25, move |_| {
                let _inner = inner.lock();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    top.terminate();
    kernel.yield_now();
    assert_eq!(top.wait_for_termination(), ExitStatus::Terminated);
    assert_eq!(inner.waiter_count(), 0);
    assert_eq!(middle.priority(), 18);
    assert_eq!(kernel.current_thread().priority(), 18);

    outer.release();
    assert_eq!(kernel.current_thread().priority(), 16);
    assert!(middle.wait_for_termination().is_success());
    assert!(!outer.is_held());
    assert!(!inner.is_held());
}

#[test]
fn test_two_cpus_hand_on_past_terminated_waiter() {
    init_logging();
    let kernel = Kernel::boot(KernelConfig::default().cpu_count(2).tick_period_us(200)).unwrap();
    let mutex = Arc::new(Mutex::new(false));

    for round in 0..20 {
        mutex.acquire();
        let spawn = |name: String, priority: u8| {
            let mutex = mutex.clone();
            kernel
                .create_thread(&name, priority, move |_| {
                    let _guard = mutex.lock();
                    ExitStatus::SUCCESS
                })
                .unwrap()
        };
        let quitter = spawn(format!("quitter-{round}"), 20);
        let follower = spawn(format!("follower-{round}"), 18);

        // depending on timing the quitter exits while enqueued, mid-block or
        // not at all; in every case the mutex must move on
        quitter.terminate();
        kernel.yield_now();
        mutex.release();

        assert!(follower.wait_for_termination().is_success());
        let status = quitter.wait_for_termination();
        assert!(
            status == ExitStatus::SUCCESS || status == ExitStatus::Terminated,
            "round {round}: {status:?}"
        );
        assert!(!mutex.is_held(), "round {round}");
        assert_eq!(mutex.waiter_count(), 0, "round {round}");
        assert_eq!(kernel.current_thread().priority(), 16, "round {round}");
    }
    kernel.shutdown();
}

// ============================================================================
// Events
// ============================================================================

#[test]
fn test_notification_event_releases_all() {
    let kernel = init_test();
    let event = notification();
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let (event, woken) = (event.clone(), woken.clone());
            kernel
                .create_thread(&format!("n{i}"), 20, move |_| {
                    event.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                    ExitStatus::SUCCESS
                })
                .unwrap()
        })
        .collect();

    kernel.yield_now();
    assert_eq!(event.waiter_count(), 3);
    event.signal();
    for handle in &handles {
        handle.wait_for_termination();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 3);
    assert!(event.is_signaled());
}

#[test]
fn test_synchronization_event_releases_one() {
    let kernel = init_test();
    let event = Arc::new(Event::new(EventKind::Synchronization, false));
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let (event, woken) = (event.clone(), woken.clone());
            kernel
                .create_thread(&format!("s{i}"), 20, move |_| {
                    event.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                    ExitStatus::SUCCESS
                })
                .unwrap()
        })
        .collect();

    kernel.yield_now();
    event.signal();
    kernel.yield_now();
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(!event.is_signaled());
    assert_eq!(event.waiter_count(), 1);

    event.signal();
    for handle in &handles {
        handle.wait_for_termination();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 2);
}

#[test]
fn test_presignaled_event_does_not_block() {
    let _kernel = init_test();
    let event = Event::new(EventKind::Synchronization, true);
    event.wait();
    assert!(!event.is_signaled());
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_zero_length_timer() {
    let kernel = init_test();
    let timer = kernel.create_timer(TimerKind::RelativeOnce, 0).unwrap();
    timer.start();
    assert_eq!(kernel.check_timers(), 1);
    timer.wait();
    assert!(timer.is_signaled());
}

#[test]
fn test_unstarted_timer_wait_returns() {
    let kernel = init_test();
    let timer = kernel.create_timer(TimerKind::RelativeOnce, 1_000).unwrap();
    timer.wait();
    assert!(!timer.is_started());
    assert_eq!(kernel.check_timers(), 0);
}

#[test]
fn test_timer_fires_at_trigger_time() {
    let kernel = init_test();
    kernel.clock.set(100);
    let timer = kernel.create_timer(TimerKind::RelativeOnce, 400).unwrap();
    assert_eq!(timer.trigger_time_us(), 500);
    timer.start();
    assert_eq!(kernel.next_timer_deadline(), Some(500));

    kernel.clock.set(499);
    assert_eq!(kernel.check_timers(), 0);
    kernel.clock.advance(1);
    assert_eq!(kernel.check_timers(), 1);
    assert!(timer.is_signaled());
}

#[test]
fn test_timer_stop_releases_waiter() {
    let kernel = init_test();
    let timer = Arc::new(kernel.create_timer(TimerKind::Absolute, u64::MAX).unwrap());
    timer.start();

    let waiter = {
        let timer = timer.clone();
        kernel
            .create_thread("sleeper", 20, move |_| {
                timer.wait();
                ExitStatus::SUCCESS
            })
            .unwrap()
    };
    kernel.yield_now();
    assert_eq!(waiter.state(), ThreadState::Blocked);

    timer.stop();
    assert!(waiter.wait_for_termination().is_success());
    assert!(!timer.is_started());
}

#[test]
fn test_timer_teardown_unregisters() {
    let kernel = init_test();
    let timer = kernel.create_timer(TimerKind::RelativePeriodic, 250).unwrap();
    assert_eq!(timer.reload_time_us(), 250);
    assert_eq!(kernel.timer_count(), 1);
    timer.teardown();
    assert_eq!(kernel.timer_count(), 0);
    assert_eq!(kernel.next_timer_deadline(), None);
}

#[test]
fn test_idle_clock_fires_timer() {
    init_logging();
    let kernel = Kernel::boot(KernelConfig::default().tick_period_us(200)).unwrap();
    let elapsed = Arc::new(AtomicU64::new(0));

    let slept = elapsed.clone();
    let sleeper = kernel
        .create_thread("sleeper", 20, move |kernel| {
            let start = kernel.now_micros();
            let timer = kernel.create_timer(TimerKind::RelativeOnce, 2_000).unwrap();
            timer.start();
            timer.wait();
            slept.store(kernel.now_micros() - start, Ordering::SeqCst);
            ExitStatus::SUCCESS
        })
        .unwrap();

    assert!(sleeper.wait_for_termination().is_success());
    assert!(elapsed.load(Ordering::SeqCst) >= 2_000);
    assert!(kernel.cpu_stats()[0].idle_ticks >= 1);
    kernel.shutdown();
}

// ============================================================================
// Execution contexts
// ============================================================================

#[test]
fn test_user_process_threads() {
    let kernel = init_test();
    let process = Arc::new(UserProcess::new(Pid(7), "user"));
    let owner: Arc<dyn ExecutionContext> = process.clone();

    let worker = kernel
        .create_thread_in("user-main", 20, owner, |_| ExitStatus::SUCCESS)
        .unwrap();
    let stack = worker.user_stack().unwrap();
    assert_eq!(stack.size, kernel.config().user_stack_size);
    assert_eq!(process.live_stacks(), 1);
    assert_eq!(process.thread_ids(), vec![worker.id()]);

    worker.wait_for_termination();
    assert_eq!(process.terminated_threads(), 1);
    assert!(process.address_space_switches() >= 1);

    drop(worker);
    assert_eq!(process.live_stacks(), 0);
    assert!(process.thread_ids().is_empty());
}

#[test]
fn test_user_stack_exhaustion() {
    let kernel = init_test();
    let process = Arc::new(UserProcess::new(Pid(9), "tiny").with_stack_limit(0));
    let count = kernel.thread_count();
    let stacks = kernel.kernel_stacks_in_use();

    let err = kernel
        .create_thread_in("no-room", 20, process.clone(), |_| ExitStatus::SUCCESS)
        .unwrap_err();
    assert_eq!(err, KernelError::AllocationFailed("user stack"));
    assert_eq!(kernel.thread_count(), count);
    assert_eq!(kernel.kernel_stacks_in_use(), stacks);
    assert!(process.thread_ids().is_empty());
    assert_eq!(process.pid(), Pid(9));
}

// ============================================================================
// Introspection
// ============================================================================

#[test]
fn test_dump_threads_json() {
    let kernel = init_test();
    let json = kernel.dump_threads().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    let threads = parsed.as_array().unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().any(|t| t["name"] == "main-00" && t["state"] == "Running"));
}

// ============================================================================
// Multiple CPUs
// ============================================================================

#[test]
fn test_two_cpus_share_mutex() {
    init_logging();
    let kernel = Kernel::boot(KernelConfig::default().cpu_count(2).tick_period_us(200)).unwrap();
    assert_eq!(kernel.cpu_count(), 2);

    let mutex = Arc::new(Mutex::new(false));
    let inside = flag();
    let total = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let (mutex, inside, total) = (mutex.clone(), inside.clone(), total.clone());
            kernel
                .create_thread(&format!("w{i}"), 16, move |kernel| {
                    for _ in 0..25 {
                        {
                            let _guard = mutex.lock();
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            total.fetch_add(1, Ordering::SeqCst);
                            inside.store(false, Ordering::SeqCst);
                        }
                        kernel.yield_now();
                    }
                    ExitStatus::SUCCESS
                })
                .unwrap()
        })
        .collect();

    for worker in &workers {
        assert!(worker.wait_for_termination().is_success());
    }
    assert_eq!(total.load(Ordering::SeqCst), 100);
    assert!(
        kernel
            .threads()
            .iter()
            .any(|t| t.name == "idle-01")
    );
    kernel.shutdown();
}
