//! Timer System
//!
//! Timers that threads can block on until a deadline passes.
//!
//! Design:
//! - The registry keeps every live timer sorted by trigger time (earliest
//!   first); equal trigger times keep creation order
//! - Timers live in a slab and the sorted order is a list of slab slots
//! - Each timer owns a notification event; the tick signals every started
//!   timer whose trigger time has passed
//! - Periodic timers are not re-armed by the tick
//! - Time comes from the kernel clock, in microseconds

use super::error::{KernelError, KernelResult};
use super::event::{Event, EventKind};
use super::spinlock::SpinLock;
use super::KernelShared;
use log::trace;
use slab::Slab;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// How a timer's trigger time is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires at the given system time
    Absolute,
    /// Fires once, the given duration after creation
    RelativeOnce,
    /// Like `RelativeOnce`, remembering the duration as its period
    RelativePeriodic,
}

impl TryFrom<u32> for TimerKind {
    type Error = KernelError;

    fn try_from(raw: u32) -> KernelResult<Self> {
        match raw {
            0 => Ok(TimerKind::Absolute),
            1 => Ok(TimerKind::RelativeOnce),
            2 => Ok(TimerKind::RelativePeriodic),
            other => Err(KernelError::InvalidTimerKind(other)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TimerCore {
    kind: TimerKind,
    trigger_time_us: u64,
    reload_time_us: u64,
    started: AtomicBool,
    torn_down: AtomicBool,
    event: Event,
}

impl TimerCore {
    fn new(kind: TimerKind, time_us: u64, now_us: u64) -> Self {
        let (trigger_time_us, reload_time_us) = match kind {
            TimerKind::Absolute => (time_us, 0),
            TimerKind::RelativeOnce | TimerKind::RelativePeriodic => {
                (now_us.saturating_add(time_us), time_us)
            }
        };
        Self {
            kind,
            trigger_time_us,
            reload_time_us,
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            event: Event::new(EventKind::Notification, false),
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct TimerList {
    timers: Slab<Arc<TimerCore>>,
    /// Slots sorted by trigger time
    order: Vec<usize>,
}

/// All live timers of a kernel
#[derive(Debug, Default)]
pub(crate) struct TimerRegistry {
    list: SpinLock<TimerList>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, core: Arc<TimerCore>) -> usize {
        let mut list = self.list.lock();
        let trigger = core.trigger_time_us;
        let slot = list.timers.insert(core);
        let position = {
            let TimerList { timers, order } = &*list;
            order
                .iter()
                .position(|queued| timers[*queued].trigger_time_us > trigger)
                .unwrap_or(order.len())
        };
        list.order.insert(position, slot);
        slot
    }

    fn remove(&self, slot: usize) {
        let mut list = self.list.lock();
        if list.timers.contains(slot) {
            list.timers.remove(slot);
            list.order.retain(|queued| *queued != slot);
        }
    }

    /// Signal every started timer whose trigger time is at or before `now_us`.
    ///
    /// Returns how many timers were signalled.
    pub fn check_all(&self, now_us: u64) -> usize {
        let list = self.list.lock();
        let mut fired = 0;
        for slot in &list.order {
            let timer = &list.timers[*slot];
            if timer.trigger_time_us > now_us {
                break;
            }
            if timer.is_started() {
                timer.event.signal();
                fired += 1;
            }
        }
        if fired > 0 {
            trace!("timer tick at {now_us}us signalled {fired} timer(s)");
        }
        fired
    }

    /// Earliest trigger time among started timers
    pub fn next_deadline(&self) -> Option<u64> {
        let list = self.list.lock();
        list.order
            .iter()
            .map(|slot| &list.timers[*slot])
            .find(|timer| timer.is_started())
            .map(|timer| timer.trigger_time_us)
    }

    pub fn len(&self) -> usize {
        self.list.lock().timers.len()
    }

    /// Trigger times in registry order
    pub fn trigger_times(&self) -> Vec<u64> {
        let list = self.list.lock();
        list.order
            .iter()
            .map(|slot| list.timers[*slot].trigger_time_us)
            .collect()
    }
}

/// A timer registered with a kernel
///
/// Dropping the timer tears it down.
pub struct Timer {
    core: Arc<TimerCore>,
    slot: usize,
    kernel: Weak<KernelShared>,
}

impl Timer {
    pub(crate) fn create(
        shared: &Arc<KernelShared>,
        kind: TimerKind,
        time_us: u64,
    ) -> KernelResult<Timer> {
        let now = shared.clock.now_micros();
        let core = Arc::new(TimerCore::new(kind, time_us, now));
        let slot = shared.timers.insert(core.clone());
        trace!(
            "timer {slot} created: {kind:?}, trigger at {}us",
            core.trigger_time_us
        );
        Ok(Timer {
            core,
            slot,
            kernel: Arc::downgrade(shared),
        })
    }

    pub fn kind(&self) -> TimerKind {
        self.core.kind
    }

    pub fn trigger_time_us(&self) -> u64 {
        self.core.trigger_time_us
    }

    /// Duration a relative timer was created with; zero for absolute timers
    pub fn reload_time_us(&self) -> u64 {
        self.core.reload_time_us
    }

    pub fn is_started(&self) -> bool {
        self.core.is_started()
    }

    /// True once the tick (or a stop) has signalled the timer
    pub fn is_signaled(&self) -> bool {
        self.core.event.is_signaled()
    }

    pub fn start(&self) {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.core.started.store(true, Ordering::SeqCst);
    }

    /// Stop the timer and release its waiters
    pub fn stop(&self) {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.core.started.store(false, Ordering::SeqCst);
        self.core.event.signal();
    }

    /// Block until the timer fires; returns at once if it was never started
    pub fn wait(&self) {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return;
        }
        if self.core.is_started() {
            self.core.event.wait();
        }
    }

    /// Stop the timer and remove it from the registry
    pub fn teardown(self) {
        drop(self);
    }

    fn uninit(&mut self) {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.core.torn_down.store(true, Ordering::SeqCst);
        if let Some(shared) = self.kernel.upgrade() {
            shared.timers.remove(self.slot);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.uninit();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("slot", &self.slot)
            .field("kind", &self.core.kind)
            .field("trigger_time_us", &self.core.trigger_time_us)
            .field("started", &self.is_started())
            .finish()
    }
}
