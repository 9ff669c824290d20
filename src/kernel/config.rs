//! Kernel configuration
//!
//! Built in code with builder-style setters or loaded from JSON:
//!
//! ```
//! use priosched::kernel::KernelConfig;
//!
//! let config = KernelConfig::default().cpu_count(2).time_slice_ticks(4);
//! assert_eq!(config.cpu_count, 2);
//!
//! let loaded = KernelConfig::from_json(r#"{ "cpu_count": 4 }"#).unwrap();
//! assert_eq!(loaded.cpu_count, 4);
//! assert_eq!(loaded.time_slice_ticks, 1);
//! ```

use super::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};

/// Host stack size for each kernel thread
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Size of the user stack handed out by non-kernel execution contexts
pub const DEFAULT_USER_STACK_SIZE: usize = 64 * 1024;

/// Ticks a thread may run before a reschedule is requested
pub const DEFAULT_TIME_SLICE_TICKS: u64 = 1;

pub const DEFAULT_TICK_PERIOD_US: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of logical CPUs
    pub cpu_count: usize,
    /// Host stack size (bytes) for every kernel thread
    pub stack_size: usize,
    /// Total bytes that may be handed out as kernel stacks; `None` means unlimited
    pub kernel_stack_budget: Option<usize>,
    /// Size of user stacks requested from non-kernel execution contexts
    pub user_stack_size: usize,
    /// Time slice, in clock ticks
    pub time_slice_ticks: u64,
    /// How long an idle CPU halts before its clock interrupt fires
    pub tick_period_us: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            stack_size: DEFAULT_STACK_SIZE,
            kernel_stack_budget: None,
            user_stack_size: DEFAULT_USER_STACK_SIZE,
            time_slice_ticks: DEFAULT_TIME_SLICE_TICKS,
            tick_period_us: DEFAULT_TICK_PERIOD_US,
        }
    }
}

impl KernelConfig {
    pub fn cpu_count(mut self, n: usize) -> Self {
        self.cpu_count = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn kernel_stack_budget(mut self, bytes: usize) -> Self {
        self.kernel_stack_budget = Some(bytes);
        self
    }

    pub fn user_stack_size(mut self, bytes: usize) -> Self {
        self.user_stack_size = bytes;
        self
    }

    pub fn time_slice_ticks(mut self, ticks: u64) -> Self {
        self.time_slice_ticks = ticks;
        self
    }

    pub fn tick_period_us(mut self, us: u64) -> Self {
        self.tick_period_us = us;
        self
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> KernelResult<Self> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> KernelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations the kernel cannot run with
    pub fn validate(&self) -> KernelResult<()> {
        if self.cpu_count == 0 {
            return Err(KernelError::InvalidConfig("cpu_count must be at least 1".into()));
        }
        if self.stack_size == 0 {
            return Err(KernelError::InvalidConfig("stack_size must be non-zero".into()));
        }
        if self.time_slice_ticks == 0 {
            return Err(KernelError::InvalidConfig(
                "time_slice_ticks must be at least 1".into(),
            ));
        }
        if self.tick_period_us == 0 {
            return Err(KernelError::InvalidConfig(
                "tick_period_us must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
