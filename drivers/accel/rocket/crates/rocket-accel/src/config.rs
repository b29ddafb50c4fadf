//! # Configuration
//!
//! Per-core scheduler tuning and device topology.

use rocket_core::{Error, Result};
use rocket_mem::domain::{IovaRange, DEFAULT_RANGE};

// =============================================================================
// SCHEDULER CONFIGURATION
// =============================================================================

/// Where a confirmed hang's reset sequence runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    /// In the timeout context, before the timeout hook returns
    #[default]
    Inline,
    /// On the core's reset worker, via [`crate::Core::run_reset_work`]
    Deferred,
}

/// Run queue configuration of one core
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Time a dispatched job may run before it is presumed hung
    pub timeout_ms: u64,
    /// Jobs handed to the hardware at once
    pub credit_limit: u32,
    /// Hangs a job may be implicated in before it is dropped on resubmission
    pub hang_limit: u32,
    /// Where the reset sequence runs
    pub reset_mode: ResetMode,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            credit_limit: 1,
            hang_limit: 2,
            reset_mode: ResetMode::Inline,
        }
    }
}

impl SchedConfig {
    /// Reject settings the engine cannot honor.
    ///
    /// The engine has a single hardware queue, so exactly one credit.
    pub fn validate(&self) -> Result<()> {
        if self.credit_limit != 1 {
            log::debug!("sched: credit limit {} unsupported", self.credit_limit);
            return Err(Error::InvalidArgument);
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

// =============================================================================
// DEVICE CONFIGURATION
// =============================================================================

/// Device topology
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of NPU cores
    pub num_cores: usize,
    /// Scheduler settings shared by every core
    pub sched: SchedConfig,
    /// Address range of each client's IOVA domain
    pub iova_range: IovaRange,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_cores: 1,
            sched: SchedConfig::default(),
            iova_range: DEFAULT_RANGE,
        }
    }
}

impl DeviceConfig {
    /// Config for `num_cores` cores with default scheduling
    pub fn with_cores(num_cores: usize) -> Self {
        Self {
            num_cores,
            ..Self::default()
        }
    }
}
