//! # Hang Recovery
//!
//! Timeout handling and the core reset sequence.
//!
//! ## Reset Sequence
//!
//! ```text
//!  Running ─► Stopping ─► Draining ─► HardwareResetting ─► Resubmitting ─► Running
//!             stop run    mask, sync   power cycle          hand detached
//!             queue       irq, handle                       jobs back
//!                         last irq
//! ```
//!
//! While a reset is pending the dispatch path starts nothing. The sequence
//! runs either inline from the timeout hook or from [`Core::run_reset_work`],
//! per [`ResetMode`](crate::config::ResetMode).

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use rocket_hal::registers::pc;
use spin::Mutex;

use crate::config::ResetMode;
use crate::engine::Core;
use crate::job::JobRef;
use crate::sched::SchedStat;

/// Reset progress of a core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetPhase {
    /// Normal operation
    Running = 0,
    /// Run queue being parked
    Stopping = 1,
    /// Last interrupt being handled
    Draining = 2,
    /// Power domain being cycled
    HardwareResetting = 3,
    /// Detached jobs being handed back
    Resubmitting = 4,
}

impl ResetPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stopping,
            2 => Self::Draining,
            3 => Self::HardwareResetting,
            4 => Self::Resubmitting,
            _ => Self::Running,
        }
    }
}

// =============================================================================
// CONTROLLER STATE
// =============================================================================

/// Per-core reset bookkeeping
pub(crate) struct ResetController {
    pending: AtomicBool,
    queued: AtomicBool,
    phase: AtomicU8,
    resets: AtomicU64,
    worker: Mutex<()>,
}

impl ResetController {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            phase: AtomicU8::new(ResetPhase::Running as u8),
            resets: AtomicU64::new(0),
            worker: Mutex::new(()),
        }
    }

    fn phase(&self) -> ResetPhase {
        ResetPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ResetPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl fmt::Debug for ResetController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetController")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("phase", &self.phase())
            .field("resets", &self.resets.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// CORE RESET
// =============================================================================

impl Core {
    /// Whether a reset has been requested and not yet performed
    pub fn is_reset_pending(&self) -> bool {
        self.reset_ctl.pending.load(Ordering::Acquire)
    }

    /// Current reset phase
    pub fn reset_phase(&self) -> ResetPhase {
        self.reset_ctl.phase()
    }

    /// Completed resets
    pub fn reset_count(&self) -> u64 {
        self.reset_ctl.resets.load(Ordering::Relaxed)
    }

    /// Timeout hook
    pub(crate) fn timedout(&self, job: &JobRef) -> SchedStat {
        let Some(done) = job.done_fence() else {
            return SchedStat::Nominal;
        };
        if done.is_signaled() {
            return SchedStat::Nominal;
        }

        // The completion may be sitting in a held-off handler
        self.irq.synchronize();
        if done.is_signaled() {
            log::warn!("{:?}: unexpectedly high interrupt latency", self.id);
            return SchedStat::Nominal;
        }

        if self.reset_ctl.pending.swap(true, Ordering::AcqRel) {
            return SchedStat::Reset;
        }

        log::error!(
            "{:?}: job {} timed out at task {}/{}",
            self.id,
            job.id(),
            job.next_task(),
            job.task_count()
        );
        job.increase_karma();
        self.iommu.detach();

        match self.config.reset_mode {
            ResetMode::Inline => {
                let _worker = self.reset_ctl.worker.lock();
                self.reset();
            },
            ResetMode::Deferred => {
                self.reset_ctl.queued.store(true, Ordering::Release);
            },
        }

        SchedStat::Reset
    }

    /// Request a reset, run by the next [`Core::run_reset_work`]
    pub fn schedule_reset(&self) {
        self.reset_ctl.pending.store(true, Ordering::Release);
        self.reset_ctl.queued.store(true, Ordering::Release);
    }

    /// Run queued reset work; returns whether a reset ran
    pub fn run_reset_work(&self) -> bool {
        if !self.reset_ctl.queued.load(Ordering::Acquire) {
            return false;
        }
        let Some(_worker) = self.reset_ctl.worker.try_lock() else {
            return false;
        };
        if !self.reset_ctl.queued.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.reset()
    }

    /// Drop queued reset work and wait for a running one
    pub(crate) fn cancel_reset_work(&self) {
        self.reset_ctl.queued.store(false, Ordering::Release);
        drop(self.reset_ctl.worker.lock());
    }

    /// Reset sequence; caller holds the worker lock
    fn reset(&self) -> bool {
        if !self.is_reset_pending() {
            return false;
        }

        log::warn!("{:?}: resetting", self.id);

        self.reset_ctl.set_phase(ResetPhase::Stopping);
        self.sched.stop();

        self.reset_ctl.set_phase(ResetPhase::Draining);
        self.regs.write32(pc::INTERRUPT_MASK, 0x0);
        self.irq.synchronize();
        self.handle_irq();

        if let Some(job) = self.job_lock.lock().take() {
            log::debug!("{:?}: dropping in-flight job {}", self.id, job.id());
            self.power.put_noidle();
        }

        self.reset_ctl.set_phase(ResetPhase::HardwareResetting);
        if let Err(err) = self.power.force_suspend() {
            log::error!("{:?}: force suspend failed: {}", self.id, err);
        }
        if let Err(err) = self.power.force_resume() {
            log::error!("{:?}: force resume failed: {}", self.id, err);
        }
        self.reset_ctl.pending.store(false, Ordering::Release);

        self.reset_ctl.set_phase(ResetPhase::Resubmitting);
        self.sched.resubmit_jobs(self);
        self.sched.start();

        self.reset_ctl.set_phase(ResetPhase::Running);
        self.reset_ctl.resets.fetch_add(1, Ordering::Relaxed);
        log::info!("{:?}: reset done", self.id);

        true
    }
}
