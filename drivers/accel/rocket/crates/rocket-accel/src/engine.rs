//! # NPU Cores
//!
//! One [`Core`] per hardware engine: its register window, interrupt line,
//! power and IOMMU handles, the in-flight slot and the run queue feeding it.
//!
//! The dispatch path lives in [`crate::dispatch`], interrupt handling in
//! [`crate::irq`] and hang recovery in [`crate::reset`]; all of them are
//! `impl Core` blocks over the state defined here.

use alloc::sync::Arc;
use core::fmt;

use rocket_core::{
    Clock, CoreId, Error, FenceRef, IommuGroup, IrqLine, PowerDomain, Result, Timeline,
};
use rocket_hal::registers::pc;
use rocket_hal::RegisterIo;
use spin::Mutex;

use crate::config::SchedConfig;
use crate::irq::DmaErrors;
use crate::job::JobRef;
use crate::reset::ResetController;
use crate::sched::{SchedBackend, SchedStat, Scheduler};

/// Platform handles of one core
#[derive(Clone)]
pub struct CoreResources {
    /// Register window
    pub regs: Arc<dyn RegisterIo>,
    /// Interrupt line
    pub irq: Arc<dyn IrqLine>,
    /// Runtime power domain
    pub power: Arc<dyn PowerDomain>,
    /// IOMMU group the core translates through
    pub iommu: Arc<dyn IommuGroup>,
    /// Millisecond clock for timeouts
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for CoreResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreResources")
            .field("irq", &self.irq.number())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CORE
// =============================================================================

/// One NPU engine
pub struct Core {
    pub(crate) id: CoreId,
    pub(crate) config: SchedConfig,
    pub(crate) regs: Arc<dyn RegisterIo>,
    pub(crate) irq: Arc<dyn IrqLine>,
    pub(crate) power: Arc<dyn PowerDomain>,
    pub(crate) iommu: Arc<dyn IommuGroup>,
    /// Done tokens, one per dispatch attempt
    pub(crate) timeline: Timeline,
    /// In-flight slot; also serializes register programming
    pub(crate) job_lock: Mutex<Option<JobRef>>,
    pub(crate) dma_errors: DmaErrors,
    pub(crate) reset_ctl: ResetController,
    pub(crate) sched: Scheduler,
}

impl Core {
    /// Bring up core `index`
    pub fn new(index: u32, config: SchedConfig, res: CoreResources) -> Result<Arc<Self>> {
        config.validate()?;

        let id = CoreId::new(index);
        let core = Arc::new(Self {
            id,
            sched: Scheduler::new(id, config.clone(), res.clock),
            config,
            regs: res.regs,
            irq: res.irq,
            power: res.power,
            iommu: res.iommu,
            timeline: Timeline::new("rockchip-npu"),
            job_lock: Mutex::new(None),
            dma_errors: DmaErrors::default(),
            reset_ctl: ResetController::new(),
        });

        let weak = Arc::downgrade(&core);
        core.sched.set_waker(Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.kick();
            }
        }));

        log::debug!("{:?}: up, irq {}", id, core.irq.number());
        Ok(core)
    }

    /// Core id
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Run queue
    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// Run the scheduler until it has nothing left to do
    pub fn kick(&self) {
        self.sched.run(self);
    }

    /// Job currently on the hardware
    pub fn in_flight(&self) -> Option<JobRef> {
        self.job_lock.lock().clone()
    }

    /// Whether nothing is running or holding a credit
    pub fn is_idle(&self) -> bool {
        self.job_lock.lock().is_none() && self.sched.is_idle()
    }

    /// Fire the timeout hook if the running job is overdue
    pub fn check_timeout(&self) -> Option<SchedStat> {
        self.sched.check_timeout(self)
    }

    /// Tear down: drop queued reset work, quiesce the hardware and cancel
    /// every job
    pub fn fini(&self) {
        self.cancel_reset_work();
        self.sched.stop();

        self.regs.write32(pc::INTERRUPT_MASK, 0x0);
        self.irq.synchronize();

        let in_flight = self.job_lock.lock().take();
        if let Some(job) = in_flight {
            self.iommu.detach();
            if let Some(done) = job.done_fence() {
                done.set_error(Error::Canceled);
                done.signal();
            }
            self.power.put_noidle();
        }

        self.sched.fini(self);
    }
}

impl SchedBackend for Core {
    fn run_job(&self, job: &JobRef) -> Option<FenceRef> {
        self.dispatch(job)
    }

    fn timedout_job(&self, job: &JobRef) -> SchedStat {
        self.timedout(job)
    }

    fn free_job(&self, job: JobRef) {
        log::trace!("{:?}: releasing job {}", self.id, job.id());
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight().map(|job| job.id()))
            .field("reset", &self.reset_ctl)
            .field("sched", &self.sched)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Core: Send, Sync);
