//! # Dispatch
//!
//! Hands one task at a time to the hardware. The first task of a job is
//! started from the run queue; every later one from the completion
//! interrupt of the task before it.

use rocket_core::{Error, FenceRef};
use rocket_hal::registers::{self, cna, core_block, pc, PcInterrupt};

use crate::engine::Core;
use crate::job::{Job, JobRef};

impl Core {
    /// Run hook: start a dispatch attempt for `job`.
    ///
    /// Returns `None` when the job already failed or has no task left.
    /// Power-up and IOMMU attach failures complete the attempt right away
    /// with `DeviceFault`.
    pub(crate) fn dispatch(&self, job: &JobRef) -> Option<FenceRef> {
        if job.finished().is_some_and(|finished| finished.error().is_some()) {
            return None;
        }
        if job.is_complete() {
            return None;
        }

        let fence = self.timeline.create();
        job.replace_done_fence(fence.clone());

        if let Err(err) = self.power.get_sync() {
            log::error!("{:?}: failed to power up for job {}: {}", self.id, job.id(), err);
            fence.set_error(Error::DeviceFault);
            fence.signal();
            return Some(fence);
        }

        if let Err(err) = self.iommu.attach(job.domain_id()) {
            log::error!("{:?}: failed to attach domain {:?}: {}", self.id, job.domain_id(), err);
            self.power.put_autosuspend();
            fence.set_error(Error::DeviceFault);
            fence.signal();
            return Some(fence);
        }

        let mut slot = self.job_lock.lock();
        *slot = Some(job.clone());
        self.hw_submit(job);

        Some(fence)
    }

    /// Program the next task of `job` and start it.
    ///
    /// Caller holds the job lock. Does nothing while a reset is pending.
    pub(crate) fn hw_submit(&self, job: &Job) {
        if self.is_reset_pending() {
            log::debug!("{:?}: reset pending, not starting job {}", self.id, job.id());
            return;
        }

        let index = job.next_task();
        let Some(task) = job.advance_task() else {
            return;
        };
        let core = self.id.index();

        self.regs.write32(pc::BASE_ADDRESS, 0x1);
        self.regs.write32(cna::S_POINTER, registers::s_pointer(core));
        self.regs.write32(core_block::S_POINTER, registers::s_pointer(core));

        self.regs.write32(pc::BASE_ADDRESS, task.regcmd().lower_32());
        self.regs
            .write32(pc::REGISTER_AMOUNTS, registers::register_amounts(task.regcmd_count()));

        self.regs.write32(pc::INTERRUPT_MASK, PcInterrupt::DONE.bits());
        self.regs.write32(pc::INTERRUPT_CLEAR, PcInterrupt::DONE.bits());

        self.regs.write32(pc::TASK_CON, registers::task_con(true, 1));
        self.regs.write32(pc::TASK_DMA_BASE_ADDR, 0x0);

        self.regs.write32(pc::OPERATION_ENABLE, 0x1);

        log::debug!(
            "{:?}: submitted regcmd at {} for job {} task {}/{}",
            self.id,
            task.regcmd(),
            job.id(),
            index + 1,
            job.task_count()
        );
    }
}
