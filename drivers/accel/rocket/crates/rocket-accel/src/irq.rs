//! # Interrupt Handling
//!
//! Threaded interrupt: [`Core::irq_handler`] runs in hard-IRQ context and
//! only masks the line, [`Core::irq_thread`] does the work.
//!
//! ```text
//!  DONE raised ─► irq_handler ─► mask, WakeThread ─► irq_thread
//!                                                      │
//!                    more tasks ◄── handle_done ◄───────┘
//!                    hw_submit        │
//!                                     └── last task: clear slot, detach,
//!                                         signal done token, drop power ref
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use rocket_hal::registers::{pc, PcInterrupt, INTERRUPT_CLEAR_ALL};

use crate::engine::Core;
use crate::job::JobRef;

/// Interrupt handler result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours
    None,
    /// Handled completely
    Handled,
    /// Run the threaded half
    WakeThread,
}

/// DMA error interrupts seen by one core
#[derive(Debug, Default)]
pub(crate) struct DmaErrors {
    read: AtomicU64,
    write: AtomicU64,
}

impl DmaErrors {
    /// Count the error bits in `raw`
    fn record(&self, raw: PcInterrupt) -> (u64, u64) {
        let mut read = self.read.load(Ordering::Relaxed);
        let mut write = self.write.load(Ordering::Relaxed);
        if raw.contains(PcInterrupt::DMA_READ_ERROR) {
            read = self.read.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if raw.contains(PcInterrupt::DMA_WRITE_ERROR) {
            write = self.write.fetch_add(1, Ordering::Relaxed) + 1;
        }
        (read, write)
    }

    fn counts(&self) -> (u64, u64) {
        (self.read.load(Ordering::Relaxed), self.write.load(Ordering::Relaxed))
    }
}

impl Core {
    /// DMA read and write error interrupts seen so far
    pub fn dma_error_counts(&self) -> (u64, u64) {
        self.dma_errors.counts()
    }

    /// Hard-IRQ half
    pub fn irq_handler(&self) -> IrqReturn {
        let raw = PcInterrupt::from_bits_truncate(self.regs.read32(pc::INTERRUPT_RAW_STATUS));

        if raw.intersects(PcInterrupt::DMA_READ_ERROR | PcInterrupt::DMA_WRITE_ERROR) {
            let (read, write) = self.dma_errors.record(raw);
            log::warn!(
                "{:?}: DMA error, raw {:#x} ({} read, {} write so far)",
                self.id,
                raw.bits(),
                read,
                write
            );
        }

        if !raw.intersects(PcInterrupt::DONE) {
            return IrqReturn::None;
        }

        self.regs.write32(pc::INTERRUPT_MASK, 0x0);

        IrqReturn::WakeThread
    }

    /// Threaded half
    pub fn irq_thread(&self) -> IrqReturn {
        self.handle_irq();
        self.kick();

        IrqReturn::Handled
    }

    /// Acknowledge the interrupt and advance the in-flight job
    pub(crate) fn handle_irq(&self) {
        self.power.mark_last_busy();

        let status = self.regs.read32(pc::INTERRUPT_STATUS);
        let raw = self.regs.read32(pc::INTERRUPT_RAW_STATUS);
        log::trace!("{:?}: irq status {:#x} raw {:#x}", self.id, status, raw);

        self.regs.write32(pc::OPERATION_ENABLE, 0x0);
        self.regs.write32(pc::INTERRUPT_CLEAR, INTERRUPT_CLEAR_ALL);

        let mut slot = self.job_lock.lock();
        if slot.is_some() {
            self.handle_done(&mut slot);
        }
    }

    /// A task of the in-flight job finished; caller holds the job lock
    fn handle_done(&self, slot: &mut Option<JobRef>) {
        let Some(job) = slot.as_ref() else {
            return;
        };

        if !job.is_complete() {
            self.hw_submit(job);
            return;
        }

        let Some(job) = slot.take() else {
            return;
        };
        self.iommu.detach();
        if let Some(done) = job.done_fence() {
            done.signal();
        }
        self.power.put_autosuspend();

        log::trace!("{:?}: job {} done", self.id, job.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{task, Rig};
    use rocket_mem::PrepOp;

    #[test]
    fn test_top_half_ignores_foreign_interrupt() {
        let rig = Rig::new(1);
        let core = rig.core(0);
        assert_eq!(core.irq_handler(), IrqReturn::None);

        rig.sim(0).regs.raise(PcInterrupt::CORE_0);
        assert_eq!(core.irq_handler(), IrqReturn::None);
        assert!(rig.sim(0).regs.writes_to(pc::INTERRUPT_MASK).is_empty());
    }

    #[test]
    fn test_top_half_masks_on_done() {
        let rig = Rig::new(1);
        let core = rig.core(0);
        rig.sim(0).regs.raise(PcInterrupt::DPU_1);

        assert_eq!(core.irq_handler(), IrqReturn::WakeThread);
        assert_eq!(rig.sim(0).regs.writes_to(pc::INTERRUPT_MASK), [0]);
    }

    #[test]
    fn test_dma_error_still_completes() {
        let rig = Rig::new(1);
        let client = rig.device.open();
        let job = rig.submit(&client, &[task(0x1000, 2)], &[], &[]);

        rig.sim(0).regs.raise(PcInterrupt::DMA_READ_ERROR | PcInterrupt::DPU_0);
        assert_eq!(rig.fire(0), IrqReturn::Handled);
        assert_eq!(job.finished().unwrap().status(), Some(Ok(())));
    }

    #[test]
    fn test_dma_errors_counted_per_core() {
        let rig = Rig::new(2);
        let a = rig.device.open();
        let b = rig.device.open();
        rig.submit(&a, &[task(0x1000, 2)], &[], &[]);
        rig.submit(&b, &[task(0x2000, 2)], &[], &[]);

        rig.sim(0).regs.raise(PcInterrupt::DMA_READ_ERROR | PcInterrupt::DPU_0);
        assert_eq!(rig.fire(0), IrqReturn::Handled);
        assert_eq!(rig.core(0).dma_error_counts(), (1, 0));

        rig.sim(1).regs.raise(PcInterrupt::DMA_READ_ERROR | PcInterrupt::DMA_WRITE_ERROR);
        assert_eq!(rig.core(1).irq_handler(), IrqReturn::None);
        rig.sim(1).regs.raise(PcInterrupt::DMA_WRITE_ERROR | PcInterrupt::DPU_0);
        assert_eq!(rig.fire(1), IrqReturn::Handled);
        assert_eq!(rig.core(1).dma_error_counts(), (2, 2));
        assert_eq!(rig.core(0).dma_error_counts(), (1, 0));
    }

    #[test]
    fn test_two_tasks_then_retire() {
        let rig = Rig::new(1);
        let client = rig.device.open();
        let out = client.create_bo(4096).unwrap();
        let job = rig.submit(
            &client,
            &[task(0x1000, 4), task(0x2000, 4)],
            &[],
            &[out.handle],
        );

        assert_eq!(rig.sim(0).regs.starts(), 1);
        assert_eq!(rig.complete(0), IrqReturn::Handled);
        assert_eq!(rig.sim(0).regs.starts(), 2);
        assert_eq!(
            rig.sim(0).regs.value(pc::BASE_ADDRESS),
            Some(0x2000)
        );
        assert!(!job.finished().unwrap().is_signaled());

        rig.complete(0);
        assert_eq!(job.finished().unwrap().status(), Some(Ok(())));
        assert!(rig.core(0).in_flight().is_none());
        assert!(rig.core(0).is_idle());

        let bo = client.lookup_bo(out.handle).unwrap();
        let writers = bo.dependencies(false);
        assert_eq!(writers.len(), 1);
        assert!(alloc::sync::Arc::ptr_eq(&writers[0], job.finished().unwrap()));
        assert_eq!(client.prep_bo(out.handle, PrepOp::READ.bits(), 0), Ok(()));

        let sim = rig.sim(0);
        assert_eq!(sim.power.gets(), 1);
        assert_eq!(sim.power.autosuspend_puts(), 1);
        assert_eq!(sim.power.active(), 0);
        assert_eq!(sim.iommu.attaches(), 1);
        assert_eq!(sim.iommu.detaches(), 1);
        assert!(sim.power.busy_marks() >= 2);
    }

    #[test]
    fn test_interrupt_without_job() {
        let rig = Rig::new(1);
        rig.sim(0).regs.complete_task();
        assert_eq!(rig.fire(0), IrqReturn::Handled);
        assert_eq!(
            rig.sim(0).regs.writes_to(pc::INTERRUPT_CLEAR),
            [INTERRUPT_CLEAR_ALL]
        );
    }
}
