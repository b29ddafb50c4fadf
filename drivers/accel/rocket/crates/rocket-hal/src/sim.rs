//! # Simulated Engine
//!
//! Host-side stand-ins for one NPU core and its platform collaborators.
//!
//! [`SimRegisters`] keeps a register file, a write log and the raw
//! interrupt status. Writing `1` to `OPERATION_ENABLE` counts as a task
//! start; [`SimRegisters::complete_task`] latches the DPU done bit the way
//! the hardware does when the last unit of a task finishes. Interrupt
//! delivery itself is up to the caller.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rocket_core::{Clock, DomainId, Error, IommuGroup, IrqLine, PowerDomain, Result};
use spin::Mutex;

use crate::mmio::RegisterIo;
use crate::registers::{pc, PcInterrupt};

// =============================================================================
// REGISTERS
// =============================================================================

/// Simulated register window
#[derive(Debug, Default)]
pub struct SimRegisters {
    /// Last value written per offset
    values: Mutex<BTreeMap<u32, u32>>,
    /// Every write, in order
    writes: Mutex<Vec<(u32, u32)>>,
    /// Latched interrupt bits
    raw_status: AtomicU32,
    /// Task starts seen
    starts: AtomicUsize,
}

impl SimRegisters {
    /// Create an idle register window
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the task-done interrupt
    pub fn complete_task(&self) {
        self.raise(PcInterrupt::DPU_0);
    }

    /// Latch arbitrary interrupt bits
    pub fn raise(&self, bits: PcInterrupt) {
        self.raw_status.fetch_or(bits.bits(), Ordering::SeqCst);
    }

    /// Number of task starts
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Last value written to `offset`
    pub fn value(&self, offset: u32) -> Option<u32> {
        self.values.lock().get(&offset).copied()
    }

    /// Every value written to `offset`, oldest first
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Full write log
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }

    /// Forget the write log
    pub fn clear_log(&self) {
        self.writes.lock().clear();
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: u32) -> u32 {
        let raw = self.raw_status.load(Ordering::SeqCst);
        match offset {
            pc::INTERRUPT_RAW_STATUS => raw,
            pc::INTERRUPT_STATUS => raw & self.value(pc::INTERRUPT_MASK).unwrap_or(0),
            _ => self.value(offset).unwrap_or(0),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        self.writes.lock().push((offset, value));

        match offset {
            pc::INTERRUPT_CLEAR => {
                self.raw_status.fetch_and(!value, Ordering::SeqCst);
            },
            pc::OPERATION_ENABLE if value == 1 => {
                self.starts.fetch_add(1, Ordering::SeqCst);
            },
            _ => {},
        }

        self.values.lock().insert(offset, value);
    }
}

// =============================================================================
// IRQ LINE
// =============================================================================

/// Simulated interrupt line
///
/// A handler can be parked with [`SimIrqLine::defer_until_sync`] to model an
/// interrupt that fired but whose handler was held off; the next
/// `synchronize()` runs it.
pub struct SimIrqLine {
    number: u32,
    syncs: AtomicUsize,
    parked: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SimIrqLine {
    /// Create a line
    pub fn new(number: u32) -> Self {
        Self {
            number,
            syncs: AtomicUsize::new(0),
            parked: Mutex::new(None),
        }
    }

    /// Park a handler until the next synchronization
    pub fn defer_until_sync(&self, handler: Box<dyn FnOnce() + Send>) {
        *self.parked.lock() = Some(handler);
    }

    /// Number of `synchronize()` calls
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for SimIrqLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimIrqLine")
            .field("number", &self.number)
            .field("syncs", &self.syncs())
            .finish()
    }
}

impl IrqLine for SimIrqLine {
    fn number(&self) -> u32 {
        self.number
    }

    fn synchronize(&self) {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        let parked = self.parked.lock().take();
        if let Some(handler) = parked {
            handler();
        }
    }
}

// =============================================================================
// POWER
// =============================================================================

/// Simulated runtime-PM domain
#[derive(Debug, Default)]
pub struct SimPower {
    active: AtomicI64,
    gets: AtomicUsize,
    autosuspend_puts: AtomicUsize,
    noidle_puts: AtomicUsize,
    busy_marks: AtomicUsize,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
    fail_get: AtomicBool,
}

impl SimPower {
    /// Create a powered-down domain
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding active references
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Successful `get_sync` calls
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// `put_autosuspend` calls
    pub fn autosuspend_puts(&self) -> usize {
        self.autosuspend_puts.load(Ordering::SeqCst)
    }

    /// `put_noidle` calls
    pub fn noidle_puts(&self) -> usize {
        self.noidle_puts.load(Ordering::SeqCst)
    }

    /// `mark_last_busy` calls
    pub fn busy_marks(&self) -> usize {
        self.busy_marks.load(Ordering::SeqCst)
    }

    /// Forced power cycles completed
    pub fn power_cycles(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Forced suspends
    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    /// Make every following `get_sync` fail
    pub fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }
}

impl PowerDomain for SimPower {
    fn get_sync(&self) -> Result<()> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Error::DeviceFault);
        }
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn put_autosuspend(&self) {
        self.autosuspend_puts.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn put_noidle(&self) {
        self.noidle_puts.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn mark_last_busy(&self) {
        self.busy_marks.fetch_add(1, Ordering::SeqCst);
    }

    fn force_suspend(&self) -> Result<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn force_resume(&self) -> Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// IOMMU
// =============================================================================

/// Simulated IOMMU group
#[derive(Debug, Default)]
pub struct SimIommu {
    attached: Mutex<Option<DomainId>>,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl SimIommu {
    /// Create a detached group
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently attached domain
    pub fn attached(&self) -> Option<DomainId> {
        *self.attached.lock()
    }

    /// Attach calls
    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Detach calls
    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl IommuGroup for SimIommu {
    fn attach(&self, domain: DomainId) -> Result<()> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        *self.attached.lock() = Some(domain);
        Ok(())
    }

    fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        *self.attached.lock() = None;
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    /// Start at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn test_clear_drops_latched_bits() {
        let regs = SimRegisters::new();
        regs.raise(PcInterrupt::DPU_0 | PcInterrupt::DMA_READ_ERROR);
        regs.write32(pc::INTERRUPT_CLEAR, PcInterrupt::DPU_0.bits());
        assert_eq!(
            regs.read32(pc::INTERRUPT_RAW_STATUS),
            PcInterrupt::DMA_READ_ERROR.bits()
        );
    }

    #[test]
    fn test_status_is_masked_raw() {
        let regs = SimRegisters::new();
        regs.complete_task();
        assert_eq!(regs.read32(pc::INTERRUPT_STATUS), 0);
        regs.write32(pc::INTERRUPT_MASK, PcInterrupt::DONE.bits());
        assert_eq!(regs.read32(pc::INTERRUPT_STATUS), PcInterrupt::DPU_0.bits());
    }

    #[test]
    fn test_starts_counted() {
        let regs = SimRegisters::new();
        regs.write32(pc::OPERATION_ENABLE, 1);
        regs.write32(pc::OPERATION_ENABLE, 0);
        regs.write32(pc::OPERATION_ENABLE, 1);
        assert_eq!(regs.starts(), 2);
        assert_eq!(regs.writes_to(pc::OPERATION_ENABLE), alloc::vec![1, 0, 1]);
    }

    #[test]
    fn test_parked_handler_runs_on_sync() {
        let line = SimIrqLine::new(42);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        line.defer_until_sync(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(!ran.load(Ordering::SeqCst));
        line.synchronize();
        assert!(ran.load(Ordering::SeqCst));
        line.synchronize();
        assert_eq!(line.syncs(), 2);
    }

    #[test]
    fn test_power_balance() {
        let power = SimPower::new();
        power.get_sync().unwrap();
        power.get_sync().unwrap();
        power.put_autosuspend();
        power.put_noidle();
        assert_eq!(power.active(), 0);

        power.fail_get(true);
        assert_eq!(power.get_sync(), Err(Error::DeviceFault));
        assert_eq!(power.active(), 0);
    }
}
