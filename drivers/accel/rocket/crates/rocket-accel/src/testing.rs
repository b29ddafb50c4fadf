//! Simulated device for unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;

use rocket_core::BoHandle;
use rocket_hal::sim::{SimClock, SimIommu, SimIrqLine, SimPower, SimRegisters};

use crate::config::DeviceConfig;
use crate::device::{Client, Device, JobDesc};
use crate::engine::{Core, CoreResources};
use crate::irq::IrqReturn;
use crate::job::JobRef;
use crate::task::TaskDesc;

/// Simulated hardware of one core
pub(crate) struct SimCore {
    pub regs: Arc<SimRegisters>,
    pub irq: Arc<SimIrqLine>,
    pub power: Arc<SimPower>,
    pub iommu: Arc<SimIommu>,
}

/// A device over simulated cores sharing one clock
pub(crate) struct Rig {
    pub device: Arc<Device>,
    pub clock: Arc<SimClock>,
    sims: Vec<SimCore>,
    timeout_ms: u64,
}

impl Rig {
    pub fn new(num_cores: usize) -> Self {
        Self::with_config(DeviceConfig::with_cores(num_cores))
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        let clock = Arc::new(SimClock::new());
        let sims: Vec<SimCore> = (0..config.num_cores)
            .map(|i| SimCore {
                regs: Arc::new(SimRegisters::new()),
                irq: Arc::new(SimIrqLine::new(40 + i as u32)),
                power: Arc::new(SimPower::new()),
                iommu: Arc::new(SimIommu::new()),
            })
            .collect();

        let resources = sims.iter().map(|sim| Self::wrap(sim, &clock)).collect();
        let timeout_ms = config.sched.timeout_ms;
        let device = Device::new(config, resources).expect("device bring-up");

        Self {
            device,
            clock,
            sims,
            timeout_ms,
        }
    }

    fn wrap(sim: &SimCore, clock: &Arc<SimClock>) -> CoreResources {
        CoreResources {
            regs: sim.regs.clone(),
            irq: sim.irq.clone(),
            power: sim.power.clone(),
            iommu: sim.iommu.clone(),
            clock: clock.clone(),
        }
    }

    /// Another set of handles onto core `index`'s simulated hardware
    pub fn resources(&self, index: usize) -> CoreResources {
        Self::wrap(&self.sims[index], &self.clock)
    }

    pub fn sim(&self, index: usize) -> &SimCore {
        &self.sims[index]
    }

    pub fn core(&self, index: usize) -> &Arc<Core> {
        &self.device.cores()[index]
    }

    pub fn submit(
        &self,
        client: &Client,
        tasks: &[TaskDesc],
        in_bos: &[BoHandle],
        out_bos: &[BoHandle],
    ) -> JobRef {
        client
            .submit_job(&JobDesc {
                tasks,
                in_bo_handles: in_bos,
                out_bo_handles: out_bos,
                reserved: 0,
            })
            .expect("submit")
    }

    /// Deliver core `index`'s interrupt through both halves
    pub fn fire(&self, index: usize) -> IrqReturn {
        let core = self.core(index);
        match core.irq_handler() {
            IrqReturn::WakeThread => core.irq_thread(),
            other => other,
        }
    }

    /// Finish the running task on core `index` and deliver the interrupt
    pub fn complete(&self, index: usize) -> IrqReturn {
        self.sims[index].regs.complete_task();
        self.fire(index)
    }

    /// Let the timeout elapse and service the device
    pub fn expire(&self) {
        self.clock.advance(self.timeout_ms);
        self.device.tick();
    }
}

pub(crate) fn task(regcmd: u64, regcmd_count: u32) -> TaskDesc {
    TaskDesc {
        regcmd,
        regcmd_count,
        reserved: 0,
    }
}
