//! # Device and Clients
//!
//! [`Device`] owns the cores; [`Client`] is one opened file: an IOVA
//! domain, a buffer-object handle table and an entity feeding the cores.
//!
//! ## Submission Path
//!
//! ```text
//!  Client::submit_job
//!    │ copy_tasks, resolve handles, Job::new
//!    ▼
//!  sched_lock ──────────────────────────────────────────────┐
//!  │ bind entity (least loaded core), arm job               │
//!  │ reserve slots, depend on prior readers/writers         │
//!  │ push to entity                                          │
//!  │ publish finished token as newest writer of outputs     │
//!  └────────────────────────────────────────────────────────┘
//!    ▼
//!  kick the core
//! ```
//!
//! Holding `sched_lock` across the whole admission keeps dependency
//! registration in the same order as queue admission for concurrent
//! submitters.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rocket_core::{BoHandle, DmaAddr, DomainId, Error, JobId, Result};
use rocket_hal::registers::MAX_CORES;
use rocket_mem::{BufferObject, BufferRef, Domain, MapLock, PrepOp};
use spin::Mutex;

use crate::config::DeviceConfig;
use crate::engine::{Core, CoreResources};
use crate::entity::EntityQueue;
use crate::job::{Job, JobRef};
use crate::task::{copy_tasks, TaskDesc};

// =============================================================================
// REQUESTS
// =============================================================================

/// A created buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoInfo {
    /// Client-local handle
    pub handle: BoHandle,
    /// NPU address
    pub dma_addr: DmaAddr,
    /// Mapped size
    pub size: u64,
}

/// One job of a submit request
#[derive(Debug, Clone, Copy)]
pub struct JobDesc<'a> {
    /// Tasks, run in order
    pub tasks: &'a [TaskDesc],
    /// Buffers the job reads
    pub in_bo_handles: &'a [BoHandle],
    /// Buffers the job writes
    pub out_bo_handles: &'a [BoHandle],
    /// Must be zero
    pub reserved: u32,
}

/// A submit request
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc<'a> {
    /// Jobs, submitted in order
    pub jobs: &'a [JobDesc<'a>],
    /// Must be zero
    pub reserved: u32,
}

// =============================================================================
// DEVICE
// =============================================================================

/// The NPU
pub struct Device {
    config: DeviceConfig,
    cores: Vec<Arc<Core>>,
    /// Serializes job admission and entity binding
    sched_lock: Mutex<()>,
    /// Serializes IOVA mapping across clients
    map_lock: MapLock,
    next_job: AtomicU64,
}

impl Device {
    /// Bring up one core per entry of `resources`
    pub fn new(config: DeviceConfig, resources: Vec<CoreResources>) -> Result<Arc<Self>> {
        if config.num_cores > MAX_CORES {
            log::error!("rocket: {} cores, at most {} supported", config.num_cores, MAX_CORES);
            return Err(Error::InvalidArgument);
        }
        if config.num_cores == 0 || resources.len() != config.num_cores {
            log::error!(
                "rocket: {} core resources for {} cores",
                resources.len(),
                config.num_cores
            );
            return Err(Error::InvalidArgument);
        }

        let mut cores = Vec::new();
        cores.try_reserve_exact(resources.len())?;
        for (index, res) in resources.into_iter().enumerate() {
            cores.push(Core::new(index as u32, config.sched.clone(), res)?);
        }

        log::info!("rocket: {} cores up", cores.len());

        Ok(Arc::new(Self {
            config,
            cores,
            sched_lock: Mutex::new(()),
            map_lock: Arc::new(Mutex::new(())),
            next_job: AtomicU64::new(1),
        }))
    }

    /// Open a client
    pub fn open(self: &Arc<Self>) -> Client {
        let domain = Domain::new(self.config.iova_range, self.map_lock.clone());
        log::debug!("rocket: client opened, domain {:?}", domain.id());

        Client {
            device: self.clone(),
            domain,
            entity: EntityQueue::new(),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    /// All cores
    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    /// Core `index`
    pub fn core(&self, index: usize) -> Option<&Arc<Core>> {
        self.cores.get(index)
    }

    /// Whether every core is idle
    pub fn is_idle(&self) -> bool {
        self.cores.iter().all(|core| core.is_idle())
    }

    /// Periodic service: run reset work, check timeouts, retire and dispatch
    pub fn tick(&self) {
        for core in &self.cores {
            core.run_reset_work();
            core.check_timeout();
            core.kick();
        }
    }

    /// Stop every core and cancel outstanding jobs
    pub fn fini(&self) {
        for core in &self.cores {
            core.fini();
        }
    }

    /// Bind `entity` to a core: keep its binding unless it may move and a
    /// core with less load exists
    fn select_core(&self, entity: &Arc<EntityQueue>) -> Result<usize> {
        let current = entity.bound_core();
        if let Some(index) = current {
            if !entity.can_rebind() {
                return Ok(index);
            }
        }

        let (best, best_load) = self
            .cores
            .iter()
            .enumerate()
            .map(|(index, core)| (index, core.sched().load()))
            .min_by_key(|&(_, load)| load)
            .ok_or(Error::InvalidArgument)?;

        let target = match current {
            Some(index) if self.cores[index].sched().load() <= best_load => index,
            Some(index) => {
                self.cores[index].sched().remove_entity(entity);
                self.cores[best].sched().add_entity(entity.clone())?;
                log::debug!("rocket: entity moved from core {} to {}", index, best);
                best
            },
            None => {
                self.cores[best].sched().add_entity(entity.clone())?;
                best
            },
        };

        entity.bind(target);
        Ok(target)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("cores", &self.cores)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// An opened device handle
pub struct Client {
    device: Arc<Device>,
    domain: Arc<Domain>,
    entity: Arc<EntityQueue>,
    handles: Mutex<BTreeMap<BoHandle, BufferRef>>,
    next_handle: AtomicU32,
}

impl Client {
    /// IOVA domain of this client
    pub fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    // =========================================================================
    // Buffer Objects
    // =========================================================================

    /// Allocate and map a buffer object
    pub fn create_bo(&self, size: u64) -> Result<BoInfo> {
        let bo = BufferObject::create(&self.domain, size)?;
        let handle = BoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let info = BoInfo {
            handle,
            dma_addr: bo.dma_addr(),
            size: bo.size(),
        };

        self.handles.lock().insert(handle, bo);
        Ok(info)
    }

    /// Drop the handle; the buffer lives on while jobs reference it
    pub fn close_bo(&self, handle: BoHandle) -> Result<()> {
        self.handles
            .lock()
            .remove(&handle)
            .map(drop)
            .ok_or(Error::NotFound)
    }

    /// Resolve a handle
    pub fn lookup_bo(&self, handle: BoHandle) -> Result<BufferRef> {
        self.handles.lock().get(&handle).cloned().ok_or(Error::NotFound)
    }

    /// Begin CPU access; see [`BufferObject::prep`]
    pub fn prep_bo(&self, handle: BoHandle, op: u32, max_spins: u64) -> Result<()> {
        if PrepOp::from_bits(op).is_none() {
            return Err(Error::InvalidArgument);
        }
        self.lookup_bo(handle)?.prep(op, max_spins)
    }

    /// End CPU access
    pub fn fini_bo(&self, handle: BoHandle, reserved: u32) -> Result<()> {
        if reserved != 0 {
            return Err(Error::InvalidArgument);
        }
        self.lookup_bo(handle)?.fini();
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit jobs in order, stopping at the first failure
    pub fn submit(&self, args: &SubmitDesc<'_>) -> Result<()> {
        if args.reserved != 0 {
            log::debug!("rocket: reserved field in submit request should be 0");
            return Err(Error::InvalidArgument);
        }

        for desc in args.jobs {
            self.submit_job(desc)?;
        }

        Ok(())
    }

    /// Submit one job
    pub fn submit_job(&self, desc: &JobDesc<'_>) -> Result<JobRef> {
        if desc.reserved != 0 {
            log::debug!("rocket: reserved field in job should be 0");
            return Err(Error::InvalidArgument);
        }

        let tasks = copy_tasks(desc.tasks)?;
        let in_bos = self.lookup_bos(desc.in_bo_handles)?;
        let out_bos = self.lookup_bos(desc.out_bo_handles)?;

        let id = JobId(self.device.next_job.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(id, tasks, in_bos, out_bos, self.domain.clone());

        self.push(&job)?;
        Ok(job)
    }

    fn lookup_bos(&self, handles: &[BoHandle]) -> Result<Vec<BufferRef>> {
        let table = self.handles.lock();
        let mut bos = Vec::new();
        bos.try_reserve_exact(handles.len())?;

        for handle in handles {
            let bo = table.get(handle).ok_or_else(|| {
                log::debug!("rocket: unknown buffer handle {:?}", handle);
                Error::ResourceFault
            })?;
            bos.push(bo.clone());
        }

        Ok(bos)
    }

    fn push(&self, job: &JobRef) -> Result<()> {
        let device = &self.device;

        let core = {
            let _guard = device.sched_lock.lock();

            let index = device.select_core(&self.entity)?;
            let core = device.core(index).cloned().ok_or(Error::InvalidArgument)?;
            self.entity.arm(job, core.id());

            let admitted = job
                .acquire_object_fences(job.in_bos(), false)
                .and_then(|()| job.acquire_object_fences(job.out_bos(), true))
                .and_then(|()| core.sched().push_job(&self.entity, job.clone()));
            if let Err(err) = admitted {
                log::debug!("rocket: job {} not admitted: {}", job.id(), err);
                job.abort(err);
                job.release_object_slots();
                return Err(err);
            }

            job.attach_object_fences();
            job.release_object_slots();
            core
        };

        core.kick();
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let core = {
            let _guard = self.device.sched_lock.lock();
            let core = self
                .entity
                .bound_core()
                .and_then(|index| self.device.core(index).cloned());
            if let Some(core) = &core {
                core.sched().remove_entity(&self.entity);
            }
            core
        };

        let canceled = self.entity.kill();
        if let Some(core) = core {
            core.sched().drop_canceled(canceled, core.as_ref());
        }

        log::debug!("rocket: client closed, domain {:?}", self.domain.id());
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("domain", &self.domain.id())
            .field("bound_core", &self.entity.bound_core())
            .field("queued", &self.entity.len())
            .finish_non_exhaustive()
    }
}
