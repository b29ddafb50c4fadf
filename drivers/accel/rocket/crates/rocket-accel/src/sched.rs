//! # Run Queue
//!
//! Per-core scheduler: picks ready jobs from the bound entities, hands them
//! to the backend one credit at a time, retires them in admission order and
//! watches the running job for timeouts.
//!
//! ## Job States
//!
//! ```text
//!  entity FIFO ──select──► pending: Waiting ──run_job──► Running(done token)
//!                                    ▲                     │        │
//!                                    └──────── stop ───────┘        │ signaled
//!                                                                   ▼
//!                              Skipped (run_job returned None) ──► retired
//! ```
//!
//! ## Work Serialization
//!
//! [`Scheduler::run`] may be called from any context. The first caller to
//! take the work lock processes kicks until none are left; everyone else
//! only leaves a kick behind. Completion tokens never run the scheduler
//! directly, they leave a kick for the next caller of `run`, so signaling
//! under a core's job lock cannot re-enter the dispatch path.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rocket_core::{Clock, CoreId, Error, FenceRef, Result};
use spin::{Mutex, Once};

use crate::config::SchedConfig;
use crate::entity::EntityQueue;
use crate::job::JobRef;

/// Callback that gets a scheduler to run again
pub type Waker = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// BACKEND
// =============================================================================

/// Outcome of a timeout hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStat {
    /// Nothing was wrong, keep waiting
    Nominal,
    /// The engine is being reset
    Reset,
}

/// Hardware side of a run queue
pub trait SchedBackend: Send + Sync {
    /// Start `job` on the hardware.
    ///
    /// Returns the token signaled when this dispatch attempt completes, or
    /// `None` when there is nothing to run.
    fn run_job(&self, job: &JobRef) -> Option<FenceRef>;

    /// The running `job` exceeded its timeout
    fn timedout_job(&self, job: &JobRef) -> SchedStat;

    /// Drop the run queue's reference to a retired job
    fn free_job(&self, job: JobRef);
}

// =============================================================================
// RUN QUEUE STATE
// =============================================================================

#[derive(Debug)]
enum HwState {
    /// Not handed to the hardware, or detached by `stop`
    Waiting,
    /// Dispatched, completes with the token
    Running(FenceRef),
    /// `run_job` had nothing to do
    Skipped,
}

#[derive(Debug)]
struct Pending {
    job: JobRef,
    hw: HwState,
    started_ms: u64,
}

#[derive(Debug, Default)]
struct RunQueue {
    entities: Vec<Arc<EntityQueue>>,
    /// Round-robin position
    cursor: usize,
    /// Jobs handed to the backend and not yet retired, in admission order
    pending: VecDeque<Pending>,
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Run queue of one core
pub struct Scheduler {
    core: CoreId,
    config: SchedConfig,
    clock: Arc<dyn Clock>,
    rq: Mutex<RunQueue>,
    work: Mutex<()>,
    kick_pending: Arc<AtomicBool>,
    stopped: AtomicBool,
    /// Jobs queued or pending
    score: AtomicUsize,
    waker: Once<Waker>,
}

impl Scheduler {
    /// Create an empty run queue
    pub fn new(core: CoreId, config: SchedConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            core,
            config,
            clock,
            rq: Mutex::new(RunQueue::default()),
            work: Mutex::new(()),
            kick_pending: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            score: AtomicUsize::new(0),
            waker: Once::new(),
        }
    }

    /// Install the callback run when a dependency of a queued job signals
    pub fn set_waker(&self, waker: Waker) {
        self.waker.call_once(|| waker);
    }

    /// Leave a kick and call the waker
    pub fn wake(&self) {
        self.kick_pending.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.get() {
            waker();
        }
    }

    fn entity_waker(&self) -> Waker {
        match self.waker.get() {
            Some(waker) => waker.clone(),
            None => {
                let kick = self.kick_pending.clone();
                Arc::new(move || kick.store(true, Ordering::SeqCst))
            },
        }
    }

    /// Leave a kick when `fence` signals
    fn kick_on(&self, fence: &FenceRef) {
        let kick = self.kick_pending.clone();
        fence.add_callback(Box::new(move || kick.store(true, Ordering::SeqCst)));
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Serve `entity` from this run queue
    pub fn add_entity(&self, entity: Arc<EntityQueue>) -> Result<()> {
        let mut rq = self.rq.lock();
        rq.entities.try_reserve(1)?;
        rq.entities.push(entity);
        Ok(())
    }

    /// Stop serving `entity`
    pub fn remove_entity(&self, entity: &Arc<EntityQueue>) {
        let mut rq = self.rq.lock();
        rq.entities.retain(|e| !Arc::ptr_eq(e, entity));
        if rq.cursor >= rq.entities.len() {
            rq.cursor = 0;
        }
    }

    /// Queue an armed job on `entity`
    pub fn push_job(&self, entity: &EntityQueue, job: JobRef) -> Result<()> {
        entity.push(job)?;
        self.score.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Release jobs canceled on a torn-down entity
    pub fn drop_canceled(&self, jobs: Vec<JobRef>, backend: &dyn SchedBackend) {
        for job in jobs {
            self.score.fetch_sub(1, Ordering::AcqRel);
            backend.free_job(job);
        }
    }

    // =========================================================================
    // Work Loop
    // =========================================================================

    /// Process kicks until none are left, unless another context already is
    pub fn run(&self, backend: &dyn SchedBackend) {
        self.kick_pending.store(true, Ordering::SeqCst);

        loop {
            let Some(guard) = self.work.try_lock() else {
                return;
            };
            while self.kick_pending.swap(false, Ordering::SeqCst) {
                self.run_once(backend);
            }
            drop(guard);

            if !self.kick_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn run_once(&self, backend: &dyn SchedBackend) {
        loop {
            if self.is_stopped() {
                return;
            }

            self.retire(backend);

            if self.rq.lock().pending.len() >= self.config.credit_limit as usize {
                return;
            }
            let Some(job) = self.select() else {
                return;
            };

            if let Some(scheduled) = job.scheduled() {
                scheduled.signal();
            }

            let queued = {
                let mut rq = self.rq.lock();
                rq.pending.try_reserve(1).map(|()| {
                    rq.pending.push_back(Pending {
                        job: job.clone(),
                        hw: HwState::Waiting,
                        started_ms: self.clock.now_ms(),
                    });
                })
            };
            if queued.is_err() {
                log::error!("{:?}: no memory to track job {}", self.core, job.id());
                self.finish(job, Some(Error::NoMemory), backend);
                continue;
            }

            let hw = match backend.run_job(&job) {
                Some(fence) => {
                    self.kick_on(&fence);
                    HwState::Running(fence)
                },
                None => HwState::Skipped,
            };
            self.set_hw_state(&job, hw);
        }
    }

    fn set_hw_state(&self, job: &JobRef, hw: HwState) {
        let now = self.clock.now_ms();
        let mut rq = self.rq.lock();
        if let Some(entry) = rq.pending.iter_mut().find(|p| Arc::ptr_eq(&p.job, job)) {
            entry.hw = hw;
            entry.started_ms = now;
        }
    }

    /// Next ready job, entities served round-robin
    fn select(&self) -> Option<JobRef> {
        let waker = self.entity_waker();
        let mut rq = self.rq.lock();
        let count = rq.entities.len();

        for i in 0..count {
            let index = (rq.cursor + i) % count;
            if let Some(job) = rq.entities[index].pop_ready(&waker) {
                rq.cursor = (index + 1) % count;
                return Some(job);
            }
        }

        None
    }

    /// Retire completed jobs from the head of the pending list
    fn retire(&self, backend: &dyn SchedBackend) {
        loop {
            let (job, error) = {
                let mut rq = self.rq.lock();
                let error = match rq.pending.front().map(|p| &p.hw) {
                    Some(HwState::Running(fence)) if fence.is_signaled() => fence.error(),
                    Some(HwState::Skipped) => None,
                    _ => return,
                };
                match rq.pending.pop_front() {
                    Some(entry) => (entry.job, error),
                    None => return,
                }
            };

            self.finish(job, error, backend);
        }
    }

    fn finish(&self, job: JobRef, error: Option<Error>, backend: &dyn SchedBackend) {
        if let Some(finished) = job.finished() {
            if let Some(error) = error {
                finished.set_error(error);
            }
            finished.signal();
        }
        self.score.fetch_sub(1, Ordering::AcqRel);
        backend.free_job(job);
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// Fire the timeout hook for the oldest running job older than the
    /// timeout, then re-arm its timer
    pub fn check_timeout(&self, backend: &dyn SchedBackend) -> Option<SchedStat> {
        if self.is_stopped() {
            return None;
        }

        let now = self.clock.now_ms();
        let job = {
            let rq = self.rq.lock();
            rq.pending
                .iter()
                .find(|p| {
                    matches!(&p.hw, HwState::Running(fence) if !fence.is_signaled())
                        && now.saturating_sub(p.started_ms) >= self.config.timeout_ms
                })
                .map(|p| p.job.clone())
        }?;

        log::debug!("{:?}: job {} timed out after {} ms", self.core, job.id(), self.config.timeout_ms);
        let stat = backend.timedout_job(&job);

        let now = self.clock.now_ms();
        if let Some(entry) = self
            .rq
            .lock()
            .pending
            .iter_mut()
            .find(|p| Arc::ptr_eq(&p.job, &job))
        {
            entry.started_ms = now;
        }

        Some(stat)
    }

    // =========================================================================
    // Stop / Resubmit / Start
    // =========================================================================

    /// Park the run queue and detach running jobs from their tokens.
    ///
    /// Waits for a work loop in progress. Never call from inside
    /// [`Scheduler::run`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        drop(self.work.lock());

        let mut rq = self.rq.lock();
        for entry in rq.pending.iter_mut() {
            let detach = matches!(&entry.hw, HwState::Running(fence) if !fence.is_signaled());
            if detach {
                entry.hw = HwState::Waiting;
            }
        }
    }

    /// Hand every detached job back to the backend, in admission order.
    ///
    /// A job implicated in more hangs than the limit is failed with
    /// `HangDetected` instead. A job the backend has nothing left to run
    /// for is failed too, unless its done token already signaled cleanly.
    pub fn resubmit_jobs(&self, backend: &dyn SchedBackend) {
        let jobs: Vec<JobRef> = self
            .rq
            .lock()
            .pending
            .iter()
            .filter(|p| matches!(p.hw, HwState::Waiting))
            .map(|p| p.job.clone())
            .collect();

        for job in jobs {
            if job.karma() > self.config.hang_limit {
                if let Some(finished) = job.finished() {
                    log::warn!("{:?}: job {} exceeded the hang limit", self.core, job.id());
                    finished.set_error(Error::HangDetected);
                }
            }

            let hw = match backend.run_job(&job) {
                Some(fence) => {
                    self.kick_on(&fence);
                    HwState::Running(fence)
                },
                None => {
                    // A job that completed while the queue was stopped keeps
                    // its clean status
                    let completed = job
                        .done_fence()
                        .is_some_and(|done| done.status() == Some(Ok(())));
                    if let Some(finished) = job.finished() {
                        if job.karma() > 0 {
                            finished.set_error(Error::HangDetected);
                        } else if !completed {
                            finished.set_error(Error::Canceled);
                        }
                    }
                    HwState::Skipped
                },
            };
            self.set_hw_state(&job, hw);
        }
    }

    /// Unpark the run queue and wake it
    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Stop for good: fail pending and queued jobs with `Canceled`
    pub fn fini(&self, backend: &dyn SchedBackend) {
        self.stop();

        let (entities, pending) = {
            let mut rq = self.rq.lock();
            let entities = core::mem::take(&mut rq.entities);
            let pending: Vec<Pending> = rq.pending.drain(..).collect();
            (entities, pending)
        };

        for entry in pending {
            let error = match &entry.hw {
                HwState::Running(fence) if fence.is_signaled() => fence.error(),
                _ => Some(Error::Canceled),
            };
            self.finish(entry.job, error, backend);
        }

        for entity in entities {
            self.drop_canceled(entity.kill(), backend);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the run queue is parked
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether no job holds a credit
    pub fn is_idle(&self) -> bool {
        self.rq.lock().pending.is_empty()
    }

    /// Jobs queued or pending, for load balancing
    pub fn load(&self) -> usize {
        self.score.load(Ordering::Acquire)
    }

    /// Jobs holding or waiting for a credit
    pub fn pending_len(&self) -> usize {
        self.rq.lock().pending.len()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("core", &self.core)
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .field("load", &self.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::task::{copy_tasks, TaskDesc};
    use rocket_core::{Fence, JobId, Timeline};
    use rocket_hal::sim::SimClock;
    use rocket_mem::domain::{Domain, DEFAULT_RANGE};

    struct MockBackend {
        timeline: Timeline,
        runs: Mutex<Vec<(JobId, FenceRef)>>,
        freed: AtomicUsize,
        timeouts: AtomicUsize,
        skip: AtomicBool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                timeline: Timeline::new("mock"),
                runs: Mutex::new(Vec::new()),
                freed: AtomicUsize::new(0),
                timeouts: AtomicUsize::new(0),
                skip: AtomicBool::new(false),
            }
        }

        fn ran(&self) -> Vec<JobId> {
            self.runs.lock().iter().map(|(id, _)| *id).collect()
        }

        fn last_fence(&self) -> FenceRef {
            self.runs.lock().last().unwrap().1.clone()
        }
    }

    impl SchedBackend for MockBackend {
        fn run_job(&self, job: &JobRef) -> Option<FenceRef> {
            if self.skip.load(Ordering::SeqCst) || job.finished().unwrap().error().is_some() {
                return None;
            }
            let fence = self.timeline.create();
            self.runs.lock().push((job.id(), fence.clone()));
            Some(fence)
        }

        fn timedout_job(&self, _job: &JobRef) -> SchedStat {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            SchedStat::Nominal
        }

        fn free_job(&self, job: JobRef) {
            self.freed.fetch_add(1, Ordering::SeqCst);
            drop(job);
        }
    }

    struct Fixture {
        sched: Scheduler,
        clock: Arc<SimClock>,
        backend: MockBackend,
    }

    impl Fixture {
        fn new(config: SchedConfig) -> Self {
            let clock = Arc::new(SimClock::new());
            Self {
                sched: Scheduler::new(CoreId::new(0), config, clock.clone()),
                clock,
                backend: MockBackend::new(),
            }
        }

        fn entity(&self) -> Arc<EntityQueue> {
            let entity = EntityQueue::new();
            self.sched.add_entity(entity.clone()).unwrap();
            entity
        }

        fn push(&self, entity: &EntityQueue, id: u64) -> JobRef {
            let tasks = copy_tasks(&[TaskDesc {
                regcmd: 0x1000,
                regcmd_count: 2,
                reserved: 0,
            }])
            .unwrap();
            let job = Job::new(
                JobId(id),
                tasks,
                Vec::new(),
                Vec::new(),
                Domain::new(DEFAULT_RANGE, Arc::new(Mutex::new(()))),
            );
            entity.arm(&job, CoreId::new(0));
            self.sched.push_job(entity, job.clone()).unwrap();
            job
        }

        fn run(&self) {
            self.sched.run(&self.backend);
        }
    }

    #[test]
    fn test_single_credit_serializes_jobs() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        let a = fx.push(&entity, 1);
        let b = fx.push(&entity, 2);

        fx.run();
        assert_eq!(fx.backend.ran(), alloc::vec![JobId(1)]);
        assert!(a.scheduled().unwrap().is_signaled());
        assert!(!b.scheduled().unwrap().is_signaled());
        assert!(!fx.sched.is_idle());

        fx.backend.last_fence().signal();
        fx.run();
        assert_eq!(a.finished().unwrap().status(), Some(Ok(())));
        assert_eq!(fx.backend.ran(), alloc::vec![JobId(1), JobId(2)]);
        assert_eq!(fx.backend.freed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sched.load(), 1);
    }

    #[test]
    fn test_round_robin_between_entities() {
        let fx = Fixture::new(SchedConfig::default());
        let e1 = fx.entity();
        let e2 = fx.entity();
        fx.push(&e1, 1);
        fx.push(&e1, 2);
        fx.push(&e2, 3);
        fx.push(&e2, 4);

        for _ in 0..4 {
            fx.run();
            fx.backend.last_fence().signal();
        }
        fx.run();

        assert_eq!(
            fx.backend.ran(),
            alloc::vec![JobId(1), JobId(3), JobId(2), JobId(4)]
        );
        assert!(fx.sched.is_idle());
        assert_eq!(fx.sched.load(), 0);
    }

    #[test]
    fn test_done_error_reaches_finished() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        let job = fx.push(&entity, 1);

        fx.run();
        let fence = fx.backend.last_fence();
        fence.set_error(Error::DeviceFault);
        fence.signal();
        fx.run();

        assert_eq!(job.finished().unwrap().status(), Some(Err(Error::DeviceFault)));
    }

    #[test]
    fn test_skipped_job_retires_immediately() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        fx.backend.skip.store(true, Ordering::SeqCst);
        let a = fx.push(&entity, 1);
        let b = fx.push(&entity, 2);

        fx.run();
        assert_eq!(a.finished().unwrap().status(), Some(Ok(())));
        assert_eq!(b.finished().unwrap().status(), Some(Ok(())));
        assert_eq!(fx.backend.freed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocked_job_waits_for_dependency() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        let dep = Fence::new(77, 1);
        let job = fx.push(&entity, 1);
        job.add_dependency(dep.clone()).unwrap();

        fx.run();
        assert!(fx.backend.ran().is_empty());

        dep.signal();
        fx.run();
        assert_eq!(fx.backend.ran(), alloc::vec![JobId(1)]);
    }

    #[test]
    fn test_timeout_fires_and_rearms() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        fx.push(&entity, 1);
        fx.run();

        fx.clock.advance(499);
        assert_eq!(fx.sched.check_timeout(&fx.backend), None);
        fx.clock.advance(1);
        assert_eq!(fx.sched.check_timeout(&fx.backend), Some(SchedStat::Nominal));
        assert_eq!(fx.sched.check_timeout(&fx.backend), None);
        assert_eq!(fx.backend.timeouts.load(Ordering::SeqCst), 1);

        fx.backend.last_fence().signal();
        fx.clock.advance(1000);
        assert_eq!(fx.sched.check_timeout(&fx.backend), None);
    }

    #[test]
    fn test_stop_resubmit_start() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        let job = fx.push(&entity, 1);
        fx.run();
        let first = fx.backend.last_fence();

        fx.sched.stop();
        fx.run();
        assert!(fx.sched.is_stopped());
        assert_eq!(fx.backend.ran().len(), 1);

        fx.sched.resubmit_jobs(&fx.backend);
        assert_eq!(fx.backend.ran().len(), 2);
        fx.sched.start();

        first.signal();
        fx.run();
        assert!(!job.finished().unwrap().is_signaled());

        fx.backend.last_fence().signal();
        fx.run();
        assert_eq!(job.finished().unwrap().status(), Some(Ok(())));
    }

    #[test]
    fn test_hang_limit_fails_job_on_resubmit() {
        let fx = Fixture::new(SchedConfig {
            hang_limit: 0,
            ..SchedConfig::default()
        });
        let entity = fx.entity();
        let job = fx.push(&entity, 1);
        fx.run();

        fx.sched.stop();
        job.increase_karma();
        fx.sched.resubmit_jobs(&fx.backend);
        fx.sched.start();
        fx.run();

        assert_eq!(fx.backend.ran().len(), 1);
        assert_eq!(
            job.finished().unwrap().status(),
            Some(Err(Error::HangDetected))
        );
        assert!(fx.sched.is_idle());
    }

    #[test]
    fn test_fini_cancels_everything() {
        let fx = Fixture::new(SchedConfig::default());
        let entity = fx.entity();
        let running = fx.push(&entity, 1);
        let queued = fx.push(&entity, 2);
        fx.run();

        fx.sched.fini(&fx.backend);
        assert_eq!(running.finished().unwrap().status(), Some(Err(Error::Canceled)));
        assert_eq!(queued.finished().unwrap().status(), Some(Err(Error::Canceled)));
        assert_eq!(fx.sched.load(), 0);
        assert_eq!(fx.backend.freed.load(Ordering::SeqCst), 2);
    }
}
