//! # Submission Queues
//!
//! One [`EntityQueue`] per client: a FIFO of armed jobs feeding the run
//! queue of the core it is bound to.
//!
//! An entity owns two fence contexts, one for the acceptance tokens and one
//! for the finished tokens of its jobs, so tokens of one client compare in
//! submission order.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use rocket_core::{fence::alloc_contexts, CoreId, Error, FenceRef, Result, Timeline};
use spin::Mutex;

use crate::job::{JobRef, SchedFence};
use crate::sched::Waker;

#[derive(Debug, Default)]
struct EntityInner {
    jobs: VecDeque<JobRef>,
    /// Core whose run queue serves this entity
    bound: Option<usize>,
    /// Dependency the head job is parked on
    blocked_on: Option<FenceRef>,
    /// Finished token of the most recently pushed job
    last_finished: Option<FenceRef>,
    /// Set once the entity is torn down
    killed: bool,
}

/// Per-client job queue
#[derive(Debug)]
pub struct EntityQueue {
    scheduled: Timeline,
    finished: Timeline,
    inner: Mutex<EntityInner>,
}

impl EntityQueue {
    /// Create an unbound, empty entity
    pub fn new() -> Arc<Self> {
        let context = alloc_contexts(2);
        Arc::new(Self {
            scheduled: Timeline::with_context("rocket-scheduled", context),
            finished: Timeline::with_context("rocket-finished", context + 1),
            inner: Mutex::new(EntityInner::default()),
        })
    }

    /// Fence context of the finished tokens
    pub fn finished_context(&self) -> u64 {
        self.finished.context()
    }

    /// Create the job's tokens and fix its core
    pub fn arm(&self, job: &JobRef, core: CoreId) {
        job.arm(
            SchedFence {
                scheduled: self.scheduled.create(),
                finished: self.finished.create(),
            },
            core,
        );
    }

    /// Append an armed job
    pub fn push(&self, job: JobRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.killed {
            log::warn!("entity: push of job {} to a killed entity", job.id());
            return Err(Error::Canceled);
        }

        inner.jobs.try_reserve(1)?;
        inner.last_finished = job.finished().cloned();
        inner.jobs.push_back(job);
        Ok(())
    }

    /// Pop the head job if all its dependencies have signaled.
    ///
    /// Otherwise arm `wake` on the first blocking dependency and return
    /// `None`.
    pub fn pop_ready(&self, wake: &Waker) -> Option<JobRef> {
        let mut inner = self.inner.lock();

        if inner
            .blocked_on
            .as_ref()
            .is_some_and(|fence| !fence.is_signaled())
        {
            return None;
        }
        inner.blocked_on = None;

        loop {
            let head = inner.jobs.front()?;
            let Some(fence) = head.blocking_dependency() else {
                return inner.jobs.pop_front();
            };

            let wake = wake.clone();
            if fence.add_callback(alloc::boxed::Box::new(move || wake())) {
                inner.blocked_on = Some(fence);
                return None;
            }
            // Signaled in the meantime, look again
        }
    }

    // =========================================================================
    // Core Binding
    // =========================================================================

    /// Core the entity is bound to
    pub fn bound_core(&self) -> Option<usize> {
        self.inner.lock().bound
    }

    /// Bind to `core`
    pub fn bind(&self, core: usize) {
        self.inner.lock().bound = Some(core);
    }

    /// Whether the entity may move to another core: nothing queued and its
    /// last job finished
    pub fn can_rebind(&self) -> bool {
        let inner = self.inner.lock();
        inner.jobs.is_empty()
            && inner
                .last_finished
                .as_ref()
                .map_or(true, |fence| fence.is_signaled())
    }

    /// Queued jobs
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down: refuse further pushes and cancel every queued job.
    ///
    /// Returns the canceled jobs; their tokens are already signaled.
    pub fn kill(&self) -> Vec<JobRef> {
        let jobs: Vec<JobRef> = {
            let mut inner = self.inner.lock();
            inner.killed = true;
            inner.blocked_on = None;
            inner.jobs.drain(..).collect()
        };

        for job in &jobs {
            log::debug!("entity: canceling job {}", job.id());
            job.abort(Error::Canceled);
        }

        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::task::{copy_tasks, TaskDesc};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use rocket_core::{Fence, JobId};
    use rocket_mem::domain::{Domain, DEFAULT_RANGE};
    use rocket_mem::{BufferObject, BufferRef};

    fn job(id: u64) -> JobRef {
        let tasks = copy_tasks(&[TaskDesc {
            regcmd: 0x1000,
            regcmd_count: 2,
            reserved: 0,
        }])
        .unwrap();
        Job::new(
            JobId(id),
            tasks,
            Vec::new(),
            Vec::new(),
            Domain::new(DEFAULT_RANGE, Arc::new(Mutex::new(()))),
        )
    }

    fn job_on(id: u64, in_bos: Vec<BufferRef>, out_bos: Vec<BufferRef>) -> JobRef {
        let tasks = copy_tasks(&[TaskDesc {
            regcmd: 0x1000,
            regcmd_count: 2,
            reserved: 0,
        }])
        .unwrap();
        Job::new(
            JobId(id),
            tasks,
            in_bos,
            out_bos,
            Domain::new(DEFAULT_RANGE, Arc::new(Mutex::new(()))),
        )
    }

    fn admit(entity: &EntityQueue, job: &JobRef) {
        entity.arm(job, CoreId::new(0));
        job.acquire_object_fences(job.in_bos(), false).unwrap();
        job.acquire_object_fences(job.out_bos(), true).unwrap();
        job.attach_object_fences();
        job.release_object_slots();
    }

    fn counter_waker() -> (Waker, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let waker: Waker = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (waker, hits)
    }

    #[test]
    fn test_fifo_and_token_order() {
        let entity = EntityQueue::new();
        let (waker, _) = counter_waker();
        let a = job(1);
        let b = job(2);
        entity.arm(&a, CoreId::new(0));
        entity.arm(&b, CoreId::new(0));
        entity.push(a.clone()).unwrap();
        entity.push(b.clone()).unwrap();

        assert!(b.finished().unwrap().is_later(a.finished().unwrap()));
        assert_eq!(a.finished().unwrap().context(), entity.finished_context());
        assert_eq!(entity.pop_ready(&waker).unwrap().id(), JobId(1));
        assert_eq!(entity.pop_ready(&waker).unwrap().id(), JobId(2));
        assert!(entity.pop_ready(&waker).is_none());
    }

    #[test]
    fn test_blocked_head_wakes_on_signal() {
        let entity = EntityQueue::new();
        let (waker, hits) = counter_waker();
        let dep = Fence::new(4242, 1);
        let a = job(1);
        a.add_dependency(dep.clone()).unwrap();
        entity.arm(&a, CoreId::new(0));
        entity.push(a).unwrap();

        assert!(entity.pop_ready(&waker).is_none());
        assert!(entity.pop_ready(&waker).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        dep.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(entity.pop_ready(&waker).is_some());
    }

    #[test]
    fn test_rebind_waits_for_last_finished() {
        let entity = EntityQueue::new();
        let (waker, _) = counter_waker();
        assert!(entity.can_rebind());

        let a = job(1);
        entity.arm(&a, CoreId::new(0));
        entity.push(a.clone()).unwrap();
        assert!(!entity.can_rebind());

        entity.pop_ready(&waker).unwrap();
        assert!(!entity.can_rebind());
        a.finished().unwrap().signal();
        assert!(entity.can_rebind());
    }

    #[test]
    fn test_kill_cancels_queued() {
        let entity = EntityQueue::new();
        let a = job(1);
        entity.arm(&a, CoreId::new(0));
        entity.push(a.clone()).unwrap();

        let killed = entity.kill();
        assert_eq!(killed.len(), 1);
        assert_eq!(a.finished().unwrap().status(), Some(Err(Error::Canceled)));

        let b = job(2);
        entity.arm(&b, CoreId::new(0));
        assert_eq!(entity.push(b), Err(Error::Canceled));
    }

    #[test]
    fn test_writers_on_two_entities_are_ordered() {
        let domain = Domain::new(DEFAULT_RANGE, Arc::new(Mutex::new(())));
        let bo = BufferObject::create(&domain, 4096).unwrap();
        let first = EntityQueue::new();
        let second = EntityQueue::new();
        assert_ne!(first.finished_context(), second.finished_context());

        let a = job_on(1, Vec::new(), alloc::vec![bo.clone()]);
        let b = job_on(2, Vec::new(), alloc::vec![bo.clone()]);
        admit(&first, &a);
        admit(&second, &b);

        let deps = b.dependencies();
        assert_eq!(deps.len(), 1);
        assert!(Arc::ptr_eq(&deps[0], a.finished().unwrap()));
        assert_eq!(deps[0].context(), first.finished_context());
        assert_eq!(bo.resv().len(), 2);
        assert_eq!(bo.resv().reserved_slots(), 0);

        // A reader on the first entity waits for the second entity's writer
        let c = job_on(3, alloc::vec![bo.clone()], Vec::new());
        admit(&first, &c);
        assert!(c
            .dependencies()
            .iter()
            .any(|dep| Arc::ptr_eq(dep, b.finished().unwrap())));

        a.finished().unwrap().signal();
        assert!(b.blocking_dependency().is_none());
        assert_eq!(bo.resv().reserved_slots(), 0);
    }
}
