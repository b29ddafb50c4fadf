//! # Jobs
//!
//! A job is an ordered task list plus the buffer objects it reads and
//! writes.
//!
//! ## Ownership
//!
//! ```text
//!            ┌──────────── JobRef (Arc<Job>) ────────────┐
//!            │                  │                        │
//!     submitter handle   scheduler (queue,        core in-flight slot
//!                        pending list)
//! ```
//!
//! The last reference to go runs `Drop`, which releases the buffer
//! objects, the task array and the tokens.
//!
//! ## Tokens
//!
//! - `scheduled`: signaled when the job is picked from its entity
//! - `finished`: signaled once the job is retired, carrying its error
//! - done token: one per dispatch attempt, signaled by the interrupt path

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rocket_core::{CoreId, DomainId, Error, FenceRef, JobId, Result};
use rocket_mem::{BufferRef, Domain};
use spin::{Mutex, Once};

use crate::task::Task;

/// Shared handle to a job
pub type JobRef = Arc<Job>;

/// Tokens created when a job is armed
#[derive(Debug, Clone)]
pub struct SchedFence {
    /// Signaled when the job leaves its entity for the run queue
    pub scheduled: FenceRef,
    /// Signaled when the job is retired
    pub finished: FenceRef,
}

// =============================================================================
// JOB
// =============================================================================

/// A submitted job
#[derive(Debug)]
pub struct Job {
    id: JobId,
    tasks: Vec<Task>,
    /// Index of the next task to dispatch
    next_task: AtomicUsize,
    in_bos: Vec<BufferRef>,
    out_bos: Vec<BufferRef>,
    domain: Arc<Domain>,
    fences: Once<SchedFence>,
    /// Owning core, fixed at arm time
    core: Once<CoreId>,
    /// Token of the latest dispatch attempt
    done_fence: Mutex<Option<FenceRef>>,
    /// Tokens that must signal before the job may run
    dependencies: Mutex<Vec<FenceRef>>,
    karma: AtomicU32,
}

impl Job {
    /// Create an unarmed job
    pub fn new(
        id: JobId,
        tasks: Vec<Task>,
        in_bos: Vec<BufferRef>,
        out_bos: Vec<BufferRef>,
        domain: Arc<Domain>,
    ) -> JobRef {
        Arc::new(Self {
            id,
            tasks,
            next_task: AtomicUsize::new(0),
            in_bos,
            out_bos,
            domain,
            fences: Once::new(),
            core: Once::new(),
            done_fence: Mutex::new(None),
            dependencies: Mutex::new(Vec::new()),
            karma: AtomicU32::new(0),
        })
    }

    /// Device-unique id
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Domain the job's buffers live in
    pub fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    /// Input buffers
    pub fn in_bos(&self) -> &[BufferRef] {
        &self.in_bos
    }

    /// Output buffers
    pub fn out_bos(&self) -> &[BufferRef] {
        &self.out_bos
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Install the job's tokens and owning core. Only the first call counts.
    pub fn arm(&self, fences: SchedFence, core: CoreId) {
        self.fences.call_once(|| fences);
        self.core.call_once(|| core);
    }

    /// Whether [`Job::arm`] ran
    pub fn is_armed(&self) -> bool {
        self.fences.is_completed()
    }

    /// Acceptance token
    pub fn scheduled(&self) -> Option<&FenceRef> {
        self.fences.get().map(|fences| &fences.scheduled)
    }

    /// Completion token seen by other jobs and the submitter
    pub fn finished(&self) -> Option<&FenceRef> {
        self.fences.get().map(|fences| &fences.finished)
    }

    /// Owning core
    pub fn core_id(&self) -> Option<CoreId> {
        self.core.get().copied()
    }

    /// Token of the latest dispatch attempt
    pub fn done_fence(&self) -> Option<FenceRef> {
        self.done_fence.lock().clone()
    }

    /// Install the token of a new dispatch attempt
    pub fn replace_done_fence(&self, fence: FenceRef) {
        *self.done_fence.lock() = Some(fence);
    }

    /// Fail an armed job that will never be queued
    pub fn abort(&self, error: Error) {
        if let Some(fences) = self.fences.get() {
            fences.scheduled.signal();
            fences.finished.set_error(error);
            fences.finished.signal();
        }
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Wait for `fence` before running.
    ///
    /// Signaled tokens are skipped; of two tokens from the same timeline
    /// only the later is kept.
    pub fn add_dependency(&self, fence: FenceRef) -> Result<()> {
        if fence.is_signaled() {
            return Ok(());
        }

        let mut deps = self.dependencies.lock();
        if let Some(existing) = deps.iter_mut().find(|dep| dep.context() == fence.context()) {
            if fence.is_later(existing) {
                *existing = fence;
            }
            return Ok(());
        }

        deps.try_reserve(1)?;
        deps.push(fence);
        Ok(())
    }

    /// Reserve a slot on every buffer in `bos` and depend on the tokens a
    /// read (or write) of them must wait for
    pub fn acquire_object_fences(&self, bos: &[BufferRef], is_write: bool) -> Result<()> {
        for bo in bos {
            bo.reserve_dependency_slot()?;
            for fence in bo.dependencies(is_write) {
                self.add_dependency(fence)?;
            }
        }
        Ok(())
    }

    /// Publish the finished token as the newest writer of every output
    pub fn attach_object_fences(&self) {
        if let Some(finished) = self.finished() {
            for bo in &self.out_bos {
                bo.add_dependency(finished.clone(), true);
            }
        }
    }

    /// Give back the slots reserved on every input and output but not used
    pub fn release_object_slots(&self) {
        for bo in self.in_bos.iter().chain(&self.out_bos) {
            bo.release_dependency_slots();
        }
    }

    /// First dependency that has not signaled yet
    pub fn blocking_dependency(&self) -> Option<FenceRef> {
        self.dependencies
            .lock()
            .iter()
            .find(|dep| !dep.is_signaled())
            .cloned()
    }

    /// Number of dependencies registered
    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    /// Snapshot of the registered dependencies
    pub fn dependencies(&self) -> Vec<FenceRef> {
        self.dependencies.lock().clone()
    }

    // =========================================================================
    // Task Cursor
    // =========================================================================

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Index of the next task to dispatch
    pub fn next_task(&self) -> usize {
        self.next_task.load(Ordering::Acquire)
    }

    /// Whether every task has been dispatched
    pub fn is_complete(&self) -> bool {
        self.next_task() >= self.task_count()
    }

    /// Take the task at the cursor and move the cursor past it.
    ///
    /// Only the owning core's dispatch path calls this, under its job lock.
    pub fn advance_task(&self) -> Option<Task> {
        let index = self.next_task();
        let task = self.tasks.get(index).copied()?;
        self.next_task.store(index + 1, Ordering::Release);
        Some(task)
    }

    // =========================================================================
    // Karma
    // =========================================================================

    /// Record involvement in a hang
    pub fn increase_karma(&self) -> u32 {
        self.karma.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Hangs this job was implicated in
    pub fn karma(&self) -> u32 {
        self.karma.load(Ordering::Acquire)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        log::trace!(
            "job {}: cleanup ({} tasks, {} in, {} out)",
            self.id,
            self.tasks.len(),
            self.in_bos.len(),
            self.out_bos.len()
        );
    }
}

static_assertions::assert_impl_all!(Job: Send, Sync);
