//! # Completion Tokens
//!
//! Set-once fences on monotonically numbered timelines.
//!
//! A [`Fence`] belongs to exactly one timeline (its `context`) and carries a
//! sequence number that grows with every fence the timeline emits. It
//! becomes signaled exactly once; an optional error is recorded before
//! signaling and is observed by every waiter afterwards.
//!
//! Waiters either poll ([`Fence::is_signaled`]), spin
//! ([`Fence::wait`]) or register a callback that runs in the signaling
//! context ([`Fence::add_callback`]).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use spin::{Mutex, Once};

use crate::error::{Error, Result};

// =============================================================================
// CONTEXT ALLOCATION
// =============================================================================

/// Next unused fence context
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Reserve `count` consecutive fence contexts, returning the first
pub fn alloc_contexts(count: u64) -> u64 {
    NEXT_CONTEXT.fetch_add(count, Ordering::Relaxed)
}

// =============================================================================
// FENCE
// =============================================================================

const PENDING: u8 = 0;
const SIGNALED: u8 = 1;

/// Callback run once when a fence signals
pub type FenceCallback = Box<dyn FnOnce() + Send>;

/// Shared handle to a fence
pub type FenceRef = Arc<Fence>;

/// Set-once completion token
pub struct Fence {
    /// Owning timeline
    context: u64,
    /// Position on the timeline
    seqno: u64,
    /// PENDING or SIGNALED
    state: AtomicU8,
    /// Error recorded before signaling
    error: Once<Error>,
    /// Callbacks waiting for the signal
    callbacks: Mutex<Vec<FenceCallback>>,
}

impl Fence {
    /// Create a pending fence
    pub fn new(context: u64, seqno: u64) -> FenceRef {
        Arc::new(Self {
            context,
            seqno,
            state: AtomicU8::new(PENDING),
            error: Once::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Create a fence that is already signaled
    pub fn new_signaled(context: u64, seqno: u64) -> FenceRef {
        let fence = Self::new(context, seqno);
        fence.signal();
        fence
    }

    /// Owning timeline
    #[inline]
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Sequence number on the timeline
    #[inline]
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Whether the fence has signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }

    /// Whether `self` comes after `other` on the same timeline
    pub fn is_later(&self, other: &Fence) -> bool {
        self.context == other.context && self.seqno > other.seqno
    }

    /// Record an error. The first error wins; ignored once signaled.
    pub fn set_error(&self, error: Error) {
        if self.is_signaled() {
            log::warn!(
                "fence {}:{} error {} set after signal",
                self.context,
                self.seqno,
                error
            );
            return;
        }
        self.error.call_once(|| error);
    }

    /// Error recorded on this fence, if any
    pub fn error(&self) -> Option<Error> {
        self.error.get().copied()
    }

    /// `None` while pending, otherwise the outcome
    pub fn status(&self) -> Option<Result<()>> {
        if !self.is_signaled() {
            return None;
        }
        Some(self.error().map_or(Ok(()), Err))
    }

    /// Signal the fence.
    ///
    /// Returns `false` if it was already signaled, in which case nothing
    /// happens. Callbacks run in the caller's context, after the state flip
    /// and outside the callback lock.
    pub fn signal(&self) -> bool {
        let callbacks = {
            let mut callbacks = self.callbacks.lock();
            if self.state.swap(SIGNALED, Ordering::AcqRel) == SIGNALED {
                return false;
            }
            core::mem::take(&mut *callbacks)
        };

        for callback in callbacks {
            callback();
        }

        true
    }

    /// Register a callback for the signal.
    ///
    /// Returns `false` without running `callback` if the fence has already
    /// signaled.
    pub fn add_callback(&self, callback: FenceCallback) -> bool {
        let mut callbacks = self.callbacks.lock();
        if self.is_signaled() {
            return false;
        }
        callbacks.push(callback);
        true
    }

    /// Spin until signaled or `max_spins` polls have passed.
    ///
    /// `None` waits forever.
    pub fn wait(&self, max_spins: Option<u64>) -> Result<()> {
        let mut spins = 0u64;

        loop {
            if let Some(status) = self.status() {
                return status;
            }

            if max_spins.is_some_and(|max| spins >= max) {
                return Err(Error::Timeout);
            }

            core::hint::spin_loop();
            spins += 1;
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("signaled", &self.is_signaled())
            .field("error", &self.error())
            .finish()
    }
}

// =============================================================================
// TIMELINE
// =============================================================================

/// Monotonic fence emitter for one fence context
#[derive(Debug)]
pub struct Timeline {
    /// Debug name
    name: &'static str,
    /// Fence context
    context: u64,
    /// Last emitted sequence number
    seqno: AtomicU64,
}

impl Timeline {
    /// Create a timeline on a freshly allocated context
    pub fn new(name: &'static str) -> Self {
        Self::with_context(name, alloc_contexts(1))
    }

    /// Create a timeline on a context reserved with [`alloc_contexts`]
    pub fn with_context(name: &'static str, context: u64) -> Self {
        Self {
            name,
            context,
            seqno: AtomicU64::new(0),
        }
    }

    /// Debug name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fence context
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Last emitted sequence number
    pub fn last_seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    /// Emit the next fence
    pub fn create(&self) -> FenceRef {
        let seqno = self.seqno.fetch_add(1, Ordering::AcqRel) + 1;
        Fence::new(self.context, seqno)
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(Fence: Send, Sync);
static_assertions::assert_impl_all!(Timeline: Send, Sync);
