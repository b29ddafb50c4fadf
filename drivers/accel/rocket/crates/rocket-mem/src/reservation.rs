//! # Reservation Objects
//!
//! The dependency set of a buffer object: every completion token that
//! still reads or writes the buffer, tagged with its usage.
//!
//! ## Usage Ordering
//!
//! ```text
//! Write  <  Read
//! ```
//!
//! Querying with a usage returns every token whose usage is less than or
//! equal to it. A reader waits on [`Usage::Write`] tokens only; a writer
//! waits on everything ([`Usage::Read`]).
//!
//! Adding a token consumes a slot taken earlier with
//! [`Reservation::reserve_fences`], so that attaching the finished token of
//! an enqueued job can never fail.

use alloc::vec::Vec;

use rocket_core::{Error, FenceRef, Result};
use spin::Mutex;

// =============================================================================
// USAGE
// =============================================================================

/// How a token uses the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Usage {
    /// The token's job writes the buffer
    Write,
    /// The token's job only reads the buffer
    Read,
}

impl Usage {
    /// Usage to query before an access.
    ///
    /// A write must wait for readers and writers; a read only for writers.
    pub const fn rw(write: bool) -> Self {
        if write {
            Self::Read
        } else {
            Self::Write
        }
    }
}

// =============================================================================
// RESERVATION
// =============================================================================

#[derive(Debug)]
struct Entry {
    fence: FenceRef,
    usage: Usage,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    /// Slots reserved and not yet consumed
    reserved: usize,
}

/// Dependency set of one buffer object
#[derive(Debug, Default)]
pub struct Reservation {
    inner: Mutex<Inner>,
}

impl Reservation {
    /// Create an empty reservation
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for `count` more tokens.
    ///
    /// Signaled tokens are pruned first. Fails with `ResourceFault` if the
    /// set cannot grow.
    pub fn reserve_fences(&self, count: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|entry| !entry.fence.is_signaled());

        let wanted = inner.reserved + count;
        inner
            .entries
            .try_reserve(wanted)
            .map_err(|_| Error::ResourceFault)?;
        inner.reserved = wanted;

        Ok(())
    }

    /// Add a token, consuming one reserved slot whether it is pushed or
    /// replaces an older one.
    ///
    /// An existing token is replaced when it is already signaled, or when it
    /// comes from the same timeline, is not newer than `fence`, and was added
    /// with a usage at least as weak as `usage`.
    pub fn add_fence(&self, fence: FenceRef, usage: Usage) {
        let mut inner = self.inner.lock();

        let replace = inner.entries.iter().position(|old| {
            old.fence.is_signaled()
                || (old.fence.context() == fence.context()
                    && old.usage >= usage
                    && !old.fence.is_later(&fence))
        });

        if inner.reserved == 0 {
            log::warn!(
                "reservation: fence {}:{} added without a reserved slot",
                fence.context(),
                fence.seqno()
            );
        }
        inner.reserved = inner.reserved.saturating_sub(1);

        let entry = Entry { fence, usage };
        match replace {
            Some(index) => inner.entries[index] = entry,
            None => inner.entries.push(entry),
        }
    }

    /// Give back every slot reserved but never consumed
    pub fn release_unused(&self) {
        self.inner.lock().reserved = 0;
    }

    /// Slots reserved and not yet consumed
    pub fn reserved_slots(&self) -> usize {
        self.inner.lock().reserved
    }

    /// Every token with usage up to `usage`, signaled or not
    pub fn fences(&self, usage: Usage) -> Vec<FenceRef> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.usage <= usage)
            .map(|entry| entry.fence.clone())
            .collect()
    }

    /// Whether every token with usage up to `usage` has signaled
    pub fn test_signaled(&self, usage: Usage) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.usage <= usage)
            .all(|entry| entry.fence.is_signaled())
    }

    /// Spin until every token with usage up to `usage` has signaled.
    ///
    /// The budget is shared across tokens. Token errors do not fail the
    /// wait.
    pub fn wait(&self, usage: Usage, max_spins: u64) -> Result<()> {
        let mut remaining = max_spins;

        for fence in self.fences(usage) {
            while !fence.is_signaled() {
                if remaining == 0 {
                    return Err(Error::Timeout);
                }
                remaining -= 1;
                core::hint::spin_loop();
            }
        }

        Ok(())
    }

    /// Number of tokens held
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no token is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static_assertions::assert_impl_all!(Reservation: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use rocket_core::{Fence, Timeline};

    #[test]
    fn test_usage_rw() {
        assert_eq!(Usage::rw(true), Usage::Read);
        assert_eq!(Usage::rw(false), Usage::Write);
        assert!(Usage::Write < Usage::Read);
    }

    #[test]
    fn test_readers_wait_on_writers_only() {
        let resv = Reservation::new();
        let w = Fence::new(100, 1);
        let r = Fence::new(101, 1);
        resv.reserve_fences(2).unwrap();
        resv.add_fence(w.clone(), Usage::Write);
        resv.add_fence(r.clone(), Usage::Read);

        let for_read = resv.fences(Usage::rw(false));
        assert_eq!(for_read.len(), 1);
        assert_eq!(for_read[0].context(), 100);

        assert_eq!(resv.fences(Usage::rw(true)).len(), 2);
    }

    #[test]
    fn test_same_timeline_replaced() {
        let timeline = Timeline::new("resv");
        let resv = Reservation::new();
        let a = timeline.create();
        let b = timeline.create();

        resv.reserve_fences(2).unwrap();
        resv.add_fence(a, Usage::Write);
        resv.add_fence(b.clone(), Usage::Write);

        let held = resv.fences(Usage::Read);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].seqno(), b.seqno());
    }

    #[test]
    fn test_write_not_replaced_by_read() {
        let timeline = Timeline::new("resv");
        let resv = Reservation::new();
        resv.reserve_fences(2).unwrap();
        resv.add_fence(timeline.create(), Usage::Write);
        resv.add_fence(timeline.create(), Usage::Read);

        assert_eq!(resv.len(), 2);
        assert_eq!(resv.fences(Usage::Write).len(), 1);
    }

    #[test]
    fn test_reserve_prunes_signaled() {
        let resv = Reservation::new();
        resv.reserve_fences(2).unwrap();
        resv.add_fence(Fence::new(7, 1), Usage::Read);
        let done = Fence::new(8, 1);
        resv.add_fence(done.clone(), Usage::Write);
        done.signal();

        resv.reserve_fences(1).unwrap();
        assert_eq!(resv.len(), 1);
    }

    #[test]
    fn test_wait_and_test_signaled() {
        let resv = Reservation::new();
        let fence = Fence::new(9, 1);
        resv.reserve_fences(1).unwrap();
        resv.add_fence(fence.clone(), Usage::Write);

        assert!(!resv.test_signaled(Usage::Read));
        assert_eq!(resv.wait(Usage::Read, 4), Err(Error::Timeout));
        assert!(!resv.test_signaled(Usage::Write));

        fence.set_error(Error::HangDetected);
        fence.signal();
        assert!(resv.test_signaled(Usage::Read));
        assert_eq!(resv.wait(Usage::Read, 0), Ok(()));
    }

    #[test]
    fn test_replace_consumes_slot() {
        let timeline = Timeline::new("resv");
        let resv = Reservation::new();

        for _ in 0..10_000 {
            resv.reserve_fences(1).unwrap();
            resv.add_fence(timeline.create(), Usage::Write);
            assert_eq!(resv.reserved_slots(), 0);
        }
        assert_eq!(resv.len(), 1);
    }

    #[test]
    fn test_release_unused_slots() {
        let resv = Reservation::new();
        for _ in 0..10_000 {
            resv.reserve_fences(1).unwrap();
            resv.release_unused();
        }
        assert_eq!(resv.reserved_slots(), 0);

        resv.reserve_fences(3).unwrap();
        resv.add_fence(Fence::new(11, 1), Usage::Read);
        assert_eq!(resv.reserved_slots(), 2);
        resv.release_unused();
        assert_eq!(resv.reserved_slots(), 0);
        assert_eq!(resv.len(), 1);
    }
}
