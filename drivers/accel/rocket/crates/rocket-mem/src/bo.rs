//! # Buffer Objects
//!
//! Client memory mapped into the client's IOVA domain, with the
//! reservation that orders jobs reading and writing it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use rocket_core::{DmaAddr, DomainId, Error, FenceRef, Result};

use crate::domain::{Domain, IovaRange};
use crate::reservation::{Reservation, Usage};

bitflags! {
    /// CPU access requested by `prep`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrepOp: u32 {
        /// CPU will read the buffer
        const READ = 1 << 0;
        /// CPU will write the buffer
        const WRITE = 1 << 1;
    }
}

/// Shared handle to a buffer object
pub type BufferRef = Arc<BufferObject>;

/// A mapped buffer object
#[derive(Debug)]
pub struct BufferObject {
    domain: Arc<Domain>,
    iova: IovaRange,
    resv: Reservation,
    /// `PrepOp` bits of the last CPU prep, 0 when the CPU does not own it
    last_prep: AtomicU32,
}

impl BufferObject {
    /// Allocate and map a buffer of at least `size` bytes into `domain`
    pub fn create(domain: &Arc<Domain>, size: u64) -> Result<BufferRef> {
        let iova = domain.map(size).inspect_err(|err| {
            log::error!("bo: failed to map buffer: request_size={} ({})", size, err);
        })?;

        Ok(Arc::new(Self {
            domain: domain.clone(),
            iova,
            resv: Reservation::new(),
            last_prep: AtomicU32::new(0),
        }))
    }

    /// NPU address of the first byte
    pub fn dma_addr(&self) -> DmaAddr {
        self.iova.start
    }

    /// Mapped size, page aligned
    pub fn size(&self) -> u64 {
        self.iova.size()
    }

    /// Domain the buffer is mapped into
    pub fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    /// Dependency set
    pub fn resv(&self) -> &Reservation {
        &self.resv
    }

    // =========================================================================
    // Job Dependencies
    // =========================================================================

    /// Make room for one more completion token
    pub fn reserve_dependency_slot(&self) -> Result<()> {
        self.resv.reserve_fences(1)
    }

    /// Drop slots reserved by an access that added no token
    pub fn release_dependency_slots(&self) {
        self.resv.release_unused();
    }

    /// Record `fence` as a pending reader or writer
    pub fn add_dependency(&self, fence: FenceRef, is_write: bool) {
        let usage = if is_write { Usage::Write } else { Usage::Read };
        self.resv.add_fence(fence, usage);
    }

    /// Tokens an access must wait for: writers for a read, everything for a
    /// write
    pub fn dependencies(&self, is_write: bool) -> Vec<FenceRef> {
        self.resv.fences(Usage::rw(is_write))
    }

    // =========================================================================
    // CPU Access
    // =========================================================================

    /// Wait until the CPU may access the buffer for `op`.
    ///
    /// A zero budget only polls and fails with `Busy`; an exhausted budget
    /// fails with `Timeout`. The access is recorded either way.
    pub fn prep(&self, op: u32, max_spins: u64) -> Result<()> {
        let op = PrepOp::from_bits(op).ok_or(Error::InvalidArgument)?;
        let usage = Usage::rw(op.contains(PrepOp::WRITE));

        let ret = if max_spins == 0 {
            if self.resv.test_signaled(usage) {
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.resv.wait(usage, max_spins)
        };

        self.last_prep.store(op.bits(), Ordering::Release);
        ret
    }

    /// End CPU access started by [`BufferObject::prep`]
    pub fn fini(&self) {
        if self.last_prep.swap(0, Ordering::AcqRel) == 0 {
            log::warn!("bo: fini at {} without prior prep", self.iova.start);
        }
    }

    /// CPU access currently held
    pub fn cpu_access(&self) -> PrepOp {
        PrepOp::from_bits_truncate(self.last_prep.load(Ordering::Acquire))
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if let Err(err) = self.domain.unmap(self.iova) {
            log::error!("bo: unmap of {} failed: {}", self.iova.start, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DEFAULT_RANGE;
    use rocket_core::Fence;
    use spin::Mutex;

    fn domain() -> Arc<Domain> {
        Domain::new(DEFAULT_RANGE, Arc::new(Mutex::new(())))
    }

    #[test]
    fn test_create_maps_and_drop_unmaps() {
        let domain = domain();
        let bo = BufferObject::create(&domain, 5000).unwrap();
        assert_eq!(bo.size(), 8192);
        assert_eq!(bo.domain_id(), domain.id());
        assert!(!bo.dma_addr().is_null());
        assert_eq!(domain.mapped_bytes(), 8192);

        drop(bo);
        assert_eq!(domain.mapped_bytes(), 0);
    }

    #[test]
    fn test_write_after_write_dependency() {
        let bo = BufferObject::create(&domain(), 4096).unwrap();
        let a = Fence::new(50, 1);

        bo.reserve_dependency_slot().unwrap();
        bo.add_dependency(a.clone(), true);

        let deps = bo.dependencies(true);
        assert_eq!(deps.len(), 1);
        assert!(Arc::ptr_eq(&deps[0], &a));
        assert_eq!(bo.dependencies(false).len(), 1);
    }

    #[test]
    fn test_read_does_not_wait_on_readers() {
        let bo = BufferObject::create(&domain(), 4096).unwrap();
        bo.reserve_dependency_slot().unwrap();
        bo.add_dependency(Fence::new(51, 1), false);

        assert!(bo.dependencies(false).is_empty());
        assert_eq!(bo.dependencies(true).len(), 1);
    }

    #[test]
    fn test_prep_busy_and_timeout() {
        let bo = BufferObject::create(&domain(), 4096).unwrap();
        let writer = Fence::new(52, 1);
        bo.reserve_dependency_slot().unwrap();
        bo.add_dependency(writer.clone(), true);

        assert_eq!(bo.prep(PrepOp::READ.bits(), 0), Err(Error::Busy));
        assert_eq!(bo.prep(PrepOp::READ.bits(), 8), Err(Error::Timeout));

        writer.signal();
        assert_eq!(bo.prep(PrepOp::READ.bits(), 0), Ok(()));
        assert_eq!(bo.cpu_access(), PrepOp::READ);
        bo.fini();
        assert!(bo.cpu_access().is_empty());
    }

    #[test]
    fn test_prep_rejects_unknown_op() {
        let bo = BufferObject::create(&domain(), 4096).unwrap();
        assert_eq!(bo.prep(0x4, 0), Err(Error::InvalidArgument));
    }
}
