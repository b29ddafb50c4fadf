//! # IOVA Domains
//!
//! Per-client NPU address spaces.
//!
//! Each client owns one [`Domain`]; the engine is attached to it for the
//! duration of a job. Mapping and unmapping are serialized device-wide by a
//! shared [`MapLock`], independent of every scheduling lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use rocket_core::{DmaAddr, DomainId, Error, Result};
use spin::Mutex;

/// Device-wide lock serializing IOVA map/unmap
pub type MapLock = Arc<Mutex<()>>;

/// Mapping granule
pub const PAGE_SIZE: u64 = 4096;

/// Default client address space. The null page region stays unmapped.
pub const DEFAULT_RANGE: IovaRange = IovaRange {
    start: DmaAddr::new(0x0010_0000),
    end: DmaAddr::new(0x1_0000_0000),
};

static NEXT_DOMAIN: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// IOVA RANGE
// =============================================================================

/// A range of NPU virtual addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRange {
    /// Start address
    pub start: DmaAddr,
    /// End address (exclusive)
    pub end: DmaAddr,
}

impl IovaRange {
    /// Create a range of `size` bytes at `start`
    pub const fn new(start: DmaAddr, size: u64) -> Self {
        Self {
            start,
            end: DmaAddr::new(start.raw() + size),
        }
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.end.raw() - self.start.raw()
    }

    /// Check if address is in range
    pub fn contains(&self, addr: DmaAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct IovaBlock {
    range: IovaRange,
    free: bool,
}

// =============================================================================
// DOMAIN
// =============================================================================

/// One client's NPU address space
#[derive(Debug)]
pub struct Domain {
    id: DomainId,
    range: IovaRange,
    map_lock: MapLock,
    blocks: Mutex<Vec<IovaBlock>>,
}

impl Domain {
    /// Create a domain over `range`
    pub fn new(range: IovaRange, map_lock: MapLock) -> Arc<Self> {
        Arc::new(Self {
            id: DomainId(NEXT_DOMAIN.fetch_add(1, Ordering::Relaxed)),
            range,
            map_lock,
            blocks: Mutex::new(alloc::vec![IovaBlock { range, free: true }]),
        })
    }

    /// Domain identity, as handed to the IOMMU group
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Managed range
    pub fn range(&self) -> IovaRange {
        self.range
    }

    /// Map `size` bytes, page aligned.
    ///
    /// The mapped size may be larger than requested.
    pub fn map(&self, size: u64) -> Result<IovaRange> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = size
            .checked_add(PAGE_SIZE - 1)
            .ok_or(Error::InvalidArgument)?
            & !(PAGE_SIZE - 1);

        let _guard = self.map_lock.lock();
        let mut blocks = self.blocks.lock();

        let (index, range) = blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.free)
            .find_map(|(index, block)| {
                let start = block.range.start.align_up(PAGE_SIZE);
                let end = start.raw().checked_add(size)?;
                (end <= block.range.end.raw()).then_some((index, IovaRange::new(start, size)))
            })
            .ok_or(Error::NoMemory)?;

        blocks.try_reserve(2)?;
        Self::split_block(&mut blocks, index, range);

        Ok(range)
    }

    fn split_block(blocks: &mut Vec<IovaBlock>, index: usize, used: IovaRange) {
        let block = blocks.remove(index);
        let mut at = index;

        if used.start > block.range.start {
            blocks.insert(at, IovaBlock {
                range: IovaRange {
                    start: block.range.start,
                    end: used.start,
                },
                free: true,
            });
            at += 1;
        }

        blocks.insert(at, IovaBlock {
            range: used,
            free: false,
        });

        if used.end < block.range.end {
            blocks.insert(at + 1, IovaBlock {
                range: IovaRange {
                    start: used.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Unmap a range returned by [`Domain::map`]
    pub fn unmap(&self, range: IovaRange) -> Result<()> {
        let _guard = self.map_lock.lock();
        let mut blocks = self.blocks.lock();

        let index = blocks
            .iter()
            .position(|block| block.range == range && !block.free)
            .ok_or(Error::NotFound)?;
        blocks[index].free = true;

        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].free && blocks[i + 1].free {
                blocks[i].range.end = blocks[i + 1].range.end;
                blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }

        Ok(())
    }

    /// Bytes currently mapped
    pub fn mapped_bytes(&self) -> u64 {
        self.blocks
            .lock()
            .iter()
            .filter(|block| !block.free)
            .map(|block| block.range.size())
            .sum()
    }
}
