//! # Memory-Mapped I/O Operations
//!
//! Register access for one NPU core.

use rocket_core::{Error, Result};

// =============================================================================
// REGISTER ACCESS TRAIT
// =============================================================================

/// 32-bit register access to one core's MMIO window
///
/// Writes take `&self`: MMIO has no Rust-visible state to protect, and the
/// dispatch lock, not the accessor, serializes task programming.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register
    fn read32(&self, offset: u32) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: u32, value: u32);

    /// Poll until `(reg & mask) == expected`, giving up after `max_polls`
    fn poll32(&self, offset: u32, mask: u32, expected: u32, max_polls: u64) -> Result<()> {
        for _ in 0..max_polls {
            if self.read32(offset) & mask == expected {
                return Ok(());
            }
            core::hint::spin_loop();
        }

        Err(Error::Timeout)
    }
}

// =============================================================================
// MMIO REGION
// =============================================================================

/// A mapped MMIO window
#[derive(Debug)]
pub struct MmioRegion {
    /// Virtual address of the window
    base: usize,
    /// Window size in bytes
    size: u32,
}

impl MmioRegion {
    /// Wrap a mapped register window
    ///
    /// # Safety
    /// - `base` must map `size` bytes of device registers for the lifetime
    ///   of the region
    /// - `base` must be 4-byte aligned
    pub unsafe fn new(base: *mut u8, size: u32) -> Self {
        Self {
            base: base as usize,
            size,
        }
    }

    /// Window size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    fn reg_ptr(&self, offset: u32) -> *mut u32 {
        debug_assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
        debug_assert!(offset + 4 <= self.size, "register offset {offset:#x} out of window");
        (self.base + offset as usize) as *mut u32
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: constructor contract maps the whole window; offset is
        // bounds- and alignment-checked in debug builds
        let value = unsafe { core::ptr::read_volatile(self.reg_ptr(offset)) };
        fence::mmio_read_barrier();
        value
    }

    fn write32(&self, offset: u32, value: u32) {
        fence::mmio_write_barrier();
        // SAFETY: see read32
        unsafe { core::ptr::write_volatile(self.reg_ptr(offset), value) }
    }
}

// SAFETY: MMIO windows are shared device memory; all accesses are volatile
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

// =============================================================================
// MEMORY FENCE OPERATIONS
// =============================================================================

/// Memory barrier types for MMIO
pub mod fence {
    //! Memory barrier operations

    /// Compiler fence (prevents reordering)
    #[inline(always)]
    pub fn compiler() {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Memory barrier before MMIO write
    #[inline(always)]
    pub fn mmio_write_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb st", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        compiler();
    }

    /// Memory barrier after MMIO read
    #[inline(always)]
    pub fn mmio_read_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb ld", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        compiler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_mmio_region_roundtrip_on_ram() {
        let mut backing = vec![0u32; 16];
        // SAFETY: backing outlives the region and is u32-aligned
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr().cast(), 64) };

        region.write32(0x8, 0xdead_beef);
        assert_eq!(region.read32(0x8), 0xdead_beef);
        assert_eq!(region.read32(0x4), 0);
        drop(region);
        assert_eq!(backing[2], 0xdead_beef);
    }

    #[test]
    fn test_poll_times_out() {
        let mut backing = vec![0u32; 4];
        // SAFETY: as above
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr().cast(), 16) };

        assert_eq!(region.poll32(0x0, 0x1, 0x1, 8), Err(Error::Timeout));
        region.write32(0x0, 0x1);
        assert_eq!(region.poll32(0x0, 0x1, 0x1, 8), Ok(()));
    }
}
