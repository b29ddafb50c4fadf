//! # Register Map
//!
//! Offsets are in bytes from the core's MMIO base.

use bitflags::bitflags;

// =============================================================================
// PC BLOCK
// =============================================================================

/// Program-counter block: task fetch, start, interrupts
pub mod pc {
    //! PC register offsets

    /// Block base
    pub const BASE: u32 = 0x0000;
    /// Start bit
    pub const OPERATION_ENABLE: u32 = BASE + 0x0008;
    /// Register-command buffer address
    pub const BASE_ADDRESS: u32 = BASE + 0x0010;
    /// Register-command pair count, minus one
    pub const REGISTER_AMOUNTS: u32 = BASE + 0x0014;
    /// Interrupt enable mask
    pub const INTERRUPT_MASK: u32 = BASE + 0x0020;
    /// Write-one-to-clear interrupt status
    pub const INTERRUPT_CLEAR: u32 = BASE + 0x0024;
    /// Masked interrupt status
    pub const INTERRUPT_STATUS: u32 = BASE + 0x0028;
    /// Unmasked interrupt status
    pub const INTERRUPT_RAW_STATUS: u32 = BASE + 0x002c;
    /// Task control
    pub const TASK_CON: u32 = BASE + 0x0030;
    /// Task descriptor DMA base
    pub const TASK_DMA_BASE_ADDR: u32 = BASE + 0x0034;
}

/// CNA block
pub mod cna {
    //! CNA register offsets

    /// Block base
    pub const BASE: u32 = 0x1000;
    /// Register-command pointer selector
    pub const S_POINTER: u32 = BASE + 0x0004;
}

/// CORE (MAC array) block
pub mod core_block {
    //! CORE register offsets

    /// Block base
    pub const BASE: u32 = 0x3000;
    /// Register-command pointer selector
    pub const S_POINTER: u32 = BASE + 0x0004;
}

// =============================================================================
// INTERRUPT BITS
// =============================================================================

bitflags! {
    /// PC interrupt status / mask / clear bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcInterrupt: u32 {
        /// CNA feature group 0 done
        const CNA_FEATURE_0 = 1 << 0;
        /// CNA feature group 1 done
        const CNA_FEATURE_1 = 1 << 1;
        /// CNA weight group 0 done
        const CNA_WEIGHT_0 = 1 << 2;
        /// CNA weight group 1 done
        const CNA_WEIGHT_1 = 1 << 3;
        /// CNA CSC group 0 done
        const CNA_CSC_0 = 1 << 4;
        /// CNA CSC group 1 done
        const CNA_CSC_1 = 1 << 5;
        /// CORE group 0 done
        const CORE_0 = 1 << 6;
        /// CORE group 1 done
        const CORE_1 = 1 << 7;
        /// DPU group 0 done
        const DPU_0 = 1 << 8;
        /// DPU group 1 done
        const DPU_1 = 1 << 9;
        /// PPU group 0 done
        const PPU_0 = 1 << 10;
        /// PPU group 1 done
        const PPU_1 = 1 << 11;
        /// DMA read error
        const DMA_READ_ERROR = 1 << 12;
        /// DMA write error
        const DMA_WRITE_ERROR = 1 << 13;

        /// Task completion: the last unit of a task is the DPU
        const DONE = Self::DPU_0.bits() | Self::DPU_1.bits();
        /// DMA faults
        const DMA_ERRORS = Self::DMA_READ_ERROR.bits() | Self::DMA_WRITE_ERROR.bits();
    }
}

/// Value written to `INTERRUPT_CLEAR` to drop every latched bit
pub const INTERRUPT_CLEAR_ALL: u32 = 0x1_ffff;

// =============================================================================
// FIELD ENCODING
// =============================================================================

/// Highest core count the `S_POINTER` core field can address
pub const MAX_CORES: usize = 16;

/// `S_POINTER` value selecting the register-command pointer of `core`.
///
/// The core index occupies bits 28..32; higher bits are dropped.
pub const fn s_pointer(core: u32) -> u32 {
    0xe | ((core & 0xf) << 28)
}

/// `REGISTER_AMOUNTS` value for a command buffer of `regcmd_count` words.
///
/// Commands are 64-bit pairs; the register holds the pair count minus one.
pub const fn register_amounts(regcmd_count: u32) -> u32 {
    regcmd_count.div_ceil(2).saturating_sub(1)
}

/// `TASK_CON` value: ping-pong enable plus task count
pub const fn task_con(pp_en: bool, task_count: u32) -> u32 {
    ((0x6 | pp_en as u32) << 12) | task_count
}
