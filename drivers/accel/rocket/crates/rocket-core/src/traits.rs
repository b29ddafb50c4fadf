//! # Rocket Collaborator Traits
//!
//! Seams to the parts of the driver the job core does not own.
//!
//! ```text
//! Core (engine)
//!    │
//!    ├── PowerDomain   runtime PM: active references, forced power cycle
//!    ├── IrqLine       interrupt line synchronization
//!    ├── IommuGroup    address-space attach/detach for the engine
//!    └── Clock         millisecond time base for job timeouts
//! ```

use crate::error::Result;
use crate::types::DomainId;

// =============================================================================
// POWER
// =============================================================================

/// Runtime power management of one engine
pub trait PowerDomain: Send + Sync {
    /// Take an active reference, powering the engine up if needed
    fn get_sync(&self) -> Result<()>;

    /// Drop an active reference and arm autosuspend
    fn put_autosuspend(&self);

    /// Drop an active reference without idling the device
    fn put_noidle(&self);

    /// Record activity for the autosuspend timer
    fn mark_last_busy(&self);

    /// Power the engine down regardless of references
    fn force_suspend(&self) -> Result<()>;

    /// Power the engine back up after [`PowerDomain::force_suspend`]
    fn force_resume(&self) -> Result<()>;
}

// =============================================================================
// INTERRUPT LINE
// =============================================================================

/// The engine's interrupt line
pub trait IrqLine: Send + Sync {
    /// Interrupt number, for logging
    fn number(&self) -> u32;

    /// Wait until no handler for this line is running.
    ///
    /// May block; never call it while holding a dispatch lock.
    fn synchronize(&self);
}

// =============================================================================
// IOMMU
// =============================================================================

/// The engine's IOMMU group
pub trait IommuGroup: Send + Sync {
    /// Route the engine's DMA through `domain`
    fn attach(&self, domain: DomainId) -> Result<()>;

    /// Detach whatever domain is attached
    fn detach(&self);
}

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;
}
