//! # Rocket Core
//!
//! Foundational types shared by every crate of the Rocket NPU job core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      rocket-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Fences    │  │   Types     │  │     Error           │  │
//! │  │ (Timeline,  │  │ (CoreId,    │  │   Handling          │  │
//! │  │  callbacks) │  │  DmaAddr)   │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Collaborator traits (power, IRQ line, IOMMU, clock)   │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod fence;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use fence::{Fence, FenceRef, Timeline};
pub use traits::*;
pub use types::*;
