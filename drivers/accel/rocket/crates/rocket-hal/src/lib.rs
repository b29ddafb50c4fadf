//! # Rocket HAL
//!
//! Register-level access to one Rocket NPU core.
//!
//! ## Register Blocks
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ 0x0000  PC    program counter / task control │
//! │ 0x1000  CNA   convolution native accelerator │
//! │ 0x3000  CORE  MAC array                      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The job core only drives the PC block (task programming, interrupts)
//! and the `S_POINTER` registers of CNA and CORE.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod mmio;
pub mod registers;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports
pub use mmio::{MmioRegion, RegisterIo};
pub use registers::PcInterrupt;
