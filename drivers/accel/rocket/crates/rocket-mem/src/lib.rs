//! # Rocket Memory
//!
//! Buffer objects shared between clients and the NPU.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       rocket-mem                            │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Buffer Object                      │    │
//! │  │   (IOVA mapping + reservation + CPU access state)   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │              │                            │                 │
//! │  ┌───────────┴───────────┐   ┌────────────┴────────────┐    │
//! │  │      IOVA Domain      │   │      Reservation        │    │
//! │  │  (per-client address  │   │  (read/write completion │    │
//! │  │   space, map lock)    │   │   token set)            │    │
//! │  └───────────────────────┘   └─────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bo;
pub mod domain;
pub mod reservation;

// Re-exports
pub use bo::{BufferObject, BufferRef, PrepOp};
pub use domain::{Domain, IovaRange, MapLock};
pub use reservation::{Reservation, Usage};
