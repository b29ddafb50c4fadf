//! # Rocket Accel
//!
//! Job execution core of the Rockchip NPU ("rocket") driver.
//!
//! ## Architecture
//!
//! ```text
//! Client ──submit──► EntityQueue ──► Scheduler (per core) ──► Core
//!                    (FIFO, fences)   (credit 1, pending,      │ dispatch
//!                                      timeouts)               ▼
//!                                                           hardware
//!                                                              │ irq
//!   finished token ◄── retire ◄── done token ◄── irq thread ◄──┘
//!                                                              │ timeout
//!                                            Reset controller ◄┘
//! ```
//!
//! ## Locks
//!
//! | Lock                 | Scope   | Protects                                  |
//! |----------------------|---------|-------------------------------------------|
//! | `Device::sched_lock` | device  | arm + dependency registration + push      |
//! | `Core::job_lock`     | core    | in-flight job, task programming           |
//! | run queue lock       | core    | entities, pending list                    |
//! | `MapLock`            | device  | IOVA map/unmap                            |

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

pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod irq;
pub mod job;
pub mod reset;
pub mod sched;
pub mod task;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::{DeviceConfig, ResetMode, SchedConfig};
pub use device::{BoInfo, Client, Device, JobDesc, SubmitDesc};
pub use engine::{Core, CoreResources};
pub use entity::EntityQueue;
pub use irq::IrqReturn;
pub use job::{Job, JobRef, SchedFence};
pub use reset::ResetPhase;
pub use sched::{SchedBackend, SchedStat, Scheduler};
pub use task::{Task, TaskDesc};
