//! # Tasks
//!
//! One hardware-executable register-command range of a job.

use alloc::vec::Vec;

use rocket_core::{DmaAddr, Error, Result};

/// Task as passed in by the submitter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TaskDesc {
    /// NPU address of the register-command buffer
    pub regcmd: u64,
    /// Number of 32-bit command words
    pub regcmd_count: u32,
    /// Must be zero
    pub reserved: u32,
}

static_assertions::assert_eq_size!(TaskDesc, [u64; 2]);

/// Validated, immutable task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    regcmd: DmaAddr,
    regcmd_count: u32,
}

impl Task {
    /// Register-command buffer address
    #[inline]
    pub fn regcmd(&self) -> DmaAddr {
        self.regcmd
    }

    /// Command word count, never zero
    #[inline]
    pub fn regcmd_count(&self) -> u32 {
        self.regcmd_count
    }
}

/// Validate and copy a task list.
///
/// An empty list, a zero command count or a non-zero reserved field is
/// `InvalidArgument`.
pub fn copy_tasks(descs: &[TaskDesc]) -> Result<Vec<Task>> {
    if descs.is_empty() {
        log::debug!("job: no tasks");
        return Err(Error::InvalidArgument);
    }

    let mut tasks = Vec::new();
    tasks.try_reserve_exact(descs.len()).map_err(|err| {
        log::debug!("job: failed to allocate task array");
        Error::from(err)
    })?;

    for desc in descs {
        if desc.reserved != 0 {
            log::debug!("job: reserved field in task should be 0");
            return Err(Error::InvalidArgument);
        }
        if desc.regcmd_count == 0 {
            log::debug!("job: task at {:#x} has no command words", desc.regcmd);
            return Err(Error::InvalidArgument);
        }

        tasks.push(Task {
            regcmd: DmaAddr::new(desc.regcmd),
            regcmd_count: desc.regcmd_count,
        });
    }

    Ok(tasks)
}
