//! Incremental, dirty-bitmap driven block copy engine
//!
//! This crate copies the contents of a source block device to a target block device, one
//! cluster at a time, driven by a bitmap of clusters that still need copying.
//!
//! # Overview
//!
//! A [`BlockCopyState`] ties together a source and a target [`BlockDevice`], a
//! [`DirtyBitmap`] and the bookkeeping needed to copy from many callers at once:
//!
//! - callers mark clusters dirty through [`BlockCopyState::dirty_bitmap`]
//! - [`BlockCopyState::copy`] copies every dirty cluster of a range, splitting the work into
//!   tasks that run in parallel, and returns once the whole range is clean
//! - concurrent calls never copy the same cluster twice; a call that runs into a range
//!   claimed by another call waits for that call's task to finish
//! - a failed task puts its clusters back into the bitmap, so a later call retries them
//!
//! # Copy Methods
//!
//! Each task moves its data in one of three ways:
//!
//! 1. **Zero fill** - the source reads as zeroes, the target gets a zero write
//! 2. **Copy offload** - the devices copy the data themselves
//!    ([`BlockDevice::copy_range`]); chunks start small and grow once offload has succeeded
//! 3. **Buffered** - the data is read into memory and written back out; used when offload
//!    is unavailable or fails, after which offload stays off for the rest of the state's life
//!
//! Memory held by in-flight tasks is bounded by a shared budget, and the copy rate may be
//! limited with [`BlockCopyState::set_speed`].
//!
//! # Skipping Unallocated Data
//!
//! With [`BlockCopyState::set_skip_unallocated`] the engine only copies data allocated in
//! the source above its backing layer; the rest is cleared from the bitmap without any I/O.
//! [`BlockCopyState::reset_unallocated`] does the same for one run of clusters, which lets a
//! caller prune the bitmap before copying.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blockcopy::{BlockCopyState, CopyConfig, MemoryDevice, WriteFlags};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let source = Arc::new(MemoryDevice::new("source", 1 << 20, 64 * 1024));
//! let target = Arc::new(MemoryDevice::new("target", 1 << 20, 64 * 1024));
//! let state = BlockCopyState::new(
//!     source,
//!     target,
//!     WriteFlags::default(),
//!     CopyConfig::default(),
//! )?;
//! state.dirty_bitmap().set_all();
//! let summary = state.copy(0, 1 << 20).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod progress;
pub mod runtime;
pub mod task_pool;

mod task;

#[cfg(test)]
mod testutils;

pub use bitmap::DirtyBitmap;
pub use config::{CopyConfig, OutputConfig, RuntimeConfig};
pub use copy::{BlockCopyState, Summary};
pub use device::{
    BlockDevice, BlockStatus, FileDevice, MemoryDevice, StatusScope, WriteFlags,
};
pub use error::Error;
pub use progress::ProgressMeter;
pub use runtime::{ProgressSettings, ProgressType, run};
