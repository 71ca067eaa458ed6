//! Block devices the copy engine reads from and writes to
//!
//! The engine only talks to devices through the [`BlockDevice`] trait. Two implementations
//! are provided: [`MemoryDevice`] (RAM backed, with allocation tracking, an optional backing
//! layer and fault injection) and [`FileDevice`] (a regular file or a host block device).

mod file;
mod memory;

pub use file::FileDevice;
pub use memory::{IoOp, IoRecord, MemoryDevice};

/// Allocation status of a run of bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatus {
    /// The run is allocated in the queried layer(s).
    pub allocated: bool,
    /// The run holds data.
    pub data: bool,
    /// The run reads as zeroes.
    pub zero: bool,
}

impl BlockStatus {
    /// Status assumed when the real status is unknown: allocated data that must be copied.
    pub const DATA: BlockStatus = BlockStatus {
        allocated: true,
        data: true,
        zero: false,
    };
}

/// Which layers of a device count as allocated in a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusScope {
    /// Data allocated anywhere in the device, including its backing layers.
    Chain,
    /// Only data allocated above the backing (base) layer.
    AboveBacking,
}

/// Flags applied to writes issued to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Complete the write only once it is on stable storage.
    pub fua: bool,
    /// Store the written data compressed; only whole clusters can be written this way.
    pub compressed: bool,
}

impl WriteFlags {
    #[must_use]
    pub fn without_compression(self) -> Self {
        Self {
            compressed: false,
            ..self
        }
    }
}

/// Device interface consumed by the copy engine.
///
/// Offsets and lengths are in bytes. Requests never extend past [`BlockDevice::size`].
#[async_trait::async_trait]
pub trait BlockDevice: std::fmt::Debug + Send + Sync {
    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// Largest request the device accepts, `None` if unlimited.
    fn max_transfer(&self) -> Option<u64> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any;

    /// Fills `buf` with the `buf.len()` bytes at `offset` and hands it back.
    ///
    /// Buffers are passed by value so that implementations running I/O on another thread
    /// can move them there instead of copying.
    async fn read(&self, offset: u64, buf: bytes::BytesMut) -> anyhow::Result<bytes::BytesMut>;

    async fn write(&self, offset: u64, buf: bytes::Bytes, flags: WriteFlags) -> anyhow::Result<()>;

    async fn write_zeroes(&self, offset: u64, len: u64, flags: WriteFlags) -> anyhow::Result<()>;

    /// Copies `len` bytes from this device straight to `target` without a round trip
    /// through host memory.
    async fn copy_range(
        &self,
        offset: u64,
        target: &dyn BlockDevice,
        target_offset: u64,
        len: u64,
        flags: WriteFlags,
    ) -> anyhow::Result<()> {
        let _ = (offset, target_offset, len, flags);
        Err(anyhow::anyhow!(
            "copy offload from {:?} to {:?} is not supported",
            self,
            target
        ))
    }

    /// Status of the run starting at `offset`, and the length of that run (at most `len`).
    async fn block_status(
        &self,
        offset: u64,
        len: u64,
        scope: StatusScope,
    ) -> anyhow::Result<(BlockStatus, u64)>;

    /// Whether the run starting at `offset` is allocated in this layer (ignoring backing
    /// layers), and the length of that run (at most `len`).
    async fn is_allocated(&self, offset: u64, len: u64) -> anyhow::Result<(bool, u64)>;
}
