use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};

use super::{BlockDevice, BlockStatus, StatusScope, WriteFlags};

/// Kind of request issued to a [`MemoryDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    Read,
    Write,
    WriteZeroes,
    CopyRange,
    BlockStatus,
    IsAllocated,
}

/// Successfully completed request, as recorded in the device's I/O log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRecord {
    pub op: IoOp,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    Unallocated,
    Data,
    Zero,
}

#[derive(Debug)]
struct Fault {
    op: IoOp,
    offset: u64,
    remaining: u32,
}

#[derive(Debug)]
struct Inner {
    data: Vec<u8>,
    allocation: Vec<Allocation>,
    faults: Vec<Fault>,
    log: Vec<IoRecord>,
}

/// RAM backed block device.
///
/// Tracks allocation per `granularity` sized cluster: clusters start unallocated (reading
/// through to the backing device if there is one, zeroes otherwise) and become allocated
/// when written. Faults can be injected per request kind and offset, and every completed
/// request is recorded in an I/O log.
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    granularity: u64,
    backing: Option<Arc<MemoryDevice>>,
    max_transfer: Option<u64>,
    copy_range: AtomicBool,
    latency_us: AtomicU64,
    inner: parking_lot::Mutex<Inner>,
}

impl MemoryDevice {
    /// # Panics
    ///
    /// Panics if `granularity` is not a power of two.
    #[must_use]
    pub fn new(name: &str, size: u64, granularity: u64) -> Self {
        assert!(granularity.is_power_of_two());
        let clusters = size.div_ceil(granularity) as usize;
        Self {
            name: name.to_string(),
            granularity,
            backing: None,
            max_transfer: None,
            copy_range: AtomicBool::new(true),
            latency_us: AtomicU64::new(0),
            inner: parking_lot::Mutex::new(Inner {
                data: vec![0; size as usize],
                allocation: vec![Allocation::Unallocated; clusters],
                faults: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Reads of unallocated clusters fall through to `backing`.
    ///
    /// # Panics
    ///
    /// Panics if `backing` differs in size or granularity.
    #[must_use]
    pub fn with_backing(mut self, backing: Arc<MemoryDevice>) -> Self {
        assert_eq!(backing.size(), self.size());
        assert_eq!(backing.granularity, self.granularity);
        self.backing = Some(backing);
        self
    }

    #[must_use]
    pub fn with_max_transfer(mut self, max_transfer: u64) -> Self {
        self.max_transfer = Some(max_transfer);
        self
    }

    pub fn set_copy_range_supported(&self, supported: bool) {
        self.copy_range.store(supported, Ordering::Release);
    }

    /// Delays every request by `latency`.
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Release);
    }

    /// Makes the next `times` requests of kind `op` covering `offset` fail.
    pub fn inject_fault(&self, op: IoOp, offset: u64, times: u32) {
        self.inner.lock().faults.push(Fault {
            op,
            offset,
            remaining: times,
        });
    }

    /// Stores `data` at `offset` and marks the touched clusters allocated, bypassing the I/O log.
    pub fn fill(&self, offset: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        self.store(&mut inner, offset, data);
    }

    /// Marks the clusters in `[offset, offset + len)` allocated as zeroes, bypassing the I/O log.
    pub fn fill_zeroes(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        self.store_zeroes(&mut inner, offset, len);
    }

    /// Everything a read of the whole device would return.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        let mut buf = vec![0; self.size() as usize];
        self.read_chain(0, &mut buf);
        buf
    }

    #[must_use]
    pub fn io_log(&self) -> Vec<IoRecord> {
        self.inner.lock().log.clone()
    }

    pub fn clear_io_log(&self) {
        self.inner.lock().log.clear();
    }

    fn cluster_span(&self, offset: u64, len: u64) -> std::ops::Range<usize> {
        if len == 0 {
            return 0..0;
        }
        (offset / self.granularity) as usize..(offset + len).div_ceil(self.granularity) as usize
    }

    fn check(&self, inner: &mut Inner, op: IoOp, offset: u64, len: u64) -> anyhow::Result<()> {
        if offset.saturating_add(len) > self.size() {
            bail!(
                "{}: request at {} of {} bytes is past the end of the device ({} bytes)",
                self.name,
                offset,
                len,
                self.size()
            );
        }
        let hit = inner.faults.iter().position(|fault| {
            fault.op == op
                && fault.remaining > 0
                && fault.offset >= offset
                && (fault.offset < offset + len || (len == 0 && fault.offset == offset))
        });
        if let Some(index) = hit {
            let fault = &mut inner.faults[index];
            fault.remaining -= 1;
            let fault_offset = fault.offset;
            if fault.remaining == 0 {
                inner.faults.remove(index);
            }
            return Err(anyhow!(std::io::Error::other(format!(
                "{}: injected {:?} error at offset {}",
                self.name, op, fault_offset
            ))));
        }
        Ok(())
    }

    fn log(inner: &mut Inner, op: IoOp, offset: u64, len: u64) {
        inner.log.push(IoRecord { op, offset, len });
    }

    async fn delay(&self) {
        let latency = self.latency_us.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_micros(latency)).await;
        }
    }

    fn read_chain(&self, offset: u64, buf: &mut [u8]) {
        let inner = self.inner.lock();
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        while pos < end {
            let cluster = pos / self.granularity;
            let segment_end = ((cluster + 1) * self.granularity).min(end);
            let range = (pos - offset) as usize..(segment_end - offset) as usize;
            match (inner.allocation[cluster as usize], &self.backing) {
                (Allocation::Unallocated, Some(backing)) => {
                    backing.read_chain(pos, &mut buf[range]);
                }
                (Allocation::Unallocated, None) => buf[range].fill(0),
                _ => buf[range].copy_from_slice(&inner.data[pos as usize..segment_end as usize]),
            }
            pos = segment_end;
        }
    }

    /// Pulls the backing contents of `cluster` into this layer before it is partially overwritten.
    fn allocate_cluster(&self, inner: &mut Inner, cluster: usize) {
        if inner.allocation[cluster] != Allocation::Unallocated {
            return;
        }
        if let Some(backing) = &self.backing {
            let start = cluster as u64 * self.granularity;
            let end = (start + self.granularity).min(self.size());
            backing.read_chain(start, &mut inner.data[start as usize..end as usize]);
        }
        inner.allocation[cluster] = Allocation::Data;
    }

    fn store(&self, inner: &mut Inner, offset: u64, data: &[u8]) {
        for cluster in self.cluster_span(offset, data.len() as u64) {
            self.allocate_cluster(inner, cluster);
            inner.allocation[cluster] = Allocation::Data;
        }
        let start = offset as usize;
        inner.data[start..start + data.len()].copy_from_slice(data);
    }

    fn store_zeroes(&self, inner: &mut Inner, offset: u64, len: u64) {
        let end = offset + len;
        for cluster in self.cluster_span(offset, len) {
            let cluster_start = cluster as u64 * self.granularity;
            let cluster_end = (cluster_start + self.granularity).min(self.size());
            if offset <= cluster_start && cluster_end <= end {
                inner.allocation[cluster] = Allocation::Zero;
            } else {
                self.allocate_cluster(inner, cluster);
            }
        }
        inner.data[offset as usize..end as usize].fill(0);
    }

    fn status_of(&self, inner: &Inner, cluster: usize, scope: StatusScope) -> BlockStatus {
        match inner.allocation[cluster] {
            Allocation::Data => BlockStatus::DATA,
            Allocation::Zero => BlockStatus {
                allocated: true,
                data: false,
                zero: true,
            },
            Allocation::Unallocated => match (scope, &self.backing) {
                (StatusScope::Chain, Some(backing)) => {
                    let backing_inner = backing.inner.lock();
                    backing.status_of(&backing_inner, cluster, StatusScope::Chain)
                }
                (StatusScope::Chain, None) => BlockStatus {
                    allocated: false,
                    data: false,
                    zero: true,
                },
                (StatusScope::AboveBacking, _) => BlockStatus::default(),
            },
        }
    }

    /// Length of the run starting at `offset` (bounded by `len`) whose clusters all map to the same value.
    fn run_length<T: PartialEq>(
        &self,
        offset: u64,
        len: u64,
        value_of: impl Fn(usize) -> T,
    ) -> (T, u64) {
        let end = offset.saturating_add(len).min(self.size());
        let first = (offset / self.granularity) as usize;
        let value = value_of(first);
        let mut next = first + 1;
        while (next as u64) * self.granularity < end && value_of(next) == value {
            next += 1;
        }
        let run_end = (next as u64 * self.granularity).min(end);
        (value, run_end - offset)
    }
}

#[async_trait::async_trait]
impl BlockDevice for MemoryDevice {
    fn size(&self) -> u64 {
        self.inner.lock().data.len() as u64
    }

    fn max_transfer(&self) -> Option<u64> {
        self.max_transfer
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn read(&self, offset: u64, mut buf: BytesMut) -> anyhow::Result<BytesMut> {
        self.delay().await;
        {
            let mut inner = self.inner.lock();
            self.check(&mut inner, IoOp::Read, offset, buf.len() as u64)?;
            Self::log(&mut inner, IoOp::Read, offset, buf.len() as u64);
        }
        self.read_chain(offset, &mut buf);
        Ok(buf)
    }

    async fn write(&self, offset: u64, buf: Bytes, _flags: WriteFlags) -> anyhow::Result<()> {
        self.delay().await;
        let mut inner = self.inner.lock();
        self.check(&mut inner, IoOp::Write, offset, buf.len() as u64)?;
        self.store(&mut inner, offset, &buf);
        Self::log(&mut inner, IoOp::Write, offset, buf.len() as u64);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, len: u64, _flags: WriteFlags) -> anyhow::Result<()> {
        self.delay().await;
        let mut inner = self.inner.lock();
        self.check(&mut inner, IoOp::WriteZeroes, offset, len)?;
        self.store_zeroes(&mut inner, offset, len);
        Self::log(&mut inner, IoOp::WriteZeroes, offset, len);
        Ok(())
    }

    async fn copy_range(
        &self,
        offset: u64,
        target: &dyn BlockDevice,
        target_offset: u64,
        len: u64,
        _flags: WriteFlags,
    ) -> anyhow::Result<()> {
        self.delay().await;
        let Some(target) = target.as_any().downcast_ref::<MemoryDevice>() else {
            bail!("{}: copy offload to {:?} is not supported", self.name, target);
        };
        if !self.copy_range.load(Ordering::Acquire) || !target.copy_range.load(Ordering::Acquire)
        {
            bail!(
                "{}: copy offload to {} is not supported",
                self.name,
                target.name
            );
        }
        {
            let mut inner = self.inner.lock();
            self.check(&mut inner, IoOp::CopyRange, offset, len)?;
        }
        let mut data = vec![0; len as usize];
        self.read_chain(offset, &mut data);
        let mut target_inner = target.inner.lock();
        target.check(&mut target_inner, IoOp::CopyRange, target_offset, len)?;
        target.store(&mut target_inner, target_offset, &data);
        Self::log(&mut target_inner, IoOp::CopyRange, target_offset, len);
        drop(target_inner);
        Self::log(&mut self.inner.lock(), IoOp::CopyRange, offset, len);
        Ok(())
    }

    async fn block_status(
        &self,
        offset: u64,
        len: u64,
        scope: StatusScope,
    ) -> anyhow::Result<(BlockStatus, u64)> {
        self.delay().await;
        let mut inner = self.inner.lock();
        self.check(&mut inner, IoOp::BlockStatus, offset, len)?;
        if len == 0 || offset >= self.size() {
            return Ok((BlockStatus::default(), 0));
        }
        let inner = &*inner;
        Ok(self.run_length(offset, len, |cluster| {
            self.status_of(inner, cluster, scope)
        }))
    }

    async fn is_allocated(&self, offset: u64, len: u64) -> anyhow::Result<(bool, u64)> {
        self.delay().await;
        let mut inner = self.inner.lock();
        self.check(&mut inner, IoOp::IsAllocated, offset, len)?;
        if len == 0 || offset >= self.size() {
            return Ok((false, 0));
        }
        let inner = &*inner;
        Ok(self.run_length(offset, len, |cluster| {
            inner.allocation[cluster] != Allocation::Unallocated
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: u64 = 4096;

    #[tokio::test]
    async fn reads_fall_through_to_backing() -> anyhow::Result<()> {
        let base = Arc::new(MemoryDevice::new("base", 4 * CLUSTER, CLUSTER));
        base.fill(0, &vec![1; 4 * CLUSTER as usize]);
        let top = MemoryDevice::new("top", 4 * CLUSTER, CLUSTER).with_backing(base);
        top.write(CLUSTER + 10, Bytes::from_static(&[2; 10]), WriteFlags::default())
            .await?;
        let buf = top.read(0, BytesMut::zeroed(2 * CLUSTER as usize)).await?;
        assert!(buf[..CLUSTER as usize + 10].iter().all(|b| *b == 1));
        assert!(buf[CLUSTER as usize + 10..CLUSTER as usize + 20]
            .iter()
            .all(|b| *b == 2));
        assert!(buf[CLUSTER as usize + 20..].iter().all(|b| *b == 1));
        assert_eq!(top.is_allocated(0, 4 * CLUSTER).await?, (false, CLUSTER));
        assert_eq!(top.is_allocated(CLUSTER, 3 * CLUSTER).await?, (true, CLUSTER));
        Ok(())
    }

    #[tokio::test]
    async fn block_status_scopes() -> anyhow::Result<()> {
        let base = Arc::new(MemoryDevice::new("base", 4 * CLUSTER, CLUSTER));
        base.fill(2 * CLUSTER, &[7; 16]);
        let top = MemoryDevice::new("top", 4 * CLUSTER, CLUSTER).with_backing(base);
        top.fill(0, &[1; 16]);
        top.fill_zeroes(CLUSTER, CLUSTER);
        assert_eq!(
            top.block_status(0, 4 * CLUSTER, StatusScope::Chain).await?,
            (BlockStatus::DATA, CLUSTER)
        );
        let (status, run) = top
            .block_status(CLUSTER, 3 * CLUSTER, StatusScope::Chain)
            .await?;
        assert!(status.zero && status.allocated);
        assert_eq!(run, CLUSTER);
        assert_eq!(
            top.block_status(2 * CLUSTER, 2 * CLUSTER, StatusScope::Chain)
                .await?,
            (BlockStatus::DATA, CLUSTER)
        );
        assert_eq!(
            top.block_status(2 * CLUSTER, 2 * CLUSTER, StatusScope::AboveBacking)
                .await?,
            (BlockStatus::default(), 2 * CLUSTER)
        );
        Ok(())
    }

    #[tokio::test]
    async fn injected_faults_fire_once() -> anyhow::Result<()> {
        let dev = MemoryDevice::new("dev", 4 * CLUSTER, CLUSTER);
        dev.inject_fault(IoOp::Write, CLUSTER, 1);
        assert!(dev.write(0, Bytes::from(vec![1; 100]), WriteFlags::default()).await.is_ok());
        assert!(dev
            .write(CLUSTER - 1, Bytes::from_static(&[1; 2]), WriteFlags::default())
            .await
            .is_err());
        assert!(dev
            .write(CLUSTER - 1, Bytes::from_static(&[1; 2]), WriteFlags::default())
            .await
            .is_ok());
        assert_eq!(dev.io_log().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn copy_range_between_memory_devices() -> anyhow::Result<()> {
        let src = MemoryDevice::new("src", 2 * CLUSTER, CLUSTER);
        let dst = MemoryDevice::new("dst", 2 * CLUSTER, CLUSTER);
        src.fill(0, &[9; 2 * CLUSTER as usize]);
        src.copy_range(0, &dst, 0, CLUSTER, WriteFlags::default())
            .await?;
        assert!(dst.contents()[..CLUSTER as usize].iter().all(|b| *b == 9));
        assert!(dst.contents()[CLUSTER as usize..].iter().all(|b| *b == 0));
        dst.set_copy_range_supported(false);
        assert!(src
            .copy_range(CLUSTER, &dst, CLUSTER, CLUSTER, WriteFlags::default())
            .await
            .is_err());
        Ok(())
    }
}
