use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::instrument;

use crate::bitmap::DirtyBitmap;
use crate::config::CopyConfig;
use crate::device::{BlockDevice, BlockStatus, StatusScope, WriteFlags};
use crate::error;
use crate::progress::{ProgressCallback, ProgressMeter};
use crate::task::{ActiveTasks, CallState, CopyTask};
use crate::task_pool::TaskPool;

/// Error type for copy calls that preserves the summary of the work done before the failure.
///
/// # Logging Convention
/// The Display implementation automatically shows the full error chain, so you can log it
/// with any format specifier:
/// ```ignore
/// tracing::error!("operation failed: {}", &error);   // ✅ Shows full chain
/// tracing::error!("operation failed: {:#}", &error); // ✅ Shows full chain
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: error::Error,
    /// Whether the first failure of the call happened on the source side.
    pub error_is_read: bool,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: error::Error, error_is_read: bool, summary: Summary) -> Self {
        Error {
            source,
            error_is_read,
            summary,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    /// Bytes of data written to the target, offloaded or buffered.
    pub bytes_copied: u64,
    /// Part of `bytes_copied` moved by device-to-device copy offload.
    pub bytes_offloaded: u64,
    pub bytes_zeroed: u64,
    /// Dirty bytes cleared without I/O because the source had nothing allocated there.
    pub bytes_skipped: u64,
    pub tasks: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            bytes_offloaded: self.bytes_offloaded + other.bytes_offloaded,
            bytes_zeroed: self.bytes_zeroed + other.bytes_zeroed,
            bytes_skipped: self.bytes_skipped + other.bytes_skipped,
            tasks: self.tasks + other.tasks,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            bytes offloaded: {}\n\
            bytes zeroed: {}\n\
            bytes skipped: {}\n\
            copy tasks: {}",
            bytesize::ByteSize(self.bytes_copied),
            bytesize::ByteSize(self.bytes_offloaded),
            bytesize::ByteSize(self.bytes_zeroed),
            bytesize::ByteSize(self.bytes_skipped),
            self.tasks,
        )
    }
}

/// How a task moved its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Zeroes,
    CopyRange,
    Buffered,
}

impl Summary {
    fn for_task(method: Method, bytes: u64) -> Self {
        let mut summary = Summary {
            tasks: 1,
            ..Default::default()
        };
        match method {
            Method::Zeroes => summary.bytes_zeroed = bytes,
            Method::CopyRange => {
                summary.bytes_copied = bytes;
                summary.bytes_offloaded = bytes;
            }
            Method::Buffered => summary.bytes_copied = bytes,
        }
        summary
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// State guarded by one lock that is never held across an await point.
#[derive(Debug)]
struct Inner {
    bitmap: DirtyBitmap,
    tasks: ActiveTasks,
    copy_size: u64,
    use_copy_range: bool,
}

impl Inner {
    fn debug_check(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut ranges: Vec<(u64, u64)> = self.tasks.ranges().collect();
        ranges.sort_unstable();
        debug_assert!(
            ranges.windows(2).all(|pair| pair[0].0 + pair[0].1 <= pair[1].0),
            "active tasks overlap: {ranges:?}"
        );
        debug_assert_eq!(
            ranges.iter().map(|(_, bytes)| bytes).sum::<u64>(),
            self.tasks.in_flight()
        );
    }
}

#[derive(Default)]
struct ProgressHooks {
    meter: Option<Arc<ProgressMeter>>,
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ProgressHooks")
            .field("meter", &self.meter)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome of claiming the next dirty run.
#[derive(Debug)]
enum Claim {
    Task(CopyTask),
    /// The run starting at `offset` was made dirty again while an active task copies it.
    Busy {
        offset: u64,
        bytes: u64,
        queue: Arc<tokio::sync::Notify>,
    },
}

/// Result of one scan over the requested range.
#[derive(Debug)]
struct Pass {
    found_dirty: bool,
    summary: Summary,
    result: error::Result<()>,
}

/// Incremental copy of the dirty clusters of `source` to `target`.
///
/// The dirty bitmap starts clean and disabled; callers mark what needs copying through
/// [`BlockCopyState::dirty_bitmap`] and then issue [`BlockCopyState::copy`] calls, possibly
/// several at once on overlapping ranges. Each dirty cluster is copied by exactly one task;
/// a failed task makes its clusters dirty again so that a later call retries them.
#[derive(Debug)]
pub struct BlockCopyState {
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    cluster_size: u64,
    len: u64,
    max_transfer: u64,
    write_flags: WriteFlags,
    config: CopyConfig,
    skip_unallocated: AtomicBool,
    inner: parking_lot::Mutex<Inner>,
    mem: throttle::SharedResource,
    speed: AtomicU64,
    rate_limit: parking_lot::Mutex<Option<Arc<throttle::RateLimit>>>,
    hooks: parking_lot::Mutex<ProgressHooks>,
}

impl BlockCopyState {
    pub fn new(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        write_flags: WriteFlags,
        config: CopyConfig,
    ) -> error::Result<Arc<Self>> {
        config.validate().map_err(error::Error::InvalidArgument)?;
        let len = source.size();
        if target.size() < len {
            return Err(error::Error::InvalidArgument(format!(
                "target ({} bytes) is smaller than source ({} bytes)",
                target.size(),
                len
            )));
        }
        let mem = u32::try_from(config.max_mem)
            .map(throttle::SharedResource::new)
            .map_err(|_| {
                error::Error::InvalidArgument(format!("max_mem too large: {}", config.max_mem))
            })?;
        let cluster_size = config.cluster_size;
        let max_transfer = [source.max_transfer(), target.max_transfer()]
            .into_iter()
            .flatten()
            .filter(|limit| *limit > 0)
            .fold(i32::MAX as u64, u64::min);
        let (use_copy_range, copy_size) = if max_transfer < cluster_size {
            // copy offload does not honor the transfer limit
            tracing::debug!(
                "max transfer {} is below cluster size {}, copy offload disabled",
                max_transfer,
                cluster_size
            );
            (false, cluster_size)
        } else if write_flags.compressed {
            // compressed writes must be exactly one cluster
            (false, cluster_size)
        } else {
            // offload starts with small chunks and grows once it has worked (see `do_copy`)
            (config.use_copy_range, cluster_size.max(config.max_buffer))
        };
        let mut bitmap = DirtyBitmap::new(cluster_size, len);
        bitmap.disable();
        tracing::debug!(
            "block copy state: {} bytes, cluster {}, copy size {}, copy offload {}",
            len,
            cluster_size,
            copy_size,
            use_copy_range
        );
        Ok(Arc::new(Self {
            source,
            target,
            cluster_size,
            len,
            max_transfer,
            write_flags,
            config,
            skip_unallocated: AtomicBool::new(false),
            inner: parking_lot::Mutex::new(Inner {
                bitmap,
                tasks: ActiveTasks::default(),
                copy_size,
                use_copy_range,
            }),
            mem,
            speed: AtomicU64::new(config.speed_limit),
            rate_limit: parking_lot::Mutex::new(None),
            hooks: parking_lot::Mutex::new(ProgressHooks::default()),
        }))
    }

    /// Creates a state with the default configuration apart from `cluster_size`.
    pub fn with_cluster_size(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        cluster_size: u64,
        write_flags: WriteFlags,
    ) -> error::Result<Arc<Self>> {
        Self::new(
            source,
            target,
            write_flags,
            CopyConfig {
                cluster_size,
                ..Default::default()
            },
        )
    }

    /// When set, clusters that are not allocated in the source above its backing layer are
    /// cleared from the bitmap without being copied.
    pub fn set_skip_unallocated(&self, skip: bool) {
        self.skip_unallocated.store(skip, Ordering::Release);
    }

    #[must_use]
    pub fn skip_unallocated(&self) -> bool {
        self.skip_unallocated.load(Ordering::Acquire)
    }

    /// Installs the progress sink and announces the work currently outstanding.
    pub fn set_progress_meter(&self, meter: Arc<ProgressMeter>) {
        self.hooks.lock().meter = Some(meter);
        self.update_remaining();
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        self.hooks.lock().callback = Some(callback);
    }

    /// Limits copying to `bytes_per_second`; 0 removes the limit.
    pub fn set_speed(&self, bytes_per_second: u64) {
        self.speed.store(bytes_per_second, Ordering::Release);
        // recreated with the new rate on next use
        *self.rate_limit.lock() = None;
    }

    /// The bitmap of clusters still to be copied.
    ///
    /// The returned guard locks the whole state; do not hold it across an await point.
    pub fn dirty_bitmap(&self) -> parking_lot::MappedMutexGuard<'_, DirtyBitmap> {
        parking_lot::MutexGuard::map(self.inner.lock(), |inner| &mut inner.bitmap)
    }

    /// Current chunk size used when claiming dirty ranges.
    #[must_use]
    pub fn copy_size(&self) -> u64 {
        self.inner.lock().copy_size
    }

    #[must_use]
    pub fn uses_copy_range(&self) -> bool {
        self.inner.lock().use_copy_range
    }

    /// Total length of all claimed, unfinished tasks.
    #[must_use]
    pub fn in_flight_bytes(&self) -> u64 {
        self.inner.lock().tasks.in_flight()
    }

    /// Number of bytes covered by the copy, i.e. the size of the source.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Part of the memory budget reserved by running tasks.
    #[must_use]
    pub fn memory_in_use(&self) -> u64 {
        self.mem.capacity() - self.mem.available()
    }

    /// Copies every dirty cluster overlapping `[offset, offset + bytes)`.
    ///
    /// The range is widened to cluster boundaries and clamped to the end of the source.
    /// Returns once nothing in the range is dirty or claimed by another call, or after the
    /// first failure; the clusters of failed tasks are dirty again when this returns.
    #[instrument(skip(self))]
    pub async fn copy(self: &Arc<Self>, offset: u64, bytes: u64) -> Result<Summary, Error> {
        let end = offset.saturating_add(bytes).min(self.len);
        let offset = align_down(offset, self.cluster_size);
        if offset >= end {
            return Ok(Summary::default());
        }
        let end = align_up(end, self.cluster_size);
        let call = Arc::new(CallState::default());
        let mut summary = Summary::default();
        loop {
            let pass = self.copy_dirty_clusters(&call, offset, end).await;
            summary = summary + pass.summary;
            if let Err(source) = pass.result {
                let error_is_read = call.error_is_read().unwrap_or_else(|| source.is_read());
                tracing::error!("copy of [{}, {}) failed: {:#}", offset, end, &source);
                return Err(Error::new(source, error_is_read, summary));
            }
            if pass.found_dirty {
                continue;
            }
            // nothing left to claim, but another call may still be copying part of the range
            if !self.wait_for_conflict(offset, end - offset).await {
                break;
            }
        }
        Ok(summary)
    }

    /// Clears the bitmap for the unallocated run of clusters starting at `offset`.
    ///
    /// Returns whether the run is allocated and its length in bytes (a multiple of the
    /// cluster size). The bitmap is only modified for unallocated runs.
    #[instrument(skip(self))]
    pub async fn reset_unallocated(&self, offset: u64) -> error::Result<(bool, u64)> {
        if offset % self.cluster_size != 0 {
            return Err(error::Error::InvalidArgument(format!(
                "offset {} is not aligned to cluster size {}",
                offset, self.cluster_size
            )));
        }
        let (allocated, clusters) = self.is_cluster_allocated(offset).await?;
        let bytes = clusters * self.cluster_size;
        if !allocated {
            self.inner.lock().bitmap.reset_range(offset, bytes);
            self.update_remaining();
        }
        Ok((allocated, bytes))
    }

    /// Scans `[offset, end)` once, starting a task for each dirty run.
    async fn copy_dirty_clusters(
        self: &Arc<Self>,
        call: &Arc<CallState>,
        mut offset: u64,
        end: u64,
    ) -> Pass {
        let mut found_dirty = false;
        let mut summary = Summary::default();
        let mut result = Ok(());
        let mut pool: Option<TaskPool<Summary>> = None;
        while offset < end && pool.as_ref().is_none_or(TaskPool::is_ok) {
            let mut task = match self.claim(call, offset, end) {
                None => {
                    tracing::trace!("skip range [{}, {}): nothing dirty", offset, end);
                    break;
                }
                Some(Claim::Busy {
                    offset: busy,
                    bytes,
                    queue,
                }) => {
                    found_dirty = true;
                    self.wait_on(&queue, busy, bytes).await;
                    offset = busy;
                    continue;
                }
                Some(Claim::Task(task)) => task,
            };
            if task.offset > offset {
                tracing::trace!("skip range [{}, {}): clean", offset, task.offset);
            }
            found_dirty = true;
            let (status, run) = self.block_status(task.offset, task.bytes).await;
            if run < task.bytes {
                self.shrink(&mut task, run);
            }
            if self.skip_unallocated() && !status.allocated {
                self.end_task(&task, true);
                self.update_remaining();
                tracing::trace!(
                    "skip range [{}, {}): unallocated",
                    task.offset,
                    task.end()
                );
                summary.bytes_skipped += self.clamp(task.offset, task.bytes);
                offset = task.end();
                continue;
            }
            task.zeroes = status.zero;
            if let Some(rate_limit) = self.rate_limit() {
                rate_limit.consume(task.bytes).await;
            }
            tracing::trace!("process task [{}, {})", task.offset, task.end());
            let reservation = self.mem.acquire(task.bytes).await;
            offset = task.end();
            if pool.is_none() && offset < end {
                pool = Some(TaskPool::new(self.config.max_workers));
            }
            match pool.as_mut() {
                None => match Arc::clone(self).run_task(task, reservation).await {
                    Ok(done) => summary = summary + done,
                    Err(error) => {
                        result = Err(error);
                        break;
                    }
                },
                Some(pool) => {
                    pool.wait_slot().await;
                    if !pool.is_ok() {
                        tracing::debug!("task [{}, {}) cancelled", task.offset, task.end());
                        reservation.release();
                        self.end_task(&task, false);
                        break;
                    }
                    pool.start(Arc::clone(self).run_task(task, reservation))
                        .await;
                }
            }
        }
        if let Some(mut pool) = pool {
            pool.wait_all().await;
            let (done, status) = pool.into_parts();
            summary = summary + done;
            result = result.and(status);
        }
        Pass {
            found_dirty,
            summary,
            result,
        }
    }

    /// Body of one copy task. Always releases the reservation and ends the task.
    async fn run_task(
        self: Arc<Self>,
        task: CopyTask,
        reservation: throttle::Reservation,
    ) -> error::Result<Summary> {
        let result = self.do_copy(task.offset, task.bytes, task.zeroes).await;
        match &result {
            Ok(_) => self.report_progress(task.bytes),
            Err(error) => task.call.fail(error.is_read()),
        }
        reservation.release();
        self.end_task(&task, result.is_ok());
        result.map(|method| Summary::for_task(method, self.clamp(task.offset, task.bytes)))
    }

    /// Moves `[offset, offset + bytes)` (clamped to the source size) from source to target.
    #[instrument(skip(self))]
    async fn do_copy(&self, offset: u64, bytes: u64, zeroes: bool) -> error::Result<Method> {
        let nbytes = self.clamp(offset, bytes);
        if zeroes {
            self.target
                .write_zeroes(offset, nbytes, self.write_flags.without_compression())
                .await
                .map_err(|source| {
                    tracing::warn!("write zeroes at {} failed: {:#}", offset, &source);
                    error::Error::Write {
                        offset,
                        len: nbytes,
                        source,
                    }
                })?;
            return Ok(Method::Zeroes);
        }
        let use_copy_range = self.inner.lock().use_copy_range;
        if use_copy_range {
            match self
                .source
                .copy_range(offset, &*self.target, offset, nbytes, self.write_flags)
                .await
            {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    // another task may have given up on offload meanwhile
                    if inner.use_copy_range {
                        inner.copy_size = self
                            .config
                            .max_copy_range
                            .max(self.cluster_size)
                            .min(align_down(self.max_transfer, self.cluster_size));
                    }
                    return Ok(Method::CopyRange);
                }
                Err(error) => {
                    tracing::info!(
                        "copy offload at {} failed, falling back to buffered copy: {:#}",
                        offset,
                        &error
                    );
                    let mut inner = self.inner.lock();
                    inner.use_copy_range = false;
                    inner.copy_size = self.cluster_size.max(self.config.max_buffer);
                }
            }
        }
        let buffer = self
            .source
            .read(offset, bytes::BytesMut::zeroed(nbytes as usize))
            .await
            .map_err(|source| {
                tracing::warn!("read at {} failed: {:#}", offset, &source);
                error::Error::Read {
                    offset,
                    len: nbytes,
                    source,
                }
            })?;
        self.target
            .write(offset, buffer.freeze(), self.write_flags)
            .await
            .map_err(|source| {
                tracing::warn!("write at {} failed: {:#}", offset, &source);
                error::Error::Write {
                    offset,
                    len: nbytes,
                    source,
                }
            })?;
        Ok(Method::Buffered)
    }

    /// Allocation status of the run at `offset`, rounded to whole clusters.
    ///
    /// Never fails: when the status is unknown the first cluster is treated as data.
    async fn block_status(&self, offset: u64, bytes: u64) -> (BlockStatus, u64) {
        let scope = if self.skip_unallocated() {
            StatusScope::AboveBacking
        } else {
            StatusScope::Chain
        };
        match self
            .source
            .block_status(offset, self.clamp(offset, bytes), scope)
            .await
        {
            Ok((status, num)) if num >= self.cluster_size => {
                let num = if offset + num == self.len {
                    align_up(num, self.cluster_size)
                } else {
                    align_down(num, self.cluster_size)
                };
                (status, num)
            }
            Ok(_) => (BlockStatus::DATA, self.cluster_size),
            Err(error) => {
                tracing::warn!(
                    "block status at {} failed, copying one cluster: {:#}",
                    offset,
                    &error
                );
                (BlockStatus::DATA, self.cluster_size)
            }
        }
    }

    /// Whether the source has data allocated (above its backing layer) at `offset`, and the
    /// length of that run in clusters.
    async fn is_cluster_allocated(&self, mut offset: u64) -> error::Result<(bool, u64)> {
        let mut total = 0;
        loop {
            let bytes = self.len.saturating_sub(offset);
            let (allocated, count) = self
                .source
                .is_allocated(offset, bytes)
                .await
                .map_err(error::Error::Status)?;
            total += count;
            if allocated || count == 0 {
                // a partially allocated cluster counts as allocated; an unallocated tail
                // counts as a whole cluster
                return Ok((allocated, total.div_ceil(self.cluster_size)));
            }
            if total >= self.cluster_size {
                return Ok((false, total / self.cluster_size));
            }
            offset += count;
        }
    }

    /// Claims the first dirty run overlapping `[offset, end)`.
    ///
    /// The run is cut short before any active task it overlaps. When the run starts inside
    /// an active task (its clusters were marked dirty again after that task claimed them),
    /// nothing is claimed and the caller gets the task's queue to wait on.
    fn claim(&self, call: &Arc<CallState>, offset: u64, end: u64) -> Option<Claim> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (offset, mut bytes) = inner
            .bitmap
            .next_dirty_area(offset, end, inner.copy_size)?;
        if let Some((start, queue)) = inner.tasks.first_conflict(offset, bytes) {
            if start <= offset {
                return Some(Claim::Busy {
                    offset,
                    bytes,
                    queue,
                });
            }
            bytes = start - offset;
        }
        inner.bitmap.reset_range(offset, bytes);
        let id = inner.tasks.insert(offset, bytes);
        inner.debug_check();
        Some(Claim::Task(CopyTask {
            id,
            offset,
            bytes,
            zeroes: false,
            call: Arc::clone(call),
        }))
    }

    /// Gives the tail of `task` past `bytes` back to the bitmap.
    fn shrink(&self, task: &mut CopyTask, bytes: u64) {
        let queue = {
            let mut inner = self.inner.lock();
            inner.bitmap.set_range(task.offset + bytes, task.bytes - bytes);
            let queue = inner.tasks.shrink(task.id, bytes);
            inner.debug_check();
            queue
        };
        task.bytes = bytes;
        if let Some(queue) = queue {
            queue.notify_waiters();
        }
    }

    fn end_task(&self, task: &CopyTask, success: bool) {
        let queue = {
            let mut inner = self.inner.lock();
            if !success {
                inner.bitmap.set_range(task.offset, task.bytes);
            }
            let queue = inner.tasks.remove(task.id);
            inner.debug_check();
            queue
        };
        if let Some(queue) = queue {
            queue.notify_waiters();
        }
    }

    /// Waits until a task overlapping `[offset, offset + bytes)` shrinks or ends.
    ///
    /// Returns `false` without waiting when there is no such task.
    async fn wait_for_conflict(&self, offset: u64, bytes: u64) -> bool {
        let Some(queue) = self.inner.lock().tasks.find_conflict(offset, bytes) else {
            return false;
        };
        self.wait_on(&queue, offset, bytes).await;
        true
    }

    /// Waits for the task owning `queue` to shrink or end, if it still overlaps
    /// `[offset, offset + bytes)`.
    async fn wait_on(&self, queue: &Arc<tokio::sync::Notify>, offset: u64, bytes: u64) {
        let notified = queue.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // the task may have finished before we registered on its queue
        let still_conflicts = self
            .inner
            .lock()
            .tasks
            .still_conflicts(offset, bytes, queue);
        if still_conflicts {
            tracing::debug!("waiting for conflicting task in [{}, +{})", offset, bytes);
            notified.await;
        }
    }

    fn clamp(&self, offset: u64, bytes: u64) -> u64 {
        (offset + bytes).min(self.len).saturating_sub(offset)
    }

    fn rate_limit(&self) -> Option<Arc<throttle::RateLimit>> {
        let speed = self.speed.load(Ordering::Acquire);
        if speed == 0 {
            return None;
        }
        let mut rate_limit = self.rate_limit.lock();
        Some(Arc::clone(rate_limit.get_or_insert_with(|| {
            Arc::new(throttle::RateLimit::per_second(speed))
        })))
    }

    fn report_progress(&self, bytes: u64) {
        let (meter, callback) = {
            let hooks = self.hooks.lock();
            (hooks.meter.clone(), hooks.callback.clone())
        };
        if let Some(meter) = meter {
            meter.work_done(bytes);
        }
        if let Some(callback) = callback {
            callback(bytes);
        }
    }

    fn update_remaining(&self) {
        let Some(meter) = self.hooks.lock().meter.clone() else {
            return;
        };
        let remaining = {
            let inner = self.inner.lock();
            inner.bitmap.dirty_count() + inner.tasks.in_flight()
        };
        meter.set_remaining(remaining);
    }
}
