use std::os::unix::fs::FileExt;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use bytes::{Bytes, BytesMut};
use nix::unistd::Whence;
use tracing::instrument;

use super::{BlockDevice, BlockStatus, StatusScope, WriteFlags};

const ZERO_CHUNK: u64 = 1024 * 1024;
// copy_file_range rejects lengths that do not fit in a signed 32-bit value on some kernels
const COPY_RANGE_CHUNK: u64 = 1 << 30;

/// Block device backed by a regular file or a host block device.
///
/// All I/O is positional and runs on tokio's blocking pool. Allocation status is derived
/// from `SEEK_DATA`/`SEEK_HOLE`, so holes in sparse files are reported unallocated.
#[derive(Debug, Clone)]
pub struct FileDevice {
    path: std::path::PathBuf,
    file: Arc<std::fs::File>,
    size: u64,
}

impl FileDevice {
    /// Opens `path` read-only.
    pub async fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Self> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("cannot open {:?} for reading", &path))?;
            Self::from_file(path, file)
        })
        .await?
    }

    /// Opens (creating if needed) `path` for writing and makes sure it is at least `size` bytes.
    pub async fn open_writable(path: &std::path::Path, size: u64) -> anyhow::Result<Self> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Self> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("cannot open {:?} for writing", &path))?;
            let metadata = file
                .metadata()
                .with_context(|| format!("failed reading metadata of {:?}", &path))?;
            if metadata.is_file() && metadata.len() < size {
                file.set_len(size)
                    .with_context(|| format!("failed extending {:?} to {} bytes", &path, size))?;
            }
            Self::from_file(path, file)
        })
        .await?
    }

    fn from_file(path: std::path::PathBuf, file: std::fs::File) -> anyhow::Result<Self> {
        use std::io::Seek;
        // works for block devices too, where metadata reports a zero length
        let size = (&file)
            .seek(std::io::SeekFrom::End(0))
            .with_context(|| format!("failed determining size of {:?}", &path))?;
        Ok(Self {
            path,
            file: Arc::new(file),
            size,
        })
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Next offset at or after `offset` where data (`SEEK_DATA`) or a hole (`SEEK_HOLE`) starts.
    ///
    /// Returns `Ok(None)` when there is no data past `offset` and `Err` with `EINVAL` when the
    /// file system cannot tell.
    fn seek(file: &std::fs::File, offset: u64, whence: Whence) -> nix::Result<Option<u64>> {
        match nix::unistd::lseek(file, offset as i64, whence) {
            Ok(pos) => Ok(Some(pos as u64)),
            Err(nix::errno::Errno::ENXIO) => Ok(None),
            Err(errno) => Err(errno),
        }
    }
}

#[async_trait::async_trait]
impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    #[instrument(skip(self, buf), fields(path = ?self.path, len = buf.len()))]
    async fn read(&self, offset: u64, mut buf: BytesMut) -> anyhow::Result<BytesMut> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<BytesMut> {
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await?
        .with_context(|| format!("failed reading {:?} at offset {}", &self.path, offset))
    }

    #[instrument(skip(self, buf), fields(path = ?self.path, len = buf.len()))]
    async fn write(&self, offset: u64, buf: Bytes, flags: WriteFlags) -> anyhow::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            file.write_all_at(&buf, offset)?;
            if flags.fua {
                file.sync_data()?;
            }
            Ok(())
        })
        .await?
        .with_context(|| format!("failed writing {:?} at offset {}", &self.path, offset))
    }

    #[instrument(skip(self), fields(path = ?self.path))]
    async fn write_zeroes(&self, offset: u64, len: u64, flags: WriteFlags) -> anyhow::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let zeroes = vec![0; ZERO_CHUNK.min(len) as usize];
            let mut pos = offset;
            let end = offset + len;
            while pos < end {
                let chunk = (end - pos).min(ZERO_CHUNK) as usize;
                file.write_all_at(&zeroes[..chunk], pos)?;
                pos += chunk as u64;
            }
            if flags.fua {
                file.sync_data()?;
            }
            Ok(())
        })
        .await?
        .with_context(|| {
            format!(
                "failed writing {} zero bytes to {:?} at offset {}",
                len, &self.path, offset
            )
        })
    }

    #[instrument(skip(self, target), fields(path = ?self.path))]
    async fn copy_range(
        &self,
        offset: u64,
        target: &dyn BlockDevice,
        target_offset: u64,
        len: u64,
        flags: WriteFlags,
    ) -> anyhow::Result<()> {
        let Some(target) = target.as_any().downcast_ref::<FileDevice>() else {
            return Err(anyhow!(
                "copy offload from {:?} to {:?} is not supported",
                &self.path,
                target
            ));
        };
        let src = self.file.clone();
        let dst = target.file.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut off_in = offset as i64;
            let mut off_out = target_offset as i64;
            let mut remaining = len;
            while remaining > 0 {
                let chunk = remaining.min(COPY_RANGE_CHUNK) as usize;
                let copied = nix::fcntl::copy_file_range(
                    &*src,
                    Some(&mut off_in),
                    &*dst,
                    Some(&mut off_out),
                    chunk,
                )?;
                if copied == 0 {
                    anyhow::bail!("unexpected end of source with {} bytes left", remaining);
                }
                remaining -= copied as u64;
            }
            if flags.fua {
                dst.sync_data()?;
            }
            Ok(())
        })
        .await?
        .with_context(|| {
            format!(
                "failed offloading copy of {} bytes from {:?} to {:?}",
                len, &self.path, &target.path
            )
        })
    }

    async fn block_status(
        &self,
        offset: u64,
        len: u64,
        _scope: StatusScope,
    ) -> anyhow::Result<(BlockStatus, u64)> {
        let end = offset.saturating_add(len).min(self.size);
        if offset >= end {
            return Ok((BlockStatus::default(), 0));
        }
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<(BlockStatus, u64)> {
            let data = match Self::seek(&file, offset, Whence::SeekData) {
                Ok(data) => data,
                // no hole support, everything is data
                Err(nix::errno::Errno::EINVAL) => return Ok((BlockStatus::DATA, end - offset)),
                Err(errno) => return Err(errno.into()),
            };
            match data {
                Some(data) if data == offset => {
                    let hole = Self::seek(&file, offset, Whence::SeekHole)?.unwrap_or(end);
                    Ok((BlockStatus::DATA, hole.min(end) - offset))
                }
                hole_end => {
                    let hole_end = hole_end.unwrap_or(end).min(end);
                    let hole = BlockStatus {
                        allocated: false,
                        data: false,
                        zero: true,
                    };
                    Ok((hole, hole_end - offset))
                }
            }
        })
        .await?
        .with_context(|| format!("failed querying allocation of {:?} at {}", &self.path, offset))
    }

    async fn is_allocated(&self, offset: u64, len: u64) -> anyhow::Result<(bool, u64)> {
        let (status, run) = self
            .block_status(offset, len, StatusScope::AboveBacking)
            .await?;
        Ok((status.allocated, run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_round_trip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("disk.img");
        let dev = FileDevice::open_writable(&path, 8192).await?;
        assert_eq!(dev.size(), 8192);
        dev.write(100, Bytes::from_static(b"hello"), WriteFlags::default())
            .await?;
        let buf = dev.read(100, BytesMut::zeroed(5)).await?;
        assert_eq!(&buf[..], b"hello");
        dev.write_zeroes(100, 2, WriteFlags::default()).await?;
        let buf = dev.read(100, buf).await?;
        assert_eq!(&buf[..], b"\0\0llo");
        Ok(())
    }

    #[tokio::test]
    async fn copy_range_between_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src_path = tmp.path().join("src.img");
        std::fs::write(&src_path, vec![7u8; 4096])?;
        let src = FileDevice::open(&src_path).await?;
        let dst = FileDevice::open_writable(&tmp.path().join("dst.img"), 4096).await?;
        src.copy_range(1024, &dst, 0, 2048, WriteFlags::default())
            .await?;
        let buf = dst.read(0, BytesMut::zeroed(4096)).await?;
        assert!(buf[..2048].iter().all(|b| *b == 7));
        assert!(buf[2048..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[tokio::test]
    async fn holes_are_reported_unallocated() -> anyhow::Result<()> {
        use std::io::{Seek, Write};
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("sparse.img");
        {
            let mut file = std::fs::File::create(&path)?;
            file.set_len(4 << 20)?;
            file.seek(std::io::SeekFrom::Start(2 << 20))?;
            file.write_all(&[1u8; 1 << 20])?;
        }
        let dev = FileDevice::open(&path).await?;
        let (status, run) = dev.block_status(0, 4 << 20, StatusScope::Chain).await?;
        if status.allocated {
            // file systems without hole support report everything as data
            assert!(status.data);
        } else {
            assert!(status.zero);
            assert_eq!(run, 2 << 20);
            let (status, run) = dev
                .block_status(2 << 20, 2 << 20, StatusScope::Chain)
                .await?;
            assert!(status.allocated);
            assert!((4096..=1 << 20).contains(&run));
        }
        let (status, run) = dev.block_status(4 << 20, 4096, StatusScope::Chain).await?;
        assert_eq!((status, run), (BlockStatus::default(), 0));
        Ok(())
    }

    #[tokio::test]
    async fn open_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FileDevice::open(&tmp.path().join("missing")).await.unwrap_err();
        assert!(format!("{err:#}").contains("cannot open"));
    }
}
