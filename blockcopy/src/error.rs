/// Errors produced by the block copy engine.
///
/// # Logging Convention
/// The Display implementation includes the full chain of the underlying device error, so it
/// can be logged with any format specifier:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);   // ✅ Shows full chain
/// tracing::error!("copy failed: {:#}", &error); // ✅ Shows full chain
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading from the source device failed.
    #[error("failed reading {len} bytes from source at offset {offset}: {source:#}")]
    Read {
        offset: u64,
        len: u64,
        #[source]
        source: anyhow::Error,
    },
    /// Writing to the target device failed (buffered write, zero fill or offloaded copy).
    #[error("failed writing {len} bytes to target at offset {offset}: {source:#}")]
    Write {
        offset: u64,
        len: u64,
        #[source]
        source: anyhow::Error,
    },
    /// The request was dropped because an earlier request of the same call already failed.
    #[error("copy request cancelled after an earlier failure")]
    Cancelled,
    /// Querying the allocation status of the source failed.
    #[error("failed querying allocation status: {0:#}")]
    Status(#[source] anyhow::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Whether the failing side was the source.
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Error::Read { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
