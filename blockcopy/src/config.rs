//! Configuration types for the copy engine and for the runtime that drives it

/// Default copy granularity.
pub const DEFAULT_CLUSTER_SIZE: u64 = 64 * 1024;
/// Maximum number of copy tasks running in parallel for one copy call.
pub const MAX_WORKERS: usize = 64;
/// Maximum amount of memory held by in-flight copy tasks.
pub const MAX_MEM: u64 = 128 * 1024 * 1024;
/// Chunk size used while copying through a bounce buffer.
pub const MAX_BUFFER: u64 = 1024 * 1024;
/// Chunk size used once offloaded copying has proven to work.
pub const MAX_COPY_RANGE: u64 = 16 * 1024 * 1024;

/// Copy engine configuration
#[derive(Debug, Clone, Copy)]
pub struct CopyConfig {
    /// Copy granularity, must be a power of two
    pub cluster_size: u64,
    /// Maximum number of parallel copy tasks per copy call
    pub max_workers: usize,
    /// Memory budget shared by all in-flight copy tasks (bytes)
    pub max_mem: u64,
    /// Chunk size for buffered copying (bytes)
    pub max_buffer: u64,
    /// Chunk size for offloaded copying (bytes)
    pub max_copy_range: u64,
    /// Try device-to-device copy offload before falling back to buffered copying
    pub use_copy_range: bool,
    /// Bytes per second, 0 means no limit
    pub speed_limit: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            max_workers: MAX_WORKERS,
            max_mem: MAX_MEM,
            max_buffer: MAX_BUFFER,
            max_copy_range: MAX_COPY_RANGE,
            use_copy_range: true,
            speed_limit: 0,
        }
    }
}

impl CopyConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if !self.cluster_size.is_power_of_two() {
            return Err(format!(
                "cluster_size must be a power of two, got {}",
                self.cluster_size
            ));
        }
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }
        if self.max_mem == 0 || u32::try_from(self.max_mem).is_err() {
            return Err(format!(
                "max_mem must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.max_mem
            ));
        }
        if self.max_buffer == 0 || self.max_copy_range == 0 {
            return Err("max_buffer and max_copy_range must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CopyConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let bad_cluster = CopyConfig {
            cluster_size: 3000,
            ..Default::default()
        };
        assert!(bad_cluster.validate().is_err());
        let no_workers = CopyConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());
        let huge_mem = CopyConfig {
            max_mem: u64::from(u32::MAX) + 1,
            ..Default::default()
        };
        assert!(huge_mem.validate().is_err());
        let no_mem = CopyConfig {
            max_mem: 0,
            ..Default::default()
        };
        assert!(no_mem.validate().is_err());
    }
}
