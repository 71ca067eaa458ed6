use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use blockcopy::{BlockCopyState, BlockDevice, CopyConfig, FileDevice, ProgressMeter, WriteFlags};
use clap::Parser;
use tracing::instrument;

fn parse_size(value: &str) -> Result<u64, String> {
    value
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bcp",
    version,
    about = "Copy a block image incrementally, cluster by cluster",
    long_about = "`bcp` copies the contents of a source image (a regular file or a block device) into a target.

The source is split into clusters that are copied in parallel. Where the filesystem and the
kernel allow it the data is copied with copy_file_range(2), otherwise it goes through memory.
Ranges that read as zeroes are written as zeroes.

EXAMPLE:
    # Copy a disk image, skipping holes, with progress
    bcp disk.img copy.img --skip-unallocated --progress --summary

The target is created and sized to the source if missing."
)]
struct Args {
    // Copy options
    /// Copy granularity, must be a power of two
    #[arg(long, default_value = "64KiB", value_name = "SIZE", value_parser = parse_size, help_heading = "Copy options")]
    cluster_size: u64,

    /// Do not copy ranges that are holes in the source
    ///
    /// The target is expected to read as zeroes there, e.g. a freshly created sparse file.
    #[arg(long, help_heading = "Copy options")]
    skip_unallocated: bool,

    /// Never use copy_file_range(2), always copy through memory
    #[arg(long, help_heading = "Copy options")]
    no_copy_range: bool,

    /// Start of the range to copy
    #[arg(long, default_value = "0", value_name = "SIZE", value_parser = parse_size, help_heading = "Copy options")]
    offset: u64,

    /// Length of the range to copy, defaults to everything after --offset
    #[arg(long, value_name = "SIZE", value_parser = parse_size, help_heading = "Copy options")]
    length: Option<u64>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<blockcopy::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of copy tasks running in parallel
    #[arg(
        long,
        default_value = "64",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    max_workers: usize,

    /// Memory budget for data in flight
    #[arg(long, default_value = "128MiB", value_name = "SIZE", value_parser = parse_size, help_heading = "Performance & throttling")]
    max_mem: u64,

    /// Limit the copy rate to SIZE per second, 0 means no limit
    #[arg(long, default_value = "0", value_name = "SIZE", value_parser = parse_size, help_heading = "Performance & throttling")]
    speed_limit: u64,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_threads: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source image
    #[arg()]
    source: std::path::PathBuf,

    /// Target image, created if missing
    #[arg()]
    target: std::path::PathBuf,
}

/// Clears the dirty bits of every hole in `[offset, end)`.
async fn prune_unallocated(state: &BlockCopyState, offset: u64, end: u64) -> Result<u64> {
    let mut pos = offset / state.cluster_size() * state.cluster_size();
    let mut pruned = 0;
    while pos < end {
        let (allocated, bytes) = state
            .reset_unallocated(pos)
            .await
            .with_context(|| format!("failed checking allocation at offset {pos}"))?;
        if bytes == 0 {
            break;
        }
        if !allocated {
            pruned += bytes;
        }
        pos += bytes;
    }
    Ok(pruned)
}

#[instrument(skip(meter))]
async fn async_main(args: Args, meter: Arc<ProgressMeter>) -> Result<blockcopy::Summary> {
    let source = Arc::new(FileDevice::open(&args.source).await?);
    let size = source.size();
    let target = Arc::new(FileDevice::open_writable(&args.target, size).await?);
    if args.offset > size {
        return Err(anyhow!(
            "offset {} is past the end of {:?} ({} bytes)",
            args.offset,
            &args.source,
            size
        ));
    }
    let length = args
        .length
        .unwrap_or(size - args.offset)
        .min(size - args.offset);
    let config = CopyConfig {
        cluster_size: args.cluster_size,
        max_workers: args.max_workers,
        max_mem: args.max_mem,
        use_copy_range: !args.no_copy_range,
        speed_limit: args.speed_limit,
        ..Default::default()
    };
    let state = BlockCopyState::new(source, target, WriteFlags::default(), config)?;
    state.dirty_bitmap().set_range(args.offset, length);
    if args.skip_unallocated {
        state.set_skip_unallocated(true);
        let pruned = prune_unallocated(&state, args.offset, args.offset + length).await?;
        tracing::info!("{} of {:?} unallocated", bytesize::ByteSize(pruned), &args.source);
    }
    state.set_progress_meter(meter);
    match state.copy(args.offset, length).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            let side = if error.error_is_read {
                format!("error reading source {:?}", &args.source)
            } else {
                format!("error writing target {:?}", &args.target)
            };
            if args.summary {
                return Err(anyhow!("{}: {}\n\n{}", side, &error, &error.summary));
            }
            Err(anyhow!("{}: {}", side, &error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let meter = Arc::new(ProgressMeter::new());
    let func = {
        let args = args.clone();
        let meter = Arc::clone(&meter);
        || async_main(args, meter)
    };
    let output = blockcopy::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = blockcopy::RuntimeConfig {
        max_workers: args.max_threads,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = blockcopy::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(blockcopy::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        meter,
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
