//! Runtime helper shared by the command line tools
//!
//! [`run`] sets up logging and a tokio runtime according to the configuration, drives the
//! tool's async entry point to completion while periodically reporting progress, and prints
//! the summary or the error at the end.

use std::io::IsTerminal;
use std::sync::Arc;

use crate::config::{OutputConfig, RuntimeConfig};
use crate::progress::{ProgressMeter, ProgressPrinter};

const PROGRESS_BAR_DELAY: std::time::Duration = std::time::Duration::from_millis(200);
const TEXT_UPDATES_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// How progress is shown.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// `ProgressBar` if stderr is a terminal, `TextUpdates` otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text reports, suitable for logs
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    /// Concrete progress type and update interval.
    pub fn resolve(&self, is_terminal: bool) -> Result<(ProgressType, std::time::Duration), String> {
        let progress_type = match self.progress_type {
            ProgressType::Auto if is_terminal => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| format!("invalid progress delay {delay:?}: {err}"))?,
            None if progress_type == ProgressType::ProgressBar => PROGRESS_BAR_DELAY,
            None => TEXT_UPDATES_DELAY,
        };
        if delay.is_zero() {
            return Err("progress delay must be greater than zero".to_string());
        }
        Ok((progress_type, delay))
    }
}

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet && output.verbose == 0 {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // fails only when a subscriber is already installed, which is fine
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn show_progress(
    progress_type: ProgressType,
    delay: std::time::Duration,
    meter: Arc<ProgressMeter>,
    stop: Arc<tokio::sync::Notify>,
) {
    match progress_type {
        ProgressType::ProgressBar => {
            let pb = indicatif::ProgressBar::new(meter.get().total);
            pb.set_style(
                indicatif::ProgressStyle::with_template(
                    "{elapsed_precise} [{wide_bar}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
            );
            loop {
                let status = meter.get();
                pb.set_length(status.total);
                pb.set_position(status.done);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.notified() => break,
                }
            }
            pb.finish_and_clear();
        }
        _ => {
            let mut printer = ProgressPrinter::new(&meter);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.notified() => break,
                }
                match printer.print() {
                    Ok(text) => eprintln!("{text}"),
                    Err(error) => tracing::warn!("failed to print progress: {:#}", &error),
                }
            }
        }
    }
}

/// Runs `func` on a runtime configured by `runtime`.
///
/// Returns the summary on success. On failure the error is printed (unless quiet) and `None`
/// is returned; callers turn that into a non-zero exit status.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    meter: Arc<ProgressMeter>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let progress = match progress
        .map(|settings| settings.resolve(std::io::stderr().is_terminal()))
        .transpose()
    {
        Ok(progress) => progress,
        Err(error) => {
            if !output.quiet {
                eprintln!("{error}");
            }
            return None;
        }
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = tokio_runtime.block_on(async {
        let stop = Arc::new(tokio::sync::Notify::new());
        let progress_task = progress.map(|(progress_type, delay)| {
            tokio::spawn(show_progress(
                progress_type,
                delay,
                Arc::clone(&meter),
                Arc::clone(&stop),
            ))
        });
        let res = func().await;
        if let Some(progress_task) = progress_task {
            stop.notify_one();
            if let Err(error) = progress_task.await {
                tracing::warn!("progress reporting failed: {}", &error);
            }
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_progress_follows_terminal() {
        let settings = ProgressSettings::default();
        assert_eq!(
            settings.resolve(true),
            Ok((ProgressType::ProgressBar, PROGRESS_BAR_DELAY))
        );
        assert_eq!(
            settings.resolve(false),
            Ok((ProgressType::TextUpdates, TEXT_UPDATES_DELAY))
        );
    }

    #[test]
    fn progress_delay_is_parsed() {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("1s 500ms".to_string()),
        };
        assert_eq!(
            settings.resolve(true),
            Ok((
                ProgressType::TextUpdates,
                std::time::Duration::from_millis(1500)
            ))
        );
        let bad = ProgressSettings {
            progress_delay: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(bad.resolve(false).is_err());
        let zero = ProgressSettings {
            progress_delay: Some("0s".to_string()),
            ..Default::default()
        };
        assert!(zero.resolve(false).is_err());
    }
}
