//! Progress accounting for copy operations
//!
//! [`ProgressMeter`] is the sink the copy engine reports to: bytes done as tasks finish and
//! the bytes still remaining whenever the dirty set changes outside of a task (skipped or
//! reset ranges). [`ProgressPrinter`] turns a meter into periodic text updates.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event, instrument};

/// Callback invoked with the number of bytes each successful copy task completed.
pub type ProgressCallback = std::sync::Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<parking_lot::Mutex<u64>>,
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| parking_lot::Mutex::new(0));
        *mutex.lock() += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a [`ProgressMeter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub done: u64,
    pub total: u64,
    pub tasks: u64,
}

impl Status {
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.done)
    }
}

/// Thread-safe done/total byte counters.
#[derive(Debug)]
pub struct ProgressMeter {
    done: TlsCounter,
    tasks: TlsCounter,
    total: AtomicU64,
    start_time: std::time::Instant,
}

impl ProgressMeter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            done: TlsCounter::new(),
            tasks: TlsCounter::new(),
            total: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn work_done(&self, bytes: u64) {
        self.done.add(bytes);
        self.tasks.inc();
    }

    /// Sets the amount of work still to do, on top of what is already done.
    pub fn set_remaining(&self, bytes: u64) {
        self.total.store(self.done.get() + bytes, Ordering::Release);
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            done: self.done.get(),
            total: self.total.load(Ordering::Acquire),
            tasks: self.tasks.get(),
        };
        if status.done > status.total {
            event!(
                Level::DEBUG,
                "Progress inversion - done: {}, total {}",
                status.done,
                status.total
            );
            status.total = status.done;
        }
        status
    }

    #[must_use]
    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    meter: &'a ProgressMeter,
    last_done: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    #[must_use]
    pub fn new(meter: &'a ProgressMeter) -> Self {
        Self {
            meter,
            last_done: meter.get().done,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let status = self.meter.get();
        let total_duration_secs = self.meter.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = status.done as f64 / total_duration_secs;
        let current_rate = (status.done - self.last_done) as f64 / curr_duration_secs;
        let percent = if status.total == 0 {
            100.0
        } else {
            status.done as f64 * 100.0 / status.total as f64
        };
        // update self
        self.last_done = status.done;
        self.last_update = time_now;
        Ok(format!(
            "-----------------------\n\
            COPIED:\n\
            done:      {:>10} ({:.1}%)\n\
            remaining: {:>10}\n\
            tasks:     {:>10}\n\
            average:   {:>10}/s\n\
            current:   {:>10}/s",
            bytesize::ByteSize(status.done),
            percent,
            bytesize::ByteSize(status.remaining()),
            status.tasks,
            bytesize::ByteSize(average_rate as u64),
            bytesize::ByteSize(current_rate as u64),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn remaining_is_relative_to_done() {
        let meter = ProgressMeter::new();
        meter.set_remaining(300);
        meter.work_done(100);
        assert_eq!(meter.get().remaining(), 200);
        meter.set_remaining(50);
        let status = meter.get();
        assert_eq!(status.total, 150);
        assert_eq!(status.tasks, 1);
        // work reported past the announced total never shows negative remaining
        meter.work_done(100);
        assert_eq!(meter.get().remaining(), 0);
    }

    #[test]
    fn printer_reports_totals() -> Result<()> {
        let meter = ProgressMeter::new();
        meter.set_remaining(2048);
        meter.work_done(1024);
        let mut printer = ProgressPrinter::new(&meter);
        let text = printer.print()?;
        assert!(text.contains("50.0%"));
        Ok(())
    }
}
