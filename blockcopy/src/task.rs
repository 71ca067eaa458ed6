//! Bookkeeping for claimed copy ranges
//!
//! A `CopyTask` is a cluster aligned range whose dirty bits were cleared when it was
//! claimed. While the task is registered in `ActiveTasks` no other request may claim any
//! part of it; requests that run into it wait on the task's queue, which is woken whenever
//! the task gives up part of its range or finishes.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::Notify;

/// Failure record shared by all tasks started from one copy call. Only the first failure
/// is kept.
#[derive(Debug, Default)]
pub(crate) struct CallState {
    error_is_read: OnceLock<bool>,
}

impl CallState {
    pub(crate) fn fail(&self, error_is_read: bool) {
        let _ = self.error_is_read.set(error_is_read);
    }

    pub(crate) fn failed(&self) -> bool {
        self.error_is_read.get().is_some()
    }

    /// `None` while no task of the call failed.
    pub(crate) fn error_is_read(&self) -> Option<bool> {
        self.error_is_read.get().copied()
    }
}

#[derive(Debug)]
pub(crate) struct CopyTask {
    pub(crate) id: u64,
    pub(crate) offset: u64,
    pub(crate) bytes: u64,
    /// Source reads as zeroes, so the target only needs a zero fill.
    pub(crate) zeroes: bool,
    pub(crate) call: Arc<CallState>,
}

impl CopyTask {
    pub(crate) fn end(&self) -> u64 {
        self.offset + self.bytes
    }
}

#[derive(Debug)]
struct ActiveTask {
    id: u64,
    offset: u64,
    bytes: u64,
    queue: Arc<Notify>,
}

impl ActiveTask {
    fn overlaps(&self, offset: u64, bytes: u64) -> bool {
        self.offset < offset + bytes && offset < self.offset + self.bytes
    }
}

/// Ranges currently claimed by running tasks.
#[derive(Debug, Default)]
pub(crate) struct ActiveTasks {
    tasks: Vec<ActiveTask>,
    next_id: u64,
    in_flight: u64,
}

impl ActiveTasks {
    pub(crate) fn insert(&mut self, offset: u64, bytes: u64) -> u64 {
        debug_assert!(
            self.find_conflict(offset, bytes).is_none(),
            "claimed range [{offset}, +{bytes}) overlaps an active task"
        );
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight += bytes;
        self.tasks.push(ActiveTask {
            id,
            offset,
            bytes,
            queue: Arc::new(Notify::new()),
        });
        id
    }

    /// Reduces task `id` to its first `bytes` bytes and returns its wait queue.
    pub(crate) fn shrink(&mut self, id: u64, bytes: u64) -> Option<Arc<Notify>> {
        let task = self.tasks.iter_mut().find(|task| task.id == id)?;
        debug_assert!(bytes > 0 && bytes < task.bytes);
        self.in_flight -= task.bytes - bytes;
        task.bytes = bytes;
        Some(task.queue.clone())
    }

    /// Unregisters task `id` and returns its wait queue.
    pub(crate) fn remove(&mut self, id: u64) -> Option<Arc<Notify>> {
        let index = self.tasks.iter().position(|task| task.id == id)?;
        let task = self.tasks.swap_remove(index);
        self.in_flight -= task.bytes;
        Some(task.queue)
    }

    /// Wait queue of some task overlapping `[offset, offset + bytes)`.
    pub(crate) fn find_conflict(&self, offset: u64, bytes: u64) -> Option<Arc<Notify>> {
        self.tasks
            .iter()
            .find(|task| task.overlaps(offset, bytes))
            .map(|task| task.queue.clone())
    }

    /// Start and wait queue of the lowest active task overlapping `[offset, offset + bytes)`.
    pub(crate) fn first_conflict(&self, offset: u64, bytes: u64) -> Option<(u64, Arc<Notify>)> {
        self.tasks
            .iter()
            .filter(|task| task.overlaps(offset, bytes))
            .min_by_key(|task| task.offset)
            .map(|task| (task.offset, task.queue.clone()))
    }

    /// Whether the task owning `queue` still overlaps `[offset, offset + bytes)`.
    pub(crate) fn still_conflicts(&self, offset: u64, bytes: u64, queue: &Arc<Notify>) -> bool {
        self.tasks
            .iter()
            .any(|task| Arc::ptr_eq(&task.queue, queue) && task.overlaps(offset, bytes))
    }

    /// Sum of the lengths of all active tasks.
    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight
    }

    pub(crate) fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.tasks.iter().map(|task| (task.offset, task.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_tracks_task_lengths() {
        let mut tasks = ActiveTasks::default();
        let a = tasks.insert(0, 4096);
        let b = tasks.insert(8192, 8192);
        assert_eq!(tasks.in_flight(), 12288);
        assert!(tasks.shrink(b, 4096).is_some());
        assert_eq!(tasks.in_flight(), 8192);
        assert!(tasks.remove(a).is_some());
        assert_eq!(tasks.in_flight(), 4096);
        assert!(tasks.remove(a).is_none());
        assert_eq!(tasks.ranges().collect::<Vec<_>>(), vec![(8192, 4096)]);
    }

    #[test]
    fn conflicts_follow_current_range() {
        let mut tasks = ActiveTasks::default();
        let id = tasks.insert(4096, 8192);
        assert!(tasks.find_conflict(0, 4096).is_none());
        let queue = tasks.find_conflict(0, 8192).unwrap();
        assert!(tasks.still_conflicts(8192, 4096, &queue));
        tasks.shrink(id, 4096);
        // the dropped tail is free again
        assert!(!tasks.still_conflicts(8192, 4096, &queue));
        assert!(tasks.find_conflict(8192, 4096).is_none());
        tasks.remove(id);
        assert!(tasks.first_conflict(0, 8192).is_none());
        assert!(!tasks.still_conflicts(0, 8192, &queue));
    }

    #[test]
    fn first_conflict_is_the_lowest_overlap() {
        let mut tasks = ActiveTasks::default();
        tasks.insert(8192, 4096);
        tasks.insert(4096, 4096);
        let (start, queue) = tasks.first_conflict(0, 16384).unwrap();
        assert_eq!(start, 4096);
        assert!(tasks.still_conflicts(0, 8192, &queue));
        assert_eq!(tasks.first_conflict(8192, 8192).unwrap().0, 8192);
        assert!(tasks.first_conflict(12288, 4096).is_none());
    }

    #[test]
    fn call_state_keeps_first_failure() {
        let call = CallState::default();
        assert!(!call.failed());
        call.fail(true);
        call.fail(false);
        assert!(call.failed());
        assert_eq!(call.error_is_read(), Some(true));
    }
}
