//! Bounded-concurrency pool for copy tasks
//!
//! Tasks are spawned onto a [`tokio::task::JoinSet`]; at most `max_busy` of them run at a
//! time. The first error reported by a task is kept (sticky) and exposed through
//! [`TaskPool::status`] so that the caller can stop scheduling new work, but a failure never
//! aborts sibling tasks. Outputs of successful tasks are folded together with `Add`.

use crate::error::Error;

pub struct TaskPool<T> {
    max_busy: usize,
    join_set: tokio::task::JoinSet<Result<T, Error>>,
    status: Option<Error>,
    output: T,
}

impl<T> std::fmt::Debug for TaskPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("max_busy", &self.max_busy)
            .field("busy", &self.join_set.len())
            .field("status", &self.status)
            .finish()
    }
}

impl<T> TaskPool<T>
where
    T: Default + std::ops::Add<Output = T> + Send + 'static,
{
    /// # Panics
    ///
    /// Panics if `max_busy` is 0.
    #[must_use]
    pub fn new(max_busy: usize) -> Self {
        assert!(max_busy > 0, "task pool needs room for at least one task");
        Self {
            max_busy,
            join_set: tokio::task::JoinSet::new(),
            status: None,
            output: T::default(),
        }
    }

    /// Number of started tasks that were not reaped yet.
    #[must_use]
    pub fn busy_tasks(&self) -> usize {
        self.join_set.len()
    }

    /// First error reported by a task, `None` while all tasks succeeded.
    #[must_use]
    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.is_none()
    }

    /// Waits for room and spawns `task`; does not wait for it to complete.
    pub async fn start<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.wait_slot().await;
        self.join_set.spawn(task);
    }

    /// Suspends until fewer than `max_busy` tasks are running.
    pub async fn wait_slot(&mut self) {
        self.reap_finished();
        while self.join_set.len() >= self.max_busy {
            self.wait_one().await;
        }
    }

    /// Suspends until one running task completes. Returns immediately if nothing is running.
    pub async fn wait_one(&mut self) {
        if let Some(res) = self.join_set.join_next().await {
            self.record(res);
        }
    }

    pub async fn wait_all(&mut self) {
        while !self.join_set.is_empty() {
            self.wait_one().await;
        }
    }

    /// Combined output of successful tasks and the sticky status.
    ///
    /// Tasks still running are detached; call [`TaskPool::wait_all`] first to account for them.
    pub fn into_parts(mut self) -> (T, Result<(), Error>) {
        self.join_set.detach_all();
        let output = std::mem::take(&mut self.output);
        match self.status.take() {
            Some(error) => (output, Err(error)),
            None => (output, Ok(())),
        }
    }

    fn reap_finished(&mut self) {
        while let Some(res) = self.join_set.try_join_next() {
            self.record(res);
        }
    }

    fn record(&mut self, res: Result<Result<T, Error>, tokio::task::JoinError>) {
        let error = match res {
            Ok(Ok(output)) => {
                self.output = std::mem::take(&mut self.output) + output;
                return;
            }
            Ok(Err(error)) => error,
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic());
            }
            Err(join_error) => {
                tracing::debug!("pool task was aborted: {}", &join_error);
                Error::Cancelled
            }
        };
        match &self.status {
            // a cancellation never hides a real error
            Some(current) if !current.is_cancelled() || error.is_cancelled() => {
                tracing::debug!("ignoring additional task error: {:#}", &error);
            }
            _ => self.status = Some(error),
        }
    }
}
