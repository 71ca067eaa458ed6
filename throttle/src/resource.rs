use std::sync::Arc;

/// Bounded budget shared between cooperating tasks, e.g. bytes of buffer memory.
///
/// [`SharedResource::acquire`] deducts immediately when enough of the budget is
/// available and otherwise suspends the caller until enough is released. Waiters
/// are served in FIFO order, so a waiter is never starved as long as every
/// reservation is eventually released.
#[derive(Debug, Clone)]
pub struct SharedResource {
    capacity: u32,
    sem: Arc<tokio::sync::Semaphore>,
}

/// Outstanding part of a [`SharedResource`] budget. Returned to the resource when dropped.
#[derive(Debug)]
pub struct Reservation {
    permit: tokio::sync::OwnedSemaphorePermit,
}

impl Reservation {
    /// Amount actually reserved, which may be less than requested (see [`SharedResource::acquire`]).
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.permit.num_permits() as u64
    }

    /// Returns the reservation to the resource and wakes pending waiters.
    pub fn release(self) {
        drop(self);
    }
}

impl SharedResource {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "shared resource capacity must be non-zero");
        Self {
            capacity,
            sem: Arc::new(tokio::sync::Semaphore::new(capacity as usize)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        u64::from(self.capacity)
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.sem.available_permits() as u64
    }

    /// Reserves `amount` units, suspending until they are available.
    ///
    /// A request larger than the whole capacity is reduced to the capacity, so that
    /// it can always make progress once every other reservation is released.
    pub async fn acquire(&self, amount: u64) -> Reservation {
        let amount = u32::try_from(amount)
            .unwrap_or(u32::MAX)
            .min(self.capacity);
        if self.sem.available_permits() < amount as usize {
            tracing::trace!("waiting for {} units, {} available", amount, self.available());
        }
        let permit = Arc::clone(&self.sem)
            .acquire_many_owned(amount)
            .await
            .expect("shared resource semaphore is never closed");
        Reservation { permit }
    }
}
