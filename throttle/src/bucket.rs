/// Token bucket on top of a tokio semaphore; each permit is one token.
///
/// Taken tokens are forgotten rather than returned, and [`TokenBucket::refill`] tops the
/// bucket back up to its size.
#[derive(Debug)]
pub struct TokenBucket {
    size: u32,
    tokens: tokio::sync::Semaphore,
}

impl TokenBucket {
    /// A full bucket holding `size` tokens.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            tokens: tokio::sync::Semaphore::new(size as usize),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Waits for `count` tokens and removes them from the bucket.
    pub async fn take(&self, count: u32) {
        if count == 0 {
            return;
        }
        // the semaphore is never closed
        if let Ok(permit) = self.tokens.acquire_many(count.min(self.size)).await {
            permit.forget();
        }
    }

    /// Adds whatever is missing to make the bucket full again.
    pub fn refill(&self) {
        let available = self.tokens.available_permits();
        let size = self.size as usize;
        if available < size {
            self.tokens.add_permits(size - available);
        }
    }

    /// Refills the bucket every `interval`, forever.
    pub async fn run_refill(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately and the bucket starts full
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refill_tops_up_to_size() {
        let bucket = TokenBucket::new(10);
        bucket.take(7).await;
        assert_eq!(bucket.tokens.available_permits(), 3);
        bucket.refill();
        assert_eq!(bucket.tokens.available_permits(), 10);
        // never grows past its size
        bucket.refill();
        assert_eq!(bucket.tokens.available_permits(), 10);
    }
}
