//! In-memory per-cluster dirty bitmap
//!
//! Each bit covers one cluster of `granularity` bytes. The last cluster may extend past
//! `size` when `size` is not cluster aligned; ranges handed out by
//! [`DirtyBitmap::next_dirty_area`] are always cluster aligned, so callers clamp them to
//! `size` before doing I/O.

/// Per-cluster record of not-yet-copied data.
#[derive(Debug, Clone)]
pub struct DirtyBitmap {
    granularity: u64,
    size: u64,
    words: Vec<u64>,
    dirty: u64,
    enabled: bool,
}

impl DirtyBitmap {
    /// Creates a clean, enabled bitmap covering `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is not a power of two.
    #[must_use]
    pub fn new(granularity: u64, size: u64) -> Self {
        assert!(
            granularity.is_power_of_two(),
            "bitmap granularity must be a power of two, got {granularity}"
        );
        let clusters = size.div_ceil(granularity);
        Self {
            granularity,
            size,
            words: vec![0; clusters.div_ceil(64) as usize],
            dirty: 0,
            enabled: true,
        }
    }

    #[must_use]
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn clusters(&self) -> u64 {
        self.size.div_ceil(self.granularity)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts tracking writes reported through [`DirtyBitmap::record_write`].
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stops tracking writes. Explicit [`DirtyBitmap::set_range`] calls still take effect.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Number of bytes in dirty clusters.
    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        self.dirty * self.granularity
    }

    #[must_use]
    pub fn dirty_clusters(&self) -> u64 {
        self.dirty
    }

    #[must_use]
    pub fn is_dirty(&self, offset: u64) -> bool {
        offset < self.size && self.get(offset / self.granularity)
    }

    /// Marks every cluster touched by `[offset, offset + bytes)` dirty.
    pub fn set_range(&mut self, offset: u64, bytes: u64) {
        for cluster in self.cluster_range(offset, bytes) {
            self.assign(cluster, true);
        }
    }

    /// Marks every cluster touched by `[offset, offset + bytes)` clean.
    pub fn reset_range(&mut self, offset: u64, bytes: u64) {
        for cluster in self.cluster_range(offset, bytes) {
            self.assign(cluster, false);
        }
    }

    pub fn set_all(&mut self) {
        self.set_range(0, self.size);
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.dirty = 0;
    }

    /// Records a guest write; ignored while the bitmap is disabled.
    pub fn record_write(&mut self, offset: u64, bytes: u64) {
        if self.enabled {
            self.set_range(offset, bytes);
        }
    }

    /// Offset of the first dirty cluster overlapping `[offset, end)`.
    #[must_use]
    pub fn next_dirty(&self, offset: u64, end: u64) -> Option<u64> {
        let clusters = self.cluster_range(offset, end.saturating_sub(offset));
        self.find_next(clusters.start, clusters.end, true)
            .map(|cluster| cluster * self.granularity)
    }

    /// First run of consecutive dirty clusters overlapping `[offset, end)`, at most
    /// `max_bytes` long (but always at least one cluster).
    ///
    /// Returns the cluster aligned `(offset, bytes)` of the run.
    #[must_use]
    pub fn next_dirty_area(&self, offset: u64, end: u64, max_bytes: u64) -> Option<(u64, u64)> {
        let clusters = self.cluster_range(offset, end.saturating_sub(offset));
        let first = self.find_next(clusters.start, clusters.end, true)?;
        let max_clusters = (max_bytes / self.granularity).max(1);
        let limit = clusters.end.min(first + max_clusters);
        let last = self.find_next(first, limit, false).unwrap_or(limit);
        Some((first * self.granularity, (last - first) * self.granularity))
    }

    fn cluster_range(&self, offset: u64, bytes: u64) -> std::ops::Range<u64> {
        let end = offset.saturating_add(bytes).min(self.size);
        if offset >= end {
            return 0..0;
        }
        offset / self.granularity..end.div_ceil(self.granularity)
    }

    fn get(&self, cluster: u64) -> bool {
        self.words[(cluster / 64) as usize] & (1 << (cluster % 64)) != 0
    }

    fn assign(&mut self, cluster: u64, dirty: bool) {
        if self.get(cluster) == dirty {
            return;
        }
        let word = &mut self.words[(cluster / 64) as usize];
        *word ^= 1 << (cluster % 64);
        if dirty {
            self.dirty += 1;
        } else {
            self.dirty -= 1;
        }
    }

    /// First cluster in `[from, to)` whose bit equals `dirty`.
    fn find_next(&self, from: u64, to: u64, dirty: bool) -> Option<u64> {
        let mut cluster = from;
        while cluster < to {
            let index = (cluster / 64) as usize;
            let mut word = if dirty {
                self.words[index]
            } else {
                !self.words[index]
            };
            word &= !0u64 << (cluster % 64);
            if word != 0 {
                let found = index as u64 * 64 + u64::from(word.trailing_zeros());
                return (found < to).then_some(found);
            }
            cluster = (index as u64 + 1) * 64;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CLUSTER: u64 = 64 * 1024;

    #[test]
    fn set_and_reset_count_clusters() {
        let mut bitmap = DirtyBitmap::new(CLUSTER, 10 * CLUSTER);
        assert_eq!(bitmap.dirty_count(), 0);
        bitmap.set_range(CLUSTER, 3 * CLUSTER);
        assert_eq!(bitmap.dirty_clusters(), 3);
        // setting again is idempotent
        bitmap.set_range(2 * CLUSTER, CLUSTER);
        assert_eq!(bitmap.dirty_clusters(), 3);
        bitmap.reset_range(2 * CLUSTER, CLUSTER);
        assert_eq!(bitmap.dirty_count(), 2 * CLUSTER);
        assert!(bitmap.is_dirty(CLUSTER));
        assert!(!bitmap.is_dirty(2 * CLUSTER));
        assert!(bitmap.is_dirty(3 * CLUSTER + 5));
    }

    #[test]
    fn unaligned_ranges_cover_touched_clusters() {
        let mut bitmap = DirtyBitmap::new(CLUSTER, 4 * CLUSTER);
        bitmap.set_range(CLUSTER - 1, 2);
        assert!(bitmap.is_dirty(0));
        assert!(bitmap.is_dirty(CLUSTER));
        assert_eq!(bitmap.dirty_clusters(), 2);
    }

    #[test]
    fn next_dirty_area_respects_limits() {
        let mut bitmap = DirtyBitmap::new(CLUSTER, 200 * CLUSTER);
        bitmap.set_range(70 * CLUSTER, 60 * CLUSTER);
        bitmap.set_range(140 * CLUSTER, CLUSTER);
        assert_eq!(bitmap.next_dirty(0, 200 * CLUSTER), Some(70 * CLUSTER));
        assert_eq!(
            bitmap.next_dirty_area(0, 200 * CLUSTER, u64::MAX),
            Some((70 * CLUSTER, 60 * CLUSTER))
        );
        assert_eq!(
            bitmap.next_dirty_area(0, 200 * CLUSTER, 16 * CLUSTER),
            Some((70 * CLUSTER, 16 * CLUSTER))
        );
        assert_eq!(
            bitmap.next_dirty_area(0, 100 * CLUSTER, u64::MAX),
            Some((70 * CLUSTER, 30 * CLUSTER))
        );
        assert_eq!(
            bitmap.next_dirty_area(130 * CLUSTER, 200 * CLUSTER, u64::MAX),
            Some((140 * CLUSTER, CLUSTER))
        );
        // smaller than one cluster still yields a cluster
        assert_eq!(
            bitmap.next_dirty_area(140 * CLUSTER, 200 * CLUSTER, 1),
            Some((140 * CLUSTER, CLUSTER))
        );
        assert_eq!(bitmap.next_dirty_area(141 * CLUSTER, 200 * CLUSTER, 1), None);
    }

    #[test]
    fn final_partial_cluster() {
        let size = 2 * CLUSTER + 100;
        let mut bitmap = DirtyBitmap::new(CLUSTER, size);
        assert_eq!(bitmap.clusters(), 3);
        bitmap.set_all();
        assert_eq!(bitmap.dirty_clusters(), 3);
        assert_eq!(
            bitmap.next_dirty_area(2 * CLUSTER, size, u64::MAX),
            Some((2 * CLUSTER, CLUSTER))
        );
        bitmap.reset_range(2 * CLUSTER, CLUSTER);
        assert_eq!(bitmap.dirty_clusters(), 2);
    }

    #[test]
    fn record_write_only_when_enabled() {
        let mut bitmap = DirtyBitmap::new(CLUSTER, 4 * CLUSTER);
        bitmap.disable();
        bitmap.record_write(0, CLUSTER);
        assert_eq!(bitmap.dirty_count(), 0);
        bitmap.set_range(0, CLUSTER);
        assert_eq!(bitmap.dirty_count(), CLUSTER);
        bitmap.enable();
        bitmap.record_write(3 * CLUSTER, 1);
        assert_eq!(bitmap.dirty_clusters(), 2);
        bitmap.clear();
        assert_eq!(bitmap.dirty_clusters(), 0);
        assert_eq!(bitmap.next_dirty(0, 4 * CLUSTER), None);
    }

    proptest! {
        #[test]
        fn next_dirty_area_matches_naive_scan(
            bits in proptest::collection::vec(any::<bool>(), 1..300),
            start in 0usize..300,
            max_clusters in 1u64..80,
        ) {
            let granularity = 512;
            let size = bits.len() as u64 * granularity;
            let mut bitmap = DirtyBitmap::new(granularity, size);
            for (cluster, dirty) in bits.iter().enumerate() {
                if *dirty {
                    bitmap.set_range(cluster as u64 * granularity, granularity);
                }
            }
            prop_assert_eq!(bitmap.dirty_clusters(), bits.iter().filter(|b| **b).count() as u64);
            let start = start.min(bits.len());
            let expected = bits[start..].iter().position(|b| *b).map(|found| {
                let first = start + found;
                let run = bits[first..]
                    .iter()
                    .take(max_clusters as usize)
                    .take_while(|b| **b)
                    .count();
                (first as u64 * granularity, run as u64 * granularity)
            });
            let actual = bitmap.next_dirty_area(
                start as u64 * granularity,
                size,
                max_clusters * granularity,
            );
            prop_assert_eq!(actual, expected);
        }
    }
}
