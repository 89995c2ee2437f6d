use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Result, StratumError, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameRecord {
    /// The last k access timestamps (most recent at back)
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameRecord {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Ordering key within the evictable sets. With the history capped at k
    /// entries, the front is the first access for a frame with fewer than k
    /// accesses and the k-th most recent access otherwise - exactly the
    /// key each set orders by.
    fn order_key(&self) -> Timestamp {
        *self.history.front().expect("tracked frame has no history")
    }

    fn has_full_history(&self, k: usize) -> bool {
        self.history.len() >= k
    }
}

/// LRU-K replacement policy.
///
/// The victim is the evictable frame with the largest backward k-distance:
/// the difference between the current timestamp and the timestamp of the
/// k-th most recent access. Frames with fewer than k accesses count as
/// infinitely distant and are preferred, FIFO by their first access.
///
/// Evictable frames are kept in two ordered sets: `history_set` holds
/// frames with fewer than k accesses ordered by first access, `cache_set`
/// holds frames with at least k accesses ordered by k-th most recent
/// access. Eviction pops the oldest entry of the history set, falling back
/// to the cache set.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    num_frames: usize,
    inner: Mutex<ReplacerInner>,
}

struct ReplacerInner {
    /// Logical clock, bumped on every recorded access
    current_timestamp: Timestamp,
    /// Access records for all tracked frames, evictable or not
    records: HashMap<FrameId, FrameRecord>,
    /// Evictable frames with fewer than k accesses, keyed by first access
    history_set: BTreeSet<(Timestamp, FrameId)>,
    /// Evictable frames with at least k accesses, keyed by k-th most
    /// recent access
    cache_set: BTreeSet<(Timestamp, FrameId)>,
}

impl ReplacerInner {
    /// Removes the frame's entry from whichever evictable set holds it.
    fn detach(&mut self, frame_id: FrameId, record: &FrameRecord, k: usize) {
        let entry = (record.order_key(), frame_id);
        if record.has_full_history(k) {
            self.cache_set.remove(&entry);
        } else {
            self.history_set.remove(&entry);
        }
    }

    /// Inserts the frame into the evictable set matching its history depth.
    fn attach(&mut self, frame_id: FrameId, record: &FrameRecord, k: usize) {
        let entry = (record.order_key(), frame_id);
        if record.has_full_history(k) {
            self.cache_set.insert(entry);
        } else {
            self.history_set.insert(entry);
        }
    }
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum
    /// frame count.
    pub fn new(k: usize, num_frames: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            k,
            num_frames,
            inner: Mutex::new(ReplacerInner {
                current_timestamp: 0,
                records: HashMap::new(),
                history_set: BTreeSet::new(),
                cache_set: BTreeSet::new(),
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance and drops it
    /// from tracking. Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        let victim = inner
            .history_set
            .first()
            .or_else(|| inner.cache_set.first())
            .map(|&(_, frame_id)| frame_id)?;

        let record = inner
            .records
            .remove(&victim)
            .expect("evictable frame has a record");
        inner.detach(victim, &record, self.k);
        Some(victim)
    }

    /// Records that the given frame was accessed now. A frame seen for the
    /// first time becomes tracked but starts non-evictable.
    pub fn record_access(&self, frame_id: FrameId) -> Result<()> {
        if frame_id.as_usize() >= self.num_frames {
            return Err(StratumError::InvalidFrameId(frame_id));
        }

        let mut inner = self.inner.lock();
        let timestamp = inner.current_timestamp;
        inner.current_timestamp += 1;

        let mut record = inner
            .records
            .remove(&frame_id)
            .unwrap_or_else(FrameRecord::new);
        if record.is_evictable {
            inner.detach(frame_id, &record, self.k);
        }
        record.record_access(timestamp, self.k);
        if record.is_evictable {
            inner.attach(frame_id, &record, self.k);
        }
        inner.records.insert(frame_id, record);
        Ok(())
    }

    /// Sets whether a frame is evictable. Unknown frames are a no-op.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        let mut inner = self.inner.lock();

        let Some(mut record) = inner.records.remove(&frame_id) else {
            return;
        };
        if record.is_evictable != is_evictable {
            record.is_evictable = is_evictable;
            if is_evictable {
                inner.attach(frame_id, &record, self.k);
            } else {
                inner.detach(frame_id, &record, self.k);
            }
        }
        inner.records.insert(frame_id, record);
    }

    /// Removes a frame from the replacer entirely. Unknown frames are a
    /// no-op; removing a tracked non-evictable frame is a contract error.
    pub fn remove(&self, frame_id: FrameId) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.records.get(&frame_id) {
            None => Ok(()),
            Some(record) if !record.is_evictable => {
                Err(StratumError::FrameNotEvictable(frame_id))
            }
            Some(_) => {
                if let Some(record) = inner.records.remove(&frame_id) {
                    inner.detach(frame_id, &record, self.k);
                }
                Ok(())
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.history_set.len() + inner.cache_set.len()
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_basic() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.record_access(FrameId::new(2)).unwrap();

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        assert_eq!(replacer.size(), 3);

        // All have a single access (less than k=2), so all sit in the
        // history set; the earliest first access goes first
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_lru_k_replacer_infinite_distance_first() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has fewer than k accesses and is infinitely distant
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_largest_k_distance() {
        let replacer = LruKReplacer::new(2, 10);

        for id in 0..3u32 {
            replacer.record_access(FrameId::new(id)).unwrap();
            replacer.record_access(FrameId::new(id)).unwrap();
            replacer.set_evictable(FrameId::new(id), true);
        }

        // All histories are full; frame 0's second-most-recent access is
        // oldest, so it has the largest k-distance
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_lru_k_replacer_history_capped_at_k() {
        let replacer = LruKReplacer::new(2, 10);

        for _ in 0..10 {
            replacer.record_access(FrameId::new(0)).unwrap();
        }
        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 0's k-distance is measured from its recent accesses only,
        // which are older than frame 1's
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_set_evictable_unknown_is_noop() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.set_evictable(FrameId::new(5), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_replacer_record_access_invalid_frame() {
        let replacer = LruKReplacer::new(2, 4);
        let err = replacer.record_access(FrameId::new(4)).unwrap_err();
        assert!(matches!(err, StratumError::InvalidFrameId(_)));
    }

    #[test]
    fn test_lru_k_replacer_remove() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 2);
        replacer.remove(FrameId::new(0)).unwrap();
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_remove_non_evictable_fails() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        let err = replacer.remove(FrameId::new(0)).unwrap_err();
        assert!(matches!(err, StratumError::FrameNotEvictable(_)));

        // Unknown frames are a plain no-op
        replacer.remove(FrameId::new(7)).unwrap();
    }
}
