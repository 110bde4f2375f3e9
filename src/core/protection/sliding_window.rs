// Sliding window counter - per (guild, subject, rule) event timestamps.
//
// Each window is a sorted deque of millisecond timestamps. Appends go on the
// back, pruning pops from the front, so record() is O(1) amortized.
//
// Mutation of one key happens under its DashMap shard lock and never across
// an await, which serializes writers of the same key while other keys proceed.

use super::protection_models::span_ms;
use super::ProtectionError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Identifies one tracked sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub guild_id: u64,
    pub subject_key: u64,
    pub rule_id: String,
}

impl WindowKey {
    pub fn new(guild_id: u64, subject_key: u64, rule_id: impl Into<String>) -> Self {
        Self {
            guild_id,
            subject_key,
            rule_id: rule_id.into(),
        }
    }
}

#[derive(Debug)]
struct Window {
    window_ms: u64,
    stamps: VecDeque<i64>,
}

impl Window {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            stamps: VecDeque::new(),
        }
    }

    fn insert(&mut self, timestamp_ms: i64) {
        // Events from different shards can land slightly out of order
        match self.stamps.back() {
            Some(&last) if timestamp_ms < last => {
                let pos = self.stamps.partition_point(|&t| t <= timestamp_ms);
                self.stamps.insert(pos, timestamp_ms);
            }
            _ => self.stamps.push_back(timestamp_ms),
        }
    }

    /// Drop everything older than `now - window_ms`.
    fn prune(&mut self, now: i64) {
        let cutoff = now.saturating_sub(span_ms(self.window_ms));
        while matches!(self.stamps.front(), Some(&t) if t < cutoff) {
            self.stamps.pop_front();
        }
    }
}

pub struct SlidingWindowCounter {
    windows: DashMap<WindowKey, Window>,
    max_keys: usize,
}

impl SlidingWindowCounter {
    pub fn new(max_keys: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_keys,
        }
    }

    /// Append an event and return how many events remain inside the window.
    ///
    /// New keys are refused with `CapacityExceeded` once `max_keys` distinct
    /// windows exist. The cap is checked before taking the shard lock, so
    /// concurrent inserts can overshoot it by a handful of keys.
    pub fn record(
        &self,
        key: &WindowKey,
        window_ms: u64,
        timestamp_ms: i64,
    ) -> Result<usize, ProtectionError> {
        if !self.windows.contains_key(key) && self.windows.len() >= self.max_keys {
            return Err(ProtectionError::CapacityExceeded {
                limit: self.max_keys,
            });
        }

        match self.windows.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                // Hot-reloaded rules may change the window length
                window.window_ms = window_ms;
                window.insert(timestamp_ms);
                let newest = window.stamps.back().copied().unwrap_or(timestamp_ms);
                window.prune(newest);

                let count = window.stamps.len();
                if count == 0 {
                    entry.remove();
                }
                Ok(count)
            }
            Entry::Vacant(entry) => {
                let mut window = Window::new(window_ms);
                window.insert(timestamp_ms);
                entry.insert(window);
                Ok(1)
            }
        }
    }

    /// Read-only count of events in `[now - window_ms, now]`.
    #[allow(dead_code)]
    pub fn count(&self, key: &WindowKey, window_ms: u64, now: i64) -> usize {
        let cutoff = now.saturating_sub(span_ms(window_ms));
        self.windows
            .get(key)
            .map(|w| {
                w.stamps
                    .iter()
                    .filter(|&&t| t >= cutoff && t <= now)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remove the backing sequence if pruning left it empty.
    #[allow(dead_code)]
    pub fn evict_if_empty(&self, key: &WindowKey) -> bool {
        self.windows
            .remove_if(key, |_, window| window.stamps.is_empty())
            .is_some()
    }

    /// Prune every window against `now` and drop the ones left empty.
    /// Returns how many keys were evicted.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.stamps.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Forget every window belonging to a guild.
    pub fn purge_guild(&self, guild_id: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|key, _| key.guild_id != guild_id);
        before.saturating_sub(self.windows.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Total timestamps held across all windows.
    pub fn tracked_events(&self) -> usize {
        self.windows.iter().map(|w| w.stamps.len()).sum()
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subject: u64) -> WindowKey {
        WindowKey::new(1, subject, "anti_spam")
    }

    #[test]
    fn test_count_matches_window_after_each_record() {
        let counter = SlidingWindowCounter::new(100);
        let k = key(42);
        let stamps = [0, 1_000, 2_500, 9_000, 10_000, 10_001, 15_000, 30_000];

        for (i, &t) in stamps.iter().enumerate() {
            let returned = counter.record(&k, 10_000, t).unwrap();
            let expected = stamps[..=i].iter().filter(|&&s| s >= t - 10_000).count();
            assert_eq!(returned, expected, "after t={}", t);
            assert_eq!(counter.count(&k, 10_000, t), expected);
        }
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let counter = SlidingWindowCounter::new(100);
        let k = key(1);
        counter.record(&k, 10_000, 0).unwrap();

        // Exactly windowMs later the first event is still inside
        assert_eq!(counter.record(&k, 10_000, 10_000).unwrap(), 2);
        assert_eq!(counter.record(&k, 10_000, 10_001).unwrap(), 2);
    }

    #[test]
    fn test_out_of_order_events_stay_sorted() {
        let counter = SlidingWindowCounter::new(100);
        let k = key(5);
        counter.record(&k, 10_000, 5_000).unwrap();
        counter.record(&k, 10_000, 3_000).unwrap();
        assert_eq!(counter.record(&k, 10_000, 6_000).unwrap(), 3);
        assert_eq!(counter.count(&k, 10_000, 13_500), 2);
    }

    #[test]
    fn test_capacity_exceeded_only_for_new_keys() {
        let counter = SlidingWindowCounter::new(2);
        counter.record(&key(1), 1_000, 0).unwrap();
        counter.record(&key(2), 1_000, 0).unwrap();

        let err = counter.record(&key(3), 1_000, 0).unwrap_err();
        assert!(matches!(err, ProtectionError::CapacityExceeded { limit: 2 }));

        // Existing keys keep counting
        assert_eq!(counter.record(&key(1), 1_000, 10).unwrap(), 2);
    }

    #[test]
    fn test_sweep_returns_footprint_to_zero() {
        let counter = SlidingWindowCounter::new(100);
        for subject in 0..10 {
            for t in 0..5 {
                counter.record(&key(subject), 5_000, t * 100).unwrap();
            }
        }
        assert_eq!(counter.len(), 10);
        assert_eq!(counter.tracked_events(), 50);

        // Nothing aged out yet
        assert_eq!(counter.sweep(4_000), 0);

        assert_eq!(counter.sweep(60_000), 10);
        assert!(counter.is_empty());
        assert_eq!(counter.tracked_events(), 0);
    }

    #[test]
    fn test_evict_if_empty_keeps_live_windows() {
        let counter = SlidingWindowCounter::new(100);
        let k = key(9);
        counter.record(&k, 1_000, 0).unwrap();
        assert!(!counter.evict_if_empty(&k));
        assert_eq!(counter.len(), 1);
    }

    #[test]
    fn test_purge_guild_only_touches_that_guild() {
        let counter = SlidingWindowCounter::new(100);
        counter.record(&WindowKey::new(1, 42, "r"), 1_000, 0).unwrap();
        counter.record(&WindowKey::new(1, 43, "r"), 1_000, 0).unwrap();
        counter.record(&WindowKey::new(2, 42, "r"), 1_000, 0).unwrap();

        assert_eq!(counter.purge_guild(1), 2);
        assert_eq!(counter.len(), 1);
        assert_eq!(counter.count(&WindowKey::new(2, 42, "r"), 1_000, 0), 1);
    }
}
