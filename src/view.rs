//! Snapshot views over a [`TimedMap`].
//!
//! Nothing here borrows the map's internal storage. Key, value and entry
//! listings are copies taken while walking the map; entries written during
//! the walk may or may not appear. [`EntryView`] pairs such a copy with a
//! mutator that writes through the map's own `replace`.

use std::hash::Hash;

use crate::{backing::BackingStore, clock::Instant, store::TimedMap};

impl<K, V, B> TimedMap<K, V, B>
where
    B: BackingStore<K, V>,
    K: Clone,
    V: Clone + PartialEq,
{
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        self.backing().for_each(|key, _| keys.push(key.clone()));
        keys
    }

    /// Values without their timestamps.
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.len());
        self.backing()
            .for_each(|_, entry| values.push(entry.value().clone()));
        values
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        let mut entries = Vec::with_capacity(self.len());
        self.backing()
            .for_each(|key, entry| entries.push((key.clone(), entry.value().clone())));
        entries
    }

    pub fn entry_views(&self) -> Vec<EntryView<'_, K, V, B>> {
        let mut views = Vec::with_capacity(self.len());
        self.backing().for_each(|key, entry| {
            views.push(EntryView {
                map: self,
                key: key.clone(),
                value: entry.value().clone(),
                timestamp: entry.timestamp(),
            })
        });
        views
    }
}

/// One key/value pair of a [`TimedMap`], as seen when the view was taken.
pub struct EntryView<'a, K, V, B> {
    map: &'a TimedMap<K, V, B>,
    key: K,
    value: V,
    timestamp: Instant,
}

impl<'a, K, V, B> EntryView<'a, K, V, B>
where
    B: BackingStore<K, V>,
    K: Hash + Eq,
    V: Clone + PartialEq,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Writes `value` to the map as one `replace`, giving it a fresh
    /// timestamp, and returns the value it displaced.
    ///
    /// If the key was removed since the view was taken nothing is written,
    /// `None` is returned and the view keeps its old value.
    pub fn set_value(&mut self, value: V) -> Option<V> {
        let (previous, written_at) = self.map.replace_stamped(&self.key, value.clone())?;

        self.value = value;
        self.timestamp = written_at;

        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::time::Duration;

    fn setup_map() -> TimedMap<String, u32> {
        MockClock::set_time(Duration::ZERO);
        let map = TimedMap::new();
        map.put("a".into(), 1);
        map.put("b".into(), 2);
        map
    }

    #[test]
    fn test_snapshots() {
        let map = setup_map();

        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, ["a", "b"]);

        let mut values = map.values();
        values.sort();
        assert_eq!(values, [1, 2]);

        let mut entries = map.entries();
        entries.sort();
        assert_eq!(entries, [("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let map = setup_map();
        let values = map.values();

        map.put("c".into(), 3);
        map.remove("a");

        assert_eq!(values.len(), 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_set_value_refreshes_timestamp() {
        let map = setup_map();
        MockClock::advance(Duration::from_millis(40));

        let mut views = map.entry_views();
        let view = views.iter_mut().find(|view| view.key() == "a").unwrap();
        assert_eq!(map.elapsed_millis("a"), 40);

        assert_eq!(view.set_value(10), Some(1));
        assert_eq!(view.value(), &10);
        assert_eq!(Some(view.timestamp()), map.timestamp("a"));

        assert_eq!(map.get("a"), Some(10));
        assert_eq!(map.elapsed_millis("a"), 0);
        assert_eq!(map.elapsed_millis("b"), 40);
    }

    #[test]
    fn test_set_value_after_removal_is_noop() {
        let map = setup_map();
        let mut views = map.entry_views();
        let view = views.iter_mut().find(|view| view.key() == "b").unwrap();

        map.remove("b");

        assert_eq!(view.set_value(20), None);
        assert_eq!(view.value(), &2);
        assert!(!map.contains_key("b"));
    }

    #[test]
    fn test_set_value_keeps_its_own_timestamp() {
        let map = setup_map();
        let mut views = map.entry_views();
        let view = views.iter_mut().find(|view| view.key() == "a").unwrap();

        MockClock::advance(Duration::from_millis(10));
        view.set_value(10);
        let written_at = view.timestamp();

        MockClock::advance(Duration::from_millis(10));
        map.put("a".into(), 11);

        assert_eq!(view.timestamp(), written_at);
        assert_eq!(view.value(), &10);
        assert_ne!(map.timestamp("a"), Some(written_at));
    }
}
