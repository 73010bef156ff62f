use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    time::Duration,
};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{
    backing::{BackingStore, CasError},
    clock::Instant,
    entry::Entry,
};

/// A concurrent map that remembers when each key last had its value written.
///
/// Reads never refresh a timestamp, and neither do conditional writes that
/// fail. Every conditional operation is a single compare-and-swap against the
/// backing store's per-key slot, so unrelated keys never wait on each other.
///
/// ```
/// use timed_kv::TimedMap;
///
/// let heartbeats = TimedMap::new();
/// heartbeats.put("worker-1", 7);
///
/// assert_eq!(heartbeats.get("worker-1"), Some(7));
/// assert!(heartbeats.elapsed_millis("worker-1") < 1_000);
/// assert_eq!(heartbeats.elapsed_millis("worker-2"), u64::MAX);
/// ```
pub struct TimedMap<K, V, B = DashMap<K, Entry<V>, RandomState>> {
    store: B,
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K, V> TimedMap<K, V>
where
    K: Hash + Eq,
    V: Clone + PartialEq,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(DashMap::new())
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_store(DashMap::with_capacity(capacity))
    }

    /// `shard_amount` bounds how many writers can proceed in parallel.
    ///
    /// # Panics
    ///
    /// Panics if `shard_amount` is not a power of two greater than one.
    #[must_use]
    pub fn with_capacity_and_shard_amount(capacity: usize, shard_amount: usize) -> Self {
        Self::with_store(DashMap::with_capacity_and_shard_amount(capacity, shard_amount))
    }
}

impl<K, V, S> TimedMap<K, V, DashMap<K, Entry<V>, S>>
where
    K: Hash + Eq,
    V: Clone + PartialEq,
    S: BuildHasher + Clone,
{
    #[must_use]
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_store(DashMap::with_hasher(hasher))
    }
}

impl<K, V, B> TimedMap<K, V, B>
where
    B: BackingStore<K, V>,
    V: Clone + PartialEq,
{
    pub fn with_store(store: B) -> Self {
        TimedMap {
            store,
            _marker: std::marker::PhantomData,
        }
    }

    /// Builds a map from entries that already carry their timestamps, for
    /// instance the output of [`timed_entries`](Self::timed_entries).
    pub fn from_timed_entries<I>(entries: I) -> Self
    where
        B: Default,
        I: IntoIterator<Item = (K, Entry<V>)>,
    {
        let map = Self::with_store(B::default());
        for (key, entry) in entries {
            map.store.insert(key, entry);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        debug!("Clearing map");
        self.store.clear();
    }

    /// Stores `value` stamped with the current instant.
    #[tracing::instrument(level = "trace", skip(self, key, value))]
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.store.insert(key, Entry::new(value)).map(Entry::into_value)
    }

    /// Puts every pair independently. Readers may observe the batch half applied.
    pub fn put_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    /// Inserts only if `key` has no entry. Returns the occupying value
    /// otherwise, leaving its timestamp alone.
    #[tracing::instrument(level = "trace", skip(self, key, value))]
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        self.store
            .insert_if_absent(key, Entry::new(value))
            .map(Entry::into_value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store.get_with(key, |entry| entry.value().clone())
    }

    pub fn get_entry<Q>(&self, key: &Q) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store.get_with(key, Entry::clone)
    }

    /// The instant of the last accepted write to `key`.
    pub fn timestamp<Q>(&self, key: &Q) -> Option<Instant>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store.get_with(key, Entry::timestamp)
    }

    /// How long `key` has held its current value.
    ///
    /// A key that was never written, or has been removed, is treated as
    /// arbitrarily stale: the result is `Duration::MAX`.
    pub fn elapsed_time<Q>(&self, key: &Q) -> Duration
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store
            .get_with(key, Entry::elapsed)
            .unwrap_or(Duration::MAX)
    }

    /// [`elapsed_time`](Self::elapsed_time) in whole milliseconds, saturating
    /// at `u64::MAX` for absent keys.
    pub fn elapsed_millis<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        u64::try_from(self.elapsed_time(key).as_millis()).unwrap_or(u64::MAX)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store.contains_key(key)
    }

    /// Whether any entry currently holds `value`. Timestamps are ignored.
    pub fn contains_value(&self, value: &V) -> bool {
        self.store.any(|_, entry| entry.value() == value)
    }

    #[tracing::instrument(level = "trace", skip(self, key))]
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.store.remove(key).map(Entry::into_value)
    }

    /// Removes `key` only if it currently maps to `expected`.
    ///
    /// The comparison is made against the entry read at the start of the
    /// call. If that entry is rewritten before the removal lands, nothing is
    /// removed, even when the new value also equals `expected`. Callers that
    /// need the removal to win under contention can retry.
    #[tracing::instrument(level = "trace", skip(self, key, expected))]
    pub fn remove_if<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(observed) = self.store.get_with(key, Entry::timestamp) else {
            return false;
        };

        let snapshot = Entry::at(expected.clone(), observed);
        match self.store.compare_and_remove(key, &snapshot) {
            Ok(_) => true,
            Err(err) => {
                trace!("Conditional remove refused: {}", err);
                false
            }
        }
    }

    /// Replaces the value of `key` only if it is present. The new value gets
    /// a fresh timestamp. Returns the previous value.
    #[tracing::instrument(level = "trace", skip(self, key, value))]
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.replace_stamped(key, value).map(|(previous, _)| previous)
    }

    /// Like [`replace`](Self::replace), also returning the timestamp of the
    /// entry this call wrote.
    pub(crate) fn replace_stamped<Q>(&self, key: &Q, value: V) -> Option<(V, Instant)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = Entry::new(value);
        let written_at = entry.timestamp();

        self.store
            .replace_if_present(key, entry)
            .map(|previous| (previous.into_value(), written_at))
    }

    /// Stores `new` only if `key` currently maps to `expected`.
    pub fn replace_if<Q>(&self, key: &Q, expected: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.compare_and_swap(key, expected, new).is_ok()
    }

    /// Same as [`replace_if`](Self::replace_if), reporting why a swap was
    /// refused.
    ///
    /// `CasError::Superseded` means the value matched but the entry was
    /// rewritten between the read and the swap.
    #[tracing::instrument(level = "trace", skip(self, key, expected, new))]
    pub fn compare_and_swap<Q>(&self, key: &Q, expected: &V, new: V) -> Result<(), CasError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let observed = self
            .store
            .get_with(key, Entry::timestamp)
            .ok_or(CasError::NotFound)?;

        let snapshot = Entry::at(expected.clone(), observed);
        self.store
            .compare_and_swap(key, &snapshot, Entry::new(new))
            .map(drop)
            .inspect_err(|err| trace!("Compare-and-swap refused: {}", err))
    }

    /// Point-in-time copy of every key with its full entry.
    pub fn timed_entries(&self) -> Vec<(K, Entry<V>)>
    where
        K: Clone,
    {
        let mut entries = Vec::with_capacity(self.len());
        self.store
            .for_each(|key, entry| entries.push((key.clone(), entry.clone())));
        entries
    }

    pub(crate) fn backing(&self) -> &B {
        &self.store
    }
}

impl<K, V> Default for TimedMap<K, V>
where
    K: Hash + Eq,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, B> Extend<(K, V)> for TimedMap<K, V, B>
where
    B: BackingStore<K, V>,
    V: Clone + PartialEq,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.put_all(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for TimedMap<K, V>
where
    K: Hash + Eq,
    V: Clone + PartialEq,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::new();
        map.put_all(iter);
        map
    }
}

/// Two maps are equal when they hold the same keys mapped to equal values.
/// When each value was written does not matter.
impl<K, V, B, B2> PartialEq<TimedMap<K, V, B2>> for TimedMap<K, V, B>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    B: BackingStore<K, V>,
    B2: BackingStore<K, V>,
{
    fn eq(&self, other: &TimedMap<K, V, B2>) -> bool {
        self.len() == other.len()
            && self
                .timed_entries()
                .iter()
                .all(|(key, entry)| other.get(key).as_ref() == Some(entry.value()))
    }
}

impl<K, V, B> fmt::Debug for TimedMap<K, V, B>
where
    K: fmt::Debug + Clone,
    V: fmt::Debug + Clone + PartialEq,
    B: BackingStore<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.timed_entries().into_iter().map(|(k, e)| (k, e.into_value())))
            .finish()
    }
}
