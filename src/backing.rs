use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
};

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use thiserror::Error;

use crate::entry::Entry;

/// Why a conditional replace or remove was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum CasError {
    #[error("key not found")]
    NotFound,
    #[error("stored value differs from the expected value")]
    ValuesDiffered,
    #[error("entry was rewritten after it was read")]
    Superseded,
}

/// Checks `current` against a snapshot taken earlier.
///
/// The value is compared first, so a caller that guessed the wrong value gets
/// `ValuesDiffered` even if the entry was also rewritten in between.
pub fn check_snapshot<V: PartialEq>(current: &Entry<V>, snapshot: &Entry<V>) -> Result<(), CasError> {
    if current.value() != snapshot.value() {
        return Err(CasError::ValuesDiffered);
    }

    if current.timestamp() != snapshot.timestamp() {
        return Err(CasError::Superseded);
    }

    Ok(())
}

/// The concurrent associative store a [`TimedMap`](crate::TimedMap) keeps its
/// entries in.
///
/// Each method must be atomic with respect to the key it touches. None of them
/// may hold a lock covering the whole map for longer than the store's own
/// internal bookkeeping needs.
pub trait BackingStore<K, V> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or overwrites, returning the entry that was there.
    fn insert(&self, key: K, entry: Entry<V>) -> Option<Entry<V>>;

    /// Inserts only if `key` is vacant. Returns the occupying entry otherwise.
    fn insert_if_absent(&self, key: K, entry: Entry<V>) -> Option<Entry<V>>;

    /// Overwrites only if `key` is occupied, returning the entry that was there.
    fn replace_if_present<Q>(&self, key: &Q, entry: Entry<V>) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;

    /// Runs `f` on the current entry under the store's per-key lock.
    fn get_with<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Entry<V>) -> R;

    fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;

    fn remove<Q>(&self, key: &Q) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;

    /// Swaps in `new` only if the current entry equals `snapshot`, value and
    /// timestamp both. Returns the replaced entry.
    fn compare_and_swap<Q>(
        &self,
        key: &Q,
        snapshot: &Entry<V>,
        new: Entry<V>,
    ) -> Result<Entry<V>, CasError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;

    /// Removes the entry only if it equals `snapshot`. Returns the removed entry.
    fn compare_and_remove<Q>(&self, key: &Q, snapshot: &Entry<V>) -> Result<Entry<V>, CasError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;

    fn clear(&self);

    /// Visits the current entries one at a time. Entries written during the
    /// walk may or may not be seen. `f` must not call back into the store.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &Entry<V>);

    /// Like [`for_each`](Self::for_each) but stops at the first `true`.
    fn any<F>(&self, f: F) -> bool
    where
        F: FnMut(&K, &Entry<V>) -> bool;
}

impl<K, V, S> BackingStore<K, V> for DashMap<K, Entry<V>, S>
where
    K: Hash + Eq,
    V: Clone + PartialEq,
    S: BuildHasher + Clone,
{
    fn len(&self) -> usize {
        DashMap::len(self)
    }

    fn insert(&self, key: K, entry: Entry<V>) -> Option<Entry<V>> {
        DashMap::insert(self, key, entry)
    }

    #[tracing::instrument(level = "trace", skip(self, key, entry))]
    fn insert_if_absent(&self, key: K, entry: Entry<V>) -> Option<Entry<V>> {
        match self.entry(key) {
            MapEntry::Occupied(occupied) => Some(occupied.get().clone()),
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                None
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, key, entry))]
    fn replace_if_present<Q>(&self, key: &Q, entry: Entry<V>) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut current = self.get_mut(key)?;
        Some(std::mem::replace(&mut *current, entry))
    }

    fn get_with<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Entry<V>) -> R,
    {
        let current = self.get(key)?;
        Some(f(current.value()))
    }

    fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        DashMap::contains_key(self, key)
    }

    fn remove<Q>(&self, key: &Q) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        DashMap::remove(self, key).map(|(_, entry)| entry)
    }

    #[tracing::instrument(level = "trace", skip(self, key, snapshot, new))]
    fn compare_and_swap<Q>(
        &self,
        key: &Q,
        snapshot: &Entry<V>,
        new: Entry<V>,
    ) -> Result<Entry<V>, CasError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut current = self.get_mut(key).ok_or(CasError::NotFound)?;
        check_snapshot(&current, snapshot)?;
        Ok(std::mem::replace(&mut *current, new))
    }

    #[tracing::instrument(level = "trace", skip(self, key, snapshot))]
    fn compare_and_remove<Q>(&self, key: &Q, snapshot: &Entry<V>) -> Result<Entry<V>, CasError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        // Stays `NotFound` unless the predicate gets to look at an entry.
        let mut verdict = Err(CasError::NotFound);

        let removed = self.remove_if(key, |_, current| {
            verdict = check_snapshot(current, snapshot);
            verdict.is_ok()
        });

        match removed {
            Some((_, entry)) => Ok(entry),
            None => Err(verdict.err().unwrap_or(CasError::NotFound)),
        }
    }

    fn clear(&self) {
        DashMap::clear(self);
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Entry<V>),
    {
        for item in self.iter() {
            f(item.key(), item.value());
        }
    }

    fn any<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&K, &Entry<V>) -> bool,
    {
        self.iter().any(|item| f(item.key(), item.value()))
    }
}
