// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hash-indexed handle registry.
//!
//! A fixed-bucket separate-chaining table whose per-entry behavior
//! (hashing, equality, ownership transfer, teardown) is injected through
//! the [`MapBehavior`] trait. The table never resizes; bucket count is
//! fixed at construction. Three ready-made behaviors cover the common
//! key/value shapes; the event engine substitutes its own to tie entry
//! teardown to socket close and buffer reclamation.

use crate::error::{set_last_error, NetError};

/// Per-entry behavior of a [`HashTable`].
///
/// `adopt_key`/`adopt_val` validate and take ownership of incoming data;
/// returning `None` rejects the entry without mutating the table.
/// `release_key`/`release_val` run when the table tears an entry down
/// (`del`, `clear`, drop). `take` bypasses `release_val` so callers can
/// reclaim the value intact.
pub trait MapBehavior {
    type Key;
    type Val;

    fn hash(&self, key: &Self::Key) -> u64;
    fn eq(&self, a: &Self::Key, b: &Self::Key) -> bool;

    fn adopt_key(&self, key: Self::Key) -> Option<Self::Key> {
        Some(key)
    }

    fn adopt_val(&self, val: Self::Val) -> Option<Self::Val> {
        Some(val)
    }

    fn release_key(&self, _key: Self::Key) {}

    fn release_val(&self, _val: Self::Val) {}
}

struct Node<B: MapBehavior> {
    key: B::Key,
    val: B::Val,
    next: Option<Box<Node<B>>>,
}

/// Fixed-bucket chained hash table driven by a [`MapBehavior`].
pub struct HashTable<B: MapBehavior> {
    buckets: Vec<Option<Box<Node<B>>>>,
    behavior: B,
    len: usize,
}

impl<B: MapBehavior> HashTable<B> {
    /// Create a table with `bucket_count` buckets (must be non-zero).
    pub fn new(bucket_count: usize, behavior: B) -> Result<Self, NetError> {
        if bucket_count == 0 {
            set_last_error(NetError::InvalidParam);
            return Err(NetError::InvalidParam);
        }
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || None);
        Ok(Self {
            buckets,
            behavior,
            len: 0,
        })
    }

    fn bucket_index(&self, key: &B::Key) -> usize {
        (self.behavior.hash(key) % self.buckets.len() as u64) as usize
    }

    fn node(&self, key: &B::Key) -> Option<&Node<B>> {
        let mut cur = self.buckets[self.bucket_index(key)].as_deref();
        while let Some(node) = cur {
            if self.behavior.eq(&node.key, key) {
                return Some(node);
            }
            cur = node.next.as_deref();
        }
        None
    }

    fn node_mut(&mut self, key: &B::Key) -> Option<&mut Node<B>> {
        let idx = self.bucket_index(key);
        let behavior = &self.behavior;
        let mut cur = self.buckets[idx].as_deref_mut();
        while let Some(node) = cur {
            if behavior.eq(&node.key, key) {
                return Some(node);
            }
            cur = node.next.as_deref_mut();
        }
        None
    }

    /// Unlink the entry for `key` and hand its parts back raw.
    fn detach(&mut self, key: &B::Key) -> Option<(B::Key, B::Val)> {
        let idx = self.bucket_index(key);
        let mut chain = self.buckets[idx].take();
        let mut kept: Option<Box<Node<B>>> = None;
        let mut found = None;
        while let Some(mut node) = chain {
            chain = node.next.take();
            if found.is_none() && self.behavior.eq(&node.key, key) {
                found = Some((node.key, node.val));
            } else {
                node.next = kept;
                kept = Some(node);
            }
        }
        self.buckets[idx] = kept;
        if found.is_some() {
            self.len -= 1;
        }
        found
    }

    /// Insert a new entry. Fails with `DuplicateKey` if the key is
    /// already present and `RejectedEntry` if the behavior refuses the
    /// key or value; neither failure mutates the table.
    pub fn add(&mut self, key: B::Key, val: B::Val) -> Result<(), NetError> {
        if self.node(&key).is_some() {
            set_last_error(NetError::DuplicateKey);
            return Err(NetError::DuplicateKey);
        }
        let key = match self.behavior.adopt_key(key) {
            Some(k) => k,
            None => {
                set_last_error(NetError::RejectedEntry);
                return Err(NetError::RejectedEntry);
            }
        };
        let val = match self.behavior.adopt_val(val) {
            Some(v) => v,
            None => {
                self.behavior.release_key(key);
                set_last_error(NetError::RejectedEntry);
                return Err(NetError::RejectedEntry);
            }
        };

        let idx = self.bucket_index(&key);
        let next = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Node { key, val, next }));
        self.len += 1;
        Ok(())
    }

    /// Replace the value of an existing entry; the old value is released
    /// through the behavior. Fails with `KeyNotFound` if absent.
    pub fn modify(&mut self, key: &B::Key, val: B::Val) -> Result<(), NetError> {
        let val = match self.behavior.adopt_val(val) {
            Some(v) => v,
            None => {
                set_last_error(NetError::RejectedEntry);
                return Err(NetError::RejectedEntry);
            }
        };
        let old = match self.node_mut(key) {
            Some(node) => std::mem::replace(&mut node.val, val),
            None => {
                self.behavior.release_val(val);
                set_last_error(NetError::KeyNotFound);
                return Err(NetError::KeyNotFound);
            }
        };
        self.behavior.release_val(old);
        Ok(())
    }

    /// Remove an entry, releasing key and value through the behavior.
    pub fn del(&mut self, key: &B::Key) -> Result<(), NetError> {
        match self.detach(key) {
            Some((k, v)) => {
                self.behavior.release_key(k);
                self.behavior.release_val(v);
                Ok(())
            }
            None => {
                set_last_error(NetError::KeyNotFound);
                Err(NetError::KeyNotFound)
            }
        }
    }

    /// Remove an entry and hand the value back without running
    /// `release_val`. The key is still released.
    pub fn take(&mut self, key: &B::Key) -> Option<B::Val> {
        let (k, v) = self.detach(key)?;
        self.behavior.release_key(k);
        Some(v)
    }

    pub fn find(&self, key: &B::Key) -> Option<&B::Val> {
        self.node(key).map(|n| &n.val)
    }

    pub fn find_mut(&mut self, key: &B::Key) -> Option<&mut B::Val> {
        self.node_mut(key).map(|n| &mut n.val)
    }

    pub fn count(&self) -> usize {
        self.len
    }

    /// Snapshot of every key currently in the table.
    pub fn keys(&self) -> Vec<B::Key>
    where
        B::Key: Clone,
    {
        let mut out = Vec::with_capacity(self.len);
        for bucket in &self.buckets {
            let mut cur = bucket.as_deref();
            while let Some(node) = cur {
                out.push(node.key.clone());
                cur = node.next.as_deref();
            }
        }
        out
    }

    /// Remove every entry, releasing each through the behavior.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            let mut chain = bucket.take();
            while let Some(mut node) = chain {
                chain = node.next.take();
                self.behavior.release_key(node.key);
                self.behavior.release_val(node.val);
            }
        }
        self.len = 0;
    }
}

impl<B: MapBehavior> Drop for HashTable<B> {
    fn drop(&mut self) {
        self.clear();
    }
}

fn int_hash(key: i64) -> u64 {
    key.wrapping_shl(5).wrapping_add(key.wrapping_mul(2)) as u64
}

fn bytes_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(b as u64);
    }
    h
}

/// Integer keys, integer values.
pub struct IntPairs;

impl MapBehavior for IntPairs {
    type Key = i64;
    type Val = i64;

    fn hash(&self, key: &i64) -> u64 {
        int_hash(*key)
    }

    fn eq(&self, a: &i64, b: &i64) -> bool {
        a == b
    }
}

/// Owned byte-string keys and values; empty ones are rejected.
pub struct BytesPairs;

impl MapBehavior for BytesPairs {
    type Key = Vec<u8>;
    type Val = Vec<u8>;

    fn hash(&self, key: &Vec<u8>) -> u64 {
        bytes_hash(key)
    }

    fn eq(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }

    fn adopt_key(&self, key: Vec<u8>) -> Option<Vec<u8>> {
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    fn adopt_val(&self, val: Vec<u8>) -> Option<Vec<u8>> {
        if val.is_empty() {
            None
        } else {
            Some(val)
        }
    }
}

/// Integer keys, owned byte-string values; empty values are rejected.
pub struct IntBytes;

impl MapBehavior for IntBytes {
    type Key = i64;
    type Val = Vec<u8>;

    fn hash(&self, key: &i64) -> u64 {
        int_hash(*key)
    }

    fn eq(&self, a: &i64, b: &i64) -> bool {
        a == b
    }

    fn adopt_val(&self, val: Vec<u8>) -> Option<Vec<u8>> {
        if val.is_empty() {
            None
        } else {
            Some(val)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn add_find_del_round_trip() {
        let mut table = HashTable::new(8, IntPairs).expect("table should build");
        table.add(7, 70).expect("add should succeed");
        table.add(15, 150).expect("add should succeed");
        assert_eq!(table.count(), 2);
        assert_eq!(table.find(&7), Some(&70));
        assert_eq!(table.find(&15), Some(&150));
        table.del(&7).expect("del should succeed");
        assert_eq!(table.find(&7), None);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn add_fails_on_duplicate() {
        let mut table = HashTable::new(4, IntPairs).expect("table should build");
        table.add(1, 10).expect("add should succeed");
        assert_eq!(table.add(1, 11), Err(NetError::DuplicateKey));
        // Original value untouched.
        assert_eq!(table.find(&1), Some(&10));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn modify_fails_on_absent_key() {
        let mut table = HashTable::new(4, IntPairs).expect("table should build");
        assert_eq!(table.modify(&9, 90), Err(NetError::KeyNotFound));
        table.add(9, 90).expect("add should succeed");
        table.modify(&9, 91).expect("modify should succeed");
        assert_eq!(table.find(&9), Some(&91));
    }

    #[test]
    fn del_fails_on_absent_key() {
        let mut table = HashTable::new(4, IntPairs).expect("table should build");
        assert_eq!(table.del(&3), Err(NetError::KeyNotFound));
    }

    #[test]
    fn empty_bytes_are_rejected() {
        let mut table = HashTable::new(4, BytesPairs).expect("table should build");
        assert_eq!(
            table.add(Vec::new(), b"v".to_vec()),
            Err(NetError::RejectedEntry)
        );
        assert_eq!(
            table.add(b"k".to_vec(), Vec::new()),
            Err(NetError::RejectedEntry)
        );
        assert_eq!(table.count(), 0);
        table
            .add(b"k".to_vec(), b"v".to_vec())
            .expect("add should succeed");
        assert_eq!(table.find(&b"k".to_vec()).map(|v| v.as_slice()), Some(&b"v"[..]));
    }

    #[test]
    fn zero_buckets_is_invalid() {
        assert!(matches!(
            HashTable::new(0, IntPairs),
            Err(NetError::InvalidParam)
        ));
    }

    struct CountingDrops {
        released: Rc<Cell<usize>>,
    }

    impl MapBehavior for CountingDrops {
        type Key = i64;
        type Val = i64;

        fn hash(&self, key: &i64) -> u64 {
            int_hash(*key)
        }

        fn eq(&self, a: &i64, b: &i64) -> bool {
            a == b
        }

        fn release_val(&self, _val: i64) {
            self.released.set(self.released.get() + 1);
        }
    }

    #[test]
    fn take_skips_value_release() {
        let released = Rc::new(Cell::new(0));
        let mut table = HashTable::new(4, CountingDrops {
            released: released.clone(),
        })
        .expect("table should build");
        table.add(1, 100).expect("add should succeed");
        table.add(2, 200).expect("add should succeed");

        assert_eq!(table.take(&1), Some(100));
        assert_eq!(released.get(), 0);

        table.del(&2).expect("del should succeed");
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn drop_releases_everything() {
        let released = Rc::new(Cell::new(0));
        {
            let mut table = HashTable::new(4, CountingDrops {
                released: released.clone(),
            })
            .expect("table should build");
            for k in 0..10 {
                table.add(k, k * 10).expect("add should succeed");
            }
        }
        assert_eq!(released.get(), 10);
    }

    #[test]
    fn randomized_against_std_map() {
        let mut table = HashTable::new(16, IntPairs).expect("table should build");
        let mut model = std::collections::HashMap::new();
        for _ in 0..1000 {
            let key = fastrand::i64(0..64);
            match fastrand::u8(0..3) {
                0 => {
                    let val = fastrand::i64(..);
                    let expect_ok = !model.contains_key(&key);
                    assert_eq!(table.add(key, val).is_ok(), expect_ok);
                    model.entry(key).or_insert(val);
                }
                1 => {
                    let expect_ok = model.remove(&key).is_some();
                    assert_eq!(table.del(&key).is_ok(), expect_ok);
                }
                _ => {
                    assert_eq!(table.find(&key), model.get(&key));
                }
            }
            assert_eq!(table.count(), model.len());
        }
    }
}
