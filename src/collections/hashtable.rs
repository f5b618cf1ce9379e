//! Separate-chaining hashtable keyed by a kernel id (pid or tid).
//!
//! Bucket count is caller-supplied at creation and never changes; chain
//! nodes are owned by the table. Only grown from syscall context.

use alloc::vec::Vec;

#[derive(Debug)]
pub struct ChainTable<V> {
    buckets: Vec<Vec<(i32, V)>>,
    len: usize,
}

impl<V> ChainTable<V> {
    pub fn new(n_buckets: usize) -> Self {
        let mut buckets = Vec::with_capacity(n_buckets);
        for _ in 0..n_buckets {
            buckets.push(Vec::new());
        }
        ChainTable { buckets, len: 0 }
    }

    fn bucket(&self, key: i32) -> usize {
        // Fibonacci-style mix so consecutive ids spread across buckets.
        let h = (key as u32).wrapping_mul(0x9e37_79b9);
        (h as usize) % self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace. Returns the previous value for the key.
    pub fn insert(&mut self, key: i32, value: V) -> Option<V> {
        let b = self.bucket(key);
        let chain = &mut self.buckets[b];
        for slot in chain.iter_mut() {
            if slot.0 == key {
                return Some(core::mem::replace(&mut slot.1, value));
            }
        }
        chain.push((key, value));
        self.len += 1;
        None
    }

    pub fn get(&self, key: i32) -> Option<&V> {
        let b = self.bucket(key);
        self.buckets[b].iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: i32) -> Option<&mut V> {
        let b = self.bucket(key);
        self.buckets[b]
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: i32) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: i32) -> Option<V> {
        let b = self.bucket(key);
        let chain = &mut self.buckets[b];
        let idx = chain.iter().position(|(k, _)| *k == key)?;
        self.len -= 1;
        Some(chain.swap_remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &V)> {
        self.buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|(k, v)| (*k, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (i32, &mut V)> {
        self.buckets
            .iter_mut()
            .flat_map(|chain| chain.iter_mut().map(|(k, v)| (*k, v)))
    }

    /// Collect the keys. Handy when the caller needs to mutate entries
    /// one at a time while walking the whole table.
    pub fn keys(&self) -> Vec<i32> {
        self.iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut t: ChainTable<&str> = ChainTable::new(4);
        assert!(t.insert(1, "one").is_none());
        assert!(t.insert(2, "two").is_none());
        assert_eq!(t.insert(1, "uno"), Some("one"));
        assert_eq!(t.get(1), Some(&"uno"));
        assert_eq!(t.len(), 2);
        assert_eq!(t.remove(1), Some("uno"));
        assert_eq!(t.get(1), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn chains_survive_collisions() {
        // More keys than buckets forces every chain to carry several.
        let mut t: ChainTable<i32> = ChainTable::new(2);
        for k in 0..32 {
            t.insert(k, k * 10);
        }
        assert_eq!(t.len(), 32);
        for k in 0..32 {
            assert_eq!(t.get(k), Some(&(k * 10)));
        }
        for k in (0..32).step_by(2) {
            assert_eq!(t.remove(k), Some(k * 10));
        }
        assert_eq!(t.len(), 16);
        for k in (1..32).step_by(2) {
            assert_eq!(t.get(k), Some(&(k * 10)));
        }
    }

    #[test]
    fn iter_sees_everything() {
        let mut t: ChainTable<i32> = ChainTable::new(8);
        for k in 0..10 {
            t.insert(k, k);
        }
        let mut keys = t.keys();
        keys.sort_unstable();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }
}
