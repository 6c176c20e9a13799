use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keyed memo that recomputes only when its input changes by value.
///
/// Optimistic writes produce new snapshots on every patch, so inputs are
/// compared with `PartialEq` rather than by pointer.
pub struct Memo<K, I, O> {
    entries: Mutex<HashMap<K, (I, Arc<O>)>>,
    computations: AtomicU64,
}

impl<K, I, O> Default for Memo<K, I, O> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
        }
    }
}

impl<K, I, O> Memo<K, I, O>
where
    K: Eq + Hash,
    I: PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(&self, key: K, input: I, compute: impl FnOnce(&I) -> O) -> Arc<O> {
        let mut entries = self.entries.lock();
        if let Some((cached_input, output)) = entries.get(&key) {
            if *cached_input == input {
                return Arc::clone(output);
            }
        }
        let output = Arc::new(compute(&input));
        self.computations.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, (input, Arc::clone(&output)));
        output
    }

    pub fn forget(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// How many times a value was actually computed.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_reuse_output() {
        let memo: Memo<&str, Vec<u32>, u32> = Memo::new();
        let a = memo.get_or_compute("r", vec![1, 2], |v| v.iter().sum());
        let b = memo.get_or_compute("r", vec![1, 2], |_| unreachable!());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(memo.computations(), 1);

        let c = memo.get_or_compute("r", vec![3], |v| v.iter().sum());
        assert_eq!(*c, 3);
        assert_eq!(memo.computations(), 2);
    }

    #[test]
    fn keys_are_independent() {
        let memo: Memo<&str, u32, u32> = Memo::new();
        memo.get_or_compute("a", 1, |v| *v);
        memo.get_or_compute("b", 1, |v| *v);
        memo.get_or_compute("a", 1, |v| *v);
        assert_eq!(memo.computations(), 2);
        memo.forget(&"a");
        memo.get_or_compute("a", 1, |v| *v);
        assert_eq!(memo.computations(), 3);
    }
}
