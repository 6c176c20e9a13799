//! One keyed family of cells.
//!
//! Values are published as `Arc<V>` snapshots and replaced wholesale on
//! write, so a reader holding a snapshot never observes a half-applied
//! update. Updaters run under the family lock and must not call back into
//! the store; listeners run after the lock is released and may.

use super::keys::CellKey;
use super::subscription::Subscription;
use crate::model::RunId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Listener<V> = Arc<dyn Fn(&Arc<V>) + Send + Sync>;

struct Inner<K, V> {
    cells: HashMap<K, Arc<V>>,
    listeners: HashMap<K, Vec<(u64, Listener<V>)>>,
}

pub struct KeyedFamily<K, V> {
    name: &'static str,
    inner: Mutex<Inner<K, V>>,
    next_listener: AtomicU64,
}

impl<K, V> KeyedFamily<K, V>
where
    K: CellKey,
    V: Default + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                cells: HashMap::new(),
                listeners: HashMap::new(),
            }),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current snapshot, or a fresh default for an unseen key. Reading does
    /// not insert, so reads of a dropped run cannot resurrect it.
    pub fn get(&self, key: &K) -> Arc<V> {
        self.peek(key).unwrap_or_default()
    }

    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.inner.lock().cells.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().cells.contains_key(key)
    }

    /// Replaces the value with `f(current)` and notifies subscribers.
    pub fn set(&self, key: &K, f: impl FnOnce(&V) -> V) -> Arc<V> {
        self.update(key, |cur| {
            let next = Arc::new(f(cur));
            (Some(Arc::clone(&next)), next)
        })
    }

    /// General form of [`set`](Self::set). Returning `None` leaves the cell
    /// untouched and notifies nobody.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&V) -> (Option<Arc<V>>, R)) -> R {
        let (published, listeners, out) = {
            let mut inner = self.inner.lock();
            let current = inner.cells.get(key).cloned().unwrap_or_default();
            let (next, out) = f(&current);
            match next {
                Some(next) => {
                    inner.cells.insert(key.clone(), Arc::clone(&next));
                    let listeners = inner
                        .listeners
                        .get(key)
                        .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>())
                        .unwrap_or_default();
                    (Some(next), listeners, out)
                }
                None => (None, Vec::new(), out),
            }
        };

        if let Some(value) = published {
            for listener in listeners {
                listener(&value);
            }
        }
        out
    }

    /// Like [`update`](Self::update) but only writes while `guard` holds,
    /// checked under the family lock. Used to drop stale async completions.
    pub fn update_if<R>(
        &self,
        key: &K,
        guard: impl FnOnce() -> bool,
        f: impl FnOnce(&V) -> (Option<Arc<V>>, R),
    ) -> Option<R> {
        let mut guard = Some(guard);
        let mut allowed = false;
        let out = self.update(key, |cur| {
            allowed = guard.take().map(|g| g()).unwrap_or(false);
            if allowed {
                let (next, out) = f(cur);
                (next, Some(out))
            } else {
                (None, None)
            }
        });
        if allowed {
            out
        } else {
            None
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        key: &K,
        callback: impl Fn(&Arc<V>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let family = Arc::downgrade(self);
        let key = key.clone();
        Subscription::new(move || {
            if let Some(family) = family.upgrade() {
                family.remove_listener(&key, id);
            }
        })
    }

    fn remove_listener(&self, key: &K, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.listeners.get_mut(key) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                inner.listeners.remove(key);
            }
        }
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner
            .lock()
            .listeners
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_subscribers_in_run(&self, run_id: &RunId) -> bool {
        self.inner
            .lock()
            .listeners
            .iter()
            .any(|(k, l)| k.run_id() == run_id && !l.is_empty())
    }

    pub fn keys_in_run(&self, run_id: &RunId) -> Vec<K> {
        self.inner
            .lock()
            .cells
            .keys()
            .filter(|k| k.run_id() == run_id)
            .cloned()
            .collect()
    }

    /// Drops every cell of the run. Listeners stay registered.
    pub fn remove_run(&self, run_id: &RunId) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.cells.len();
        inner.cells.retain(|k, _| k.run_id() != run_id);
        before - inner.cells.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
