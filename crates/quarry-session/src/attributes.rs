//! Typed per-session attribute store.
//!
//! Request handlers park per-session state here (open SQL contexts, cached
//! navigator settings). Each value is stored under an [`AttributeKey<T>`],
//! so a lookup can only ever yield the type it was stored as.
//!
//! Values are either *transient* (dropped whenever the user state is reset
//! or the session closes) or *persistent* (survive resets). A transient
//! value may carry a disposer, which runs exactly once with the last value
//! when the attribute is cleared.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Names an attribute and fixes its value type.
///
/// ```
/// use quarry_session::AttributeKey;
///
/// const SQL_CONTEXTS: AttributeKey<Vec<String>> = AttributeKey::new("sql-contexts");
/// assert_eq!(SQL_CONTEXTS.name(), "sql-contexts");
/// ```
pub struct AttributeKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

type AnyValue = Box<dyn Any + Send + Sync>;
type Disposer = Box<dyn FnOnce(AnyValue) + Send>;

struct Entry {
    value: AnyValue,
    persistent: bool,
    disposer: Option<Disposer>,
}

/// The attribute map of one session.
#[derive(Default)]
pub struct Attributes {
    entries: Mutex<HashMap<&'static str, Entry>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get<T>(&self, key: AttributeKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .lock()
            .get(key.name)
            .and_then(|e| e.value.downcast_ref::<T>())
            .cloned()
    }

    /// Stores `value`. A persistent value survives
    /// [`clear_transient`](Self::clear_transient).
    ///
    /// A disposer already attached to the key is kept while the value stays
    /// transient. Storing a persistent value over a transient one runs the
    /// old disposer with the old value first.
    pub fn set<T>(&self, key: AttributeKey<T>, value: T, persistent: bool)
    where
        T: Send + Sync + 'static,
    {
        let retired = {
            let mut entries = self.entries.lock();
            let mut previous = entries.remove(key.name);
            let disposer = previous.as_mut().and_then(|e| e.disposer.take());
            let (kept, retired) = match (persistent, disposer) {
                (false, disposer) => (disposer, None),
                (true, Some(disposer)) => (None, previous.map(|e| (disposer, e.value))),
                (true, None) => (None, None),
            };
            entries.insert(
                key.name,
                Entry {
                    value: Box::new(value),
                    persistent,
                    disposer: kept,
                },
            );
            retired
        };
        if let Some((disposer, old)) = retired {
            run_disposer(key.name, disposer, old);
        }
    }

    /// Returns the value under `key`, creating it first if missing. A
    /// newly created value is transient and gets `disposer` attached.
    ///
    /// `create` runs under the store lock and must not touch the store.
    pub fn get_or_create<T, C, D>(&self, key: AttributeKey<T>, create: C, disposer: Option<D>) -> T
    where
        T: Clone + Send + Sync + 'static,
        C: FnOnce() -> T,
        D: FnOnce(T) + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key.name).and_then(|e| e.value.downcast_ref::<T>()) {
            return existing.clone();
        }
        let value = create();
        let disposer = disposer.map(|d| -> Disposer {
            Box::new(move |any: AnyValue| match any.downcast::<T>() {
                Ok(value) => d(*value),
                Err(_) => debug!(attribute = key.name, "attribute type changed, disposer skipped"),
            })
        });
        entries.insert(
            key.name,
            Entry {
                value: Box::new(value.clone()),
                persistent: false,
                disposer,
            },
        );
        value
    }

    /// Removes the value under `key` and returns it. Its disposer, if any,
    /// is dropped without running.
    pub fn remove<T>(&self, key: AttributeKey<T>) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.lock().remove(key.name)?;
        entry.value.downcast::<T>().ok().map(|v| *v)
    }

    pub fn contains<T>(&self, key: AttributeKey<T>) -> bool {
        self.entries.lock().contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every transient value, running disposers after the lock is
    /// released. A panicking disposer is logged and does not stop the
    /// others. Returns the number of values dropped.
    pub fn clear_transient(&self) -> usize {
        let removed: Vec<(&'static str, Entry)> = {
            let mut entries = self.entries.lock();
            let names: Vec<_> = entries
                .iter()
                .filter(|(_, e)| !e.persistent)
                .map(|(name, _)| *name)
                .collect();
            names
                .into_iter()
                .filter_map(|name| entries.remove(name).map(|e| (name, e)))
                .collect()
        };

        let count = removed.len();
        for (name, entry) in removed {
            if let Some(disposer) = entry.disposer {
                run_disposer(name, disposer, entry.value);
            }
        }
        count
    }
}

fn run_disposer(name: &'static str, disposer: Disposer, value: AnyValue) {
    if catch_unwind(AssertUnwindSafe(move || disposer(value))).is_err() {
        warn!(attribute = name, "attribute disposer panicked");
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("Attributes")
            .field("names", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COUNTER: AttributeKey<u32> = AttributeKey::new("counter");
    const CONTEXTS: AttributeKey<Vec<String>> = AttributeKey::new("contexts");
    const THEME: AttributeKey<String> = AttributeKey::new("theme");

    #[test]
    fn test_set_and_get_roundtrip_typed() {
        let attrs = Attributes::new();
        attrs.set(COUNTER, 7, false);

        assert_eq!(attrs.get(COUNTER), Some(7));
        assert!(attrs.get(THEME).is_none());
    }

    #[test]
    fn test_get_with_wrong_type_under_same_name_is_none() {
        let attrs = Attributes::new();
        let shadow: AttributeKey<String> = AttributeKey::new("counter");
        attrs.set(COUNTER, 7, false);

        assert_eq!(attrs.get(shadow), None);
    }

    #[test]
    fn test_clear_transient_keeps_persistent() {
        let attrs = Attributes::new();
        attrs.set(COUNTER, 1, false);
        attrs.set(THEME, "dark".to_string(), true);

        assert_eq!(attrs.clear_transient(), 1);

        assert!(!attrs.contains(COUNTER));
        assert_eq!(attrs.get(THEME).as_deref(), Some("dark"));
    }

    #[test]
    fn test_get_or_create_creates_once() {
        let attrs = Attributes::new();
        let created = AtomicUsize::new(0);

        for _ in 0..3 {
            attrs.get_or_create(
                CONTEXTS,
                || {
                    created.fetch_add(1, Ordering::SeqCst);
                    vec!["ctx-1".to_string()]
                },
                None::<fn(Vec<String>)>,
            );
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposer_runs_once_with_last_value() {
        let attrs = Attributes::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        attrs.get_or_create(CONTEXTS, Vec::new, Some(move |v: Vec<String>| sink.lock().push(v)));
        attrs.set(CONTEXTS, vec!["last".to_string()], false);

        attrs.clear_transient();
        attrs.clear_transient();

        assert_eq!(*seen.lock(), vec![vec!["last".to_string()]]);
    }

    #[test]
    fn test_panicking_disposer_does_not_stop_others() {
        let attrs = Attributes::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        fn explode(_: u32) {
            panic!("disposer bug");
        }
        attrs.get_or_create(COUNTER, || 1, Some(explode));
        attrs.get_or_create(THEME, String::new, Some(move |_: String| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(attrs.clear_transient(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_persistent_over_transient_runs_disposer_once() {
        let attrs = Attributes::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        attrs.get_or_create(COUNTER, || 1, Some(move |v: u32| sink.lock().push(v)));
        attrs.set(COUNTER, 2, false);

        attrs.set(COUNTER, 3, true);
        attrs.clear_transient();

        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(attrs.get(COUNTER), Some(3));
    }

    #[test]
    fn test_remove_drops_disposer_without_running() {
        let attrs = Attributes::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        attrs.get_or_create(COUNTER, || 5, Some(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(attrs.remove(COUNTER), Some(5));
        attrs.clear_transient();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
