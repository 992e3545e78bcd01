//! In-memory live collection.
//!
//! Reference [`LiveSource`] implementation: a keyed row set whose cursors
//! report rows entering, changing inside and leaving their filter. Useful for
//! tests and for applications whose published state already lives in memory.

use super::source::{ChangeSink, Fields, LiveSource, StopHandle};
use crate::error::RpcError;
use crate::filter::Filter;
use crate::locks;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

struct Observer {
    filter: Filter,
    sink: Arc<dyn ChangeSink>,
}

struct CollectionInner {
    name: String,
    // Row mutations notify observers while holding this lock, so every
    // observer sees changes in mutation order.
    rows: Mutex<BTreeMap<String, Fields>>,
    observers: Mutex<HashMap<u64, Arc<Observer>>>,
    next_observer: AtomicU64,
}

/// A named, observable set of rows keyed by id.
#[derive(Clone)]
pub struct MemoryCollection {
    inner: Arc<CollectionInner>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                name: name.into(),
                rows: Mutex::new(BTreeMap::new()),
                observers: Mutex::new(HashMap::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn insert(&self, id: impl Into<String>, fields: Fields) -> Result<(), RpcError> {
        let id = id.into();
        let mut rows = locks::lock(&self.inner.rows);
        if rows.contains_key(&id) {
            return Err(RpcError::Validation {
                message: format!("Row {} already exists in {}", id, self.inner.name),
            });
        }
        self.notify(&id, None, Some(&fields));
        rows.insert(id, fields);
        Ok(())
    }

    /// Merge `set` into an existing row.
    pub fn update(&self, id: &str, set: Fields) -> Result<(), RpcError> {
        let mut rows = locks::lock(&self.inner.rows);
        let row = rows.get_mut(id).ok_or_else(|| self.missing(id))?;
        let before = row.clone();
        for (key, value) in set {
            row.insert(key, value);
        }
        let after = row.clone();
        self.notify(id, Some(&before), Some(&after));
        Ok(())
    }

    /// Replace the fields of an existing row. Fields absent from `fields` are
    /// cleared.
    pub fn replace(&self, id: &str, fields: Fields) -> Result<(), RpcError> {
        let mut rows = locks::lock(&self.inner.rows);
        let row = rows.get_mut(id).ok_or_else(|| self.missing(id))?;
        let before = std::mem::replace(row, fields.clone());
        self.notify(id, Some(&before), Some(&fields));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Fields, RpcError> {
        let mut rows = locks::lock(&self.inner.rows);
        let removed = rows.remove(id).ok_or_else(|| self.missing(id))?;
        self.notify(id, Some(&removed), None);
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Fields> {
        locks::lock(&self.inner.rows).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.inner.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A live cursor over the rows matching `filter`.
    pub fn find(&self, filter: Filter) -> MemoryCursor {
        MemoryCursor {
            collection: self.clone(),
            filter,
        }
    }

    /// Number of cursors currently being observed.
    pub fn observer_count(&self) -> usize {
        locks::lock(&self.inner.observers).len()
    }

    fn missing(&self, id: &str) -> RpcError {
        RpcError::NotFound {
            name: format!("{}/{}", self.inner.name, id),
        }
    }

    // Callers hold the rows lock. The observers lock is released before any
    // sink is called so sinks may stop their own observation.
    fn notify(&self, id: &str, before: Option<&Fields>, after: Option<&Fields>) {
        let observers: Vec<Arc<Observer>> =
            locks::lock(&self.inner.observers).values().cloned().collect();

        for observer in observers {
            let was = before.is_some_and(|f| observer.filter.matches(id, f));
            let is = after.is_some_and(|f| observer.filter.matches(id, f));
            match (was, is, before, after) {
                (false, true, _, Some(after)) => observer.sink.added(id, after.clone()),
                (true, false, _, _) => observer.sink.removed(id),
                (true, true, Some(before), Some(after)) => {
                    let (fields, cleared) = diff(before, after);
                    if !fields.is_empty() || !cleared.is_empty() {
                        observer.sink.changed(id, fields, cleared);
                    }
                }
                _ => {}
            }
        }
    }
}

fn diff(before: &Fields, after: &Fields) -> (Fields, Vec<String>) {
    let fields = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let cleared = before
        .keys()
        .filter(|key| !after.contains_key(*key))
        .cloned()
        .collect();
    (fields, cleared)
}

/// Live view of the rows of a [`MemoryCollection`] matching a filter.
#[derive(Clone)]
pub struct MemoryCursor {
    collection: MemoryCollection,
    filter: Filter,
}

impl MemoryCursor {
    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

#[async_trait]
impl LiveSource for MemoryCursor {
    async fn observe(&self, sink: Arc<dyn ChangeSink>) -> Result<StopHandle, RpcError> {
        let inner = &self.collection.inner;
        let observer_id = inner.next_observer.fetch_add(1, Ordering::SeqCst);
        let observer = Arc::new(Observer {
            filter: self.filter.clone(),
            sink,
        });

        {
            let rows = locks::lock(&inner.rows);
            for (id, fields) in rows.iter() {
                if observer.filter.matches(id, fields) {
                    observer.sink.added(id, fields.clone());
                }
            }
            locks::lock(&inner.observers).insert(observer_id, observer);
        }
        debug!("Observing {} (observer {})", inner.name, observer_id);

        let weak: Weak<CollectionInner> = Arc::downgrade(inner);
        Ok(StopHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                locks::lock(&inner.observers).remove(&observer_id);
                debug!("Stopped observing {} (observer {})", inner.name, observer_id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ChangeSink for Recorder {
        fn added(&self, id: &str, _fields: Fields) {
            self.events.lock().unwrap().push(format!("added:{}", id));
        }

        fn changed(&self, id: &str, fields: Fields, cleared: Vec<String>) {
            let mut keys: Vec<_> = fields.keys().cloned().collect();
            keys.extend(cleared.into_iter().map(|k| format!("-{}", k)));
            self.events
                .lock()
                .unwrap()
                .push(format!("changed:{}:{}", id, keys.join(",")));
        }

        fn removed(&self, id: &str) {
            self.events.lock().unwrap().push(format!("removed:{}", id));
        }

        fn failed(&self, error: RpcError) {
            self.events.lock().unwrap().push(format!("failed:{}", error));
        }
    }

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[tokio::test]
    async fn test_initial_rows_then_changes() {
        let todos = MemoryCollection::new("todos");
        todos.insert("b", fields(json!({"title": "B"}))).unwrap();
        todos.insert("a", fields(json!({"title": "A"}))).unwrap();

        let recorder = Arc::new(Recorder::default());
        let handle = todos.find(Filter::all()).observe(recorder.clone()).await.unwrap();

        todos.update("a", fields(json!({"title": "A2"}))).unwrap();
        todos.update("a", fields(json!({"title": "A2"}))).unwrap();
        todos.remove("b").unwrap();
        handle.stop();
        todos.insert("c", Fields::new()).unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["added:a", "added:b", "changed:a:title", "removed:b"]
        );
        assert_eq!(todos.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_rows_enter_and_leave_filter() {
        let todos = MemoryCollection::new("todos");
        todos.insert("a", fields(json!({"done": false}))).unwrap();

        let recorder = Arc::new(Recorder::default());
        let _handle = todos
            .find(Filter::eq("done", false))
            .observe(recorder.clone())
            .await
            .unwrap();

        todos.update("a", fields(json!({"done": true}))).unwrap();
        todos.insert("b", fields(json!({"done": true}))).unwrap();
        todos.update("b", fields(json!({"done": false}))).unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["added:a", "removed:a", "added:b"]
        );
    }

    #[tokio::test]
    async fn test_replace_reports_cleared_fields() {
        let notes = MemoryCollection::new("notes");
        notes
            .insert("n", fields(json!({"title": "T", "body": "x"})))
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let _handle = notes.find(Filter::all()).observe(recorder.clone()).await.unwrap();

        notes.replace("n", fields(json!({"title": "T"}))).unwrap();
        assert_eq!(
            recorder.events.lock().unwrap().last().map(String::as_str),
            Some("changed:n:-body")
        );
    }

    #[test]
    fn test_row_errors() {
        let todos = MemoryCollection::new("todos");
        todos.insert("a", Fields::new()).unwrap();
        assert!(todos.insert("a", Fields::new()).is_err());
        assert!(matches!(
            todos.update("zz", Fields::new()),
            Err(RpcError::NotFound { ref name }) if name == "todos/zz"
        ));
        assert_eq!(todos.remove("a").unwrap(), Fields::new());
        assert!(todos.is_empty());
    }
}
