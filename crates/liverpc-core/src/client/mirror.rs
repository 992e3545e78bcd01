//! Client-side mirror containers.
//!
//! A [`MirrorContainer`] holds the rows replicated from every subscription
//! publishing into it. Rows are reference counted per subscription, so a row
//! published by two subscriptions survives until both remove it or stop.

use crate::error::RemoteError;
use crate::filter::Filter;
use crate::locks;
use crate::publication::{Fields, PublicationEvent, Subscription};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct MirrorRow {
    fields: Fields,
    refs: usize,
}

struct ContainerInner {
    name: String,
    rows: Mutex<BTreeMap<String, MirrorRow>>,
    version: watch::Sender<u64>,
}

/// A named client-side row set.
#[derive(Clone)]
pub struct MirrorContainer {
    inner: Arc<ContainerInner>,
}

impl fmt::Debug for MirrorContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorContainer")
            .field("name", &self.inner.name)
            .field("rows", &self.len())
            .finish()
    }
}

impl MirrorContainer {
    pub fn new(name: impl Into<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(ContainerInner {
                name: name.into(),
                rows: Mutex::new(BTreeMap::new()),
                version,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.inner.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A row as an object with its id under `_id`.
    pub fn get(&self, id: &str) -> Option<Value> {
        locks::lock(&self.inner.rows)
            .get(id)
            .map(|row| document(id, &row.fields))
    }

    /// Rows matching `filter`, in id order.
    pub fn snapshot(&self, filter: &Filter) -> Vec<Value> {
        locks::lock(&self.inner.rows)
            .iter()
            .filter(|(id, row)| filter.matches(id, &row.fields))
            .map(|(id, row)| document(id, &row.fields))
            .collect()
    }

    /// Apply one row event. Returns `false` for events that are not row
    /// events.
    pub fn apply(&self, event: &PublicationEvent) -> bool {
        {
            let mut rows = locks::lock(&self.inner.rows);
            match event {
                PublicationEvent::Added { id, fields, .. } => match rows.get_mut(id) {
                    Some(row) => {
                        row.refs += 1;
                        merge(&mut row.fields, fields, &[]);
                    }
                    None => {
                        rows.insert(
                            id.clone(),
                            MirrorRow {
                                fields: fields.clone(),
                                refs: 1,
                            },
                        );
                    }
                },
                PublicationEvent::Changed {
                    id, fields, cleared, ..
                } => match rows.get_mut(id) {
                    Some(row) => merge(&mut row.fields, fields, cleared),
                    None => warn!("Change for unknown row {} in {}", id, self.inner.name),
                },
                PublicationEvent::Removed { id, .. } => release_row(&mut rows, id),
                PublicationEvent::Ready | PublicationEvent::Error { .. } => return false,
            }
        }
        self.touch();
        true
    }

    /// Drop one reference to each row in `ids`.
    fn release(&self, ids: impl IntoIterator<Item = String>) {
        {
            let mut rows = locks::lock(&self.inner.rows);
            for id in ids {
                release_row(&mut rows, &id);
            }
        }
        self.touch();
    }

    fn touch(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// A live view of the rows matching `filter`.
    pub fn find(&self, filter: Filter) -> LiveView {
        LiveView {
            container: self.clone(),
            filter,
            version: self.inner.version.subscribe(),
            feed: None,
        }
    }
}

fn document(id: &str, fields: &Fields) -> Value {
    let mut doc = fields.clone();
    doc.insert("_id".to_string(), Value::String(id.to_string()));
    Value::Object(doc)
}

fn merge(target: &mut Fields, fields: &Fields, cleared: &[String]) {
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
    for key in cleared {
        target.remove(key);
    }
}

fn release_row(rows: &mut BTreeMap<String, MirrorRow>, id: &str) {
    let gone = match rows.get_mut(id) {
        Some(row) => {
            row.refs = row.refs.saturating_sub(1);
            row.refs == 0
        }
        None => false,
    };
    if gone {
        rows.remove(id);
    }
}

/// Mirror containers by name.
#[derive(Clone, Default)]
pub struct MirrorStore {
    containers: Arc<Mutex<HashMap<String, MirrorContainer>>>,
}

impl MirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> MirrorContainer {
        locks::lock(&self.containers)
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating mirror container {}", name);
                MirrorContainer::new(name)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<MirrorContainer> {
        locks::lock(&self.containers).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = locks::lock(&self.containers).keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Default)]
struct FeedState {
    ready: AtomicBool,
    error: Mutex<Option<RemoteError>>,
    owned: Mutex<OwnedRows>,
}

/// Row references a view's subscription holds in the container. Once
/// `stopped`, no further event reaches the container.
#[derive(Default)]
struct OwnedRows {
    stopped: bool,
    counts: HashMap<String, usize>,
}

impl FeedState {
    /// Apply a row event to `target`. `false` once the view was stopped.
    fn apply_row(&self, target: &MirrorContainer, event: &PublicationEvent) -> bool {
        let mut owned = locks::lock(&self.owned);
        if owned.stopped {
            return false;
        }
        match event {
            PublicationEvent::Added { id, .. } => {
                *owned.counts.entry(id.clone()).or_insert(0) += 1;
            }
            PublicationEvent::Removed { id, .. } => {
                if let Some(count) = owned.counts.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        owned.counts.remove(id);
                    }
                }
            }
            _ => {}
        }
        target.apply(event);
        true
    }

    /// Mark the feed stopped and hand back every row reference it held.
    fn stop(&self) -> Vec<String> {
        let mut owned = locks::lock(&self.owned);
        owned.stopped = true;
        owned
            .counts
            .drain()
            .flat_map(|(id, count)| std::iter::repeat(id).take(count))
            .collect()
    }
}

struct Feed {
    state: Arc<FeedState>,
    task: JoinHandle<()>,
}

/// Filtered, live view over a mirror container, optionally fed by its own
/// subscription. Dropping the view stops the subscription and releases the
/// rows it contributed.
pub struct LiveView {
    container: MirrorContainer,
    filter: Filter,
    version: watch::Receiver<u64>,
    feed: Option<Feed>,
}

impl fmt::Debug for LiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveView")
            .field("container", &self.container.name())
            .field("filter", &self.filter)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl LiveView {
    /// A view whose rows are supplied by `subscription`.
    pub fn subscribed(container: MirrorContainer, filter: Filter, mut subscription: Subscription) -> Self {
        let state = Arc::new(FeedState::default());
        let feed_state = state.clone();
        let target = container.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                match &event {
                    PublicationEvent::Ready => {
                        feed_state.ready.store(true, Ordering::SeqCst);
                        target.touch();
                    }
                    PublicationEvent::Error { error } => {
                        *locks::lock(&feed_state.error) = Some(error.clone());
                        target.touch();
                        break;
                    }
                    _ => {
                        if !feed_state.apply_row(&target, &event) {
                            break;
                        }
                    }
                }
            }
            debug!("Feed of {} ended", subscription.publication());
        });

        let mut view = container.find(filter);
        view.feed = Some(Feed { state, task });
        view
    }

    pub fn container(&self) -> &MirrorContainer {
        &self.container
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Current matching rows, each with its id under `_id`.
    pub fn snapshot(&self) -> Vec<Value> {
        self.container.snapshot(&self.filter)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the feeding subscription delivered its initial snapshot.
    /// Views without a subscription are always ready.
    pub fn is_ready(&self) -> bool {
        match &self.feed {
            Some(feed) => feed.state.ready.load(Ordering::SeqCst),
            None => true,
        }
    }

    /// The error that ended the feeding subscription, if any.
    pub fn error(&self) -> Option<RemoteError> {
        self.feed
            .as_ref()
            .and_then(|feed| locks::lock(&feed.state.error).clone())
    }

    /// Wait for the next change to the container. `false` once no further
    /// change can happen.
    pub async fn changed(&mut self) -> bool {
        self.version.changed().await.is_ok()
    }

    /// Wait until the initial snapshot is in, or the subscription failed.
    pub async fn ready(&mut self) -> Result<(), RemoteError> {
        loop {
            if let Some(error) = self.error() {
                return Err(error);
            }
            if self.is_ready() {
                return Ok(());
            }
            if !self.changed().await {
                return Err(RemoteError::transport("Mirror container closed"));
            }
        }
    }

    /// Stop the feeding subscription and release its rows.
    pub fn stop(&mut self) {
        let Some(feed) = self.feed.take() else {
            return;
        };
        let owned = feed.state.stop();
        feed.task.abort();
        self.container.release(owned);
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.stop();
    }
}
