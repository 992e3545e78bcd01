//! Server-side state of one active subscription.
//!
//! Every cursor of a subscription reports into the same [`ObserverBinding`],
//! which tags row events with the mirror name and forwards them to the
//! subscriber over an unbounded channel. Once stopped, the binding drops its
//! sender, so nothing more can be delivered.

use super::event::PublicationEvent;
use super::source::{ChangeSink, Fields, StopHandle};
use crate::error::{RemoteError, RpcError};
use crate::locks;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub(crate) struct ObserverBinding {
    publication: String,
    mirror: String,
    tx: Mutex<Option<mpsc::UnboundedSender<PublicationEvent>>>,
    ready: AtomicBool,
    handles: Mutex<Vec<StopHandle>>,
}

impl ObserverBinding {
    pub(crate) fn new(
        publication: String,
        mirror: String,
        tx: mpsc::UnboundedSender<PublicationEvent>,
    ) -> Self {
        Self {
            publication,
            mirror,
            tx: Mutex::new(Some(tx)),
            ready: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, event: PublicationEvent) {
        let tx = locks::lock(&self.tx);
        if let Some(tx) = tx.as_ref() {
            if tx.send(event).is_err() {
                debug!("Subscriber of {} went away", self.publication);
            }
        }
    }

    /// Keep a cursor's stop handle until the binding stops.
    pub(crate) fn attach(&self, handle: StopHandle) {
        let mut handles = locks::lock(&self.handles);
        if self.is_stopped() {
            drop(handles);
            handle.stop();
            return;
        }
        handles.push(handle);
    }

    pub(crate) fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            debug!("Subscription to {} is ready", self.publication);
            self.emit(PublicationEvent::Ready);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        locks::lock(&self.tx).is_none()
    }

    /// Release every cursor. Idempotent.
    pub(crate) fn stop(&self) {
        let tx = locks::lock(&self.tx).take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let handles = std::mem::take(&mut *locks::lock(&self.handles));
        for handle in handles {
            handle.stop();
        }
        debug!("Subscription to {} stopped", self.publication);
    }
}

impl ChangeSink for ObserverBinding {
    fn added(&self, id: &str, fields: Fields) {
        self.emit(PublicationEvent::Added {
            collection: self.mirror.clone(),
            id: id.to_string(),
            fields,
        });
    }

    fn changed(&self, id: &str, fields: Fields, cleared: Vec<String>) {
        self.emit(PublicationEvent::Changed {
            collection: self.mirror.clone(),
            id: id.to_string(),
            fields,
            cleared,
        });
    }

    fn removed(&self, id: &str) {
        self.emit(PublicationEvent::Removed {
            collection: self.mirror.clone(),
            id: id.to_string(),
        });
    }

    fn failed(&self, err: RpcError) {
        error!("Publication {} failed: {}", self.publication, err);
        self.emit(PublicationEvent::Error {
            error: RemoteError::from(&err),
        });
        self.stop();
    }
}
