//! Consumer side of an open subscription.

use super::event::PublicationEvent;
use super::source::StopHandle;
use tokio::sync::mpsc;
use tracing::debug;

/// An open subscription to a publication.
///
/// Events arrive in order through [`Subscription::next_event`]. After
/// [`Subscription::stop`] (or drop) no further event is delivered.
pub struct Subscription {
    publication: String,
    mirror: String,
    events: mpsc::UnboundedReceiver<PublicationEvent>,
    stop: StopHandle,
    ready: bool,
    stopped: bool,
}

impl Subscription {
    /// Assemble a subscription from its event stream and release handle.
    ///
    /// Used by transports; application code receives subscriptions from
    /// [`Registry::subscribe`](crate::Registry::subscribe) or a
    /// [`Transport`](crate::Transport).
    pub fn new(
        publication: impl Into<String>,
        mirror: impl Into<String>,
        events: mpsc::UnboundedReceiver<PublicationEvent>,
        stop: StopHandle,
    ) -> Self {
        Self {
            publication: publication.into(),
            mirror: mirror.into(),
            events,
            stop,
            ready: false,
            stopped: false,
        }
    }

    pub fn publication(&self) -> &str {
        &self.publication
    }

    /// Mirror container the row events apply to.
    pub fn mirror_name(&self) -> &str {
        &self.mirror
    }

    /// Wait for the next event. `None` once the subscription has ended.
    pub async fn next_event(&mut self) -> Option<PublicationEvent> {
        if self.stopped {
            return None;
        }
        let event = self.events.recv().await?;
        Some(self.observe(event))
    }

    /// The next already-delivered event, without waiting.
    pub fn try_next_event(&mut self) -> Option<PublicationEvent> {
        if self.stopped {
            return None;
        }
        let event = self.events.try_recv().ok()?;
        Some(self.observe(event))
    }

    fn observe(&mut self, event: PublicationEvent) -> PublicationEvent {
        match &event {
            PublicationEvent::Ready => self.ready = true,
            PublicationEvent::Error { .. } => self.stopped = true,
            _ => {}
        }
        event
    }

    /// Whether the initial snapshot has been received.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop the subscription and release its observers. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped && self.stop.is_stopped() {
            return;
        }
        debug!("Stopping subscription to {}", self.publication);
        self.stopped = true;
        self.stop.stop();
        self.events.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("publication", &self.publication)
            .field("mirror", &self.mirror)
            .field("ready", &self.ready)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ready_and_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let mut sub = Subscription::new(
            "todos.all",
            "todos",
            rx,
            StopHandle::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tx.send(PublicationEvent::Ready).unwrap();
        assert_eq!(sub.next_event().await, Some(PublicationEvent::Ready));
        assert!(sub.is_ready());

        tx.send(PublicationEvent::Ready).unwrap();
        sub.stop();
        sub.stop();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(sub.next_event().await, None);
        assert!(tx.send(PublicationEvent::Ready).is_err());
    }

    #[tokio::test]
    async fn test_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("p", "p", rx, StopHandle::noop());
        drop(tx);
        assert_eq!(sub.next_event().await, None);
        assert_eq!(sub.try_next_event(), None);
    }
}
