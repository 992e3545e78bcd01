//! Events delivered to a subscriber.

use super::source::Fields;
use crate::error::RemoteError;
use serde::{Deserialize, Serialize};

/// One entry of a subscription's diff stream.
///
/// Row events are tagged with the mirror container they apply to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum PublicationEvent {
    Added {
        collection: String,
        id: String,
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        fields: Fields,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    /// The initial snapshot has been delivered.
    Ready,
    /// The subscription failed and has been stopped.
    Error { error: RemoteError },
}

impl PublicationEvent {
    /// Id of the row this event applies to, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            PublicationEvent::Added { id, .. }
            | PublicationEvent::Changed { id, .. }
            | PublicationEvent::Removed { id, .. } => Some(id),
            PublicationEvent::Ready | PublicationEvent::Error { .. } => None,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            PublicationEvent::Added { collection, .. }
            | PublicationEvent::Changed { collection, .. }
            | PublicationEvent::Removed { collection, .. } => Some(collection),
            PublicationEvent::Ready | PublicationEvent::Error { .. } => None,
        }
    }

    /// Whether no event can follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublicationEvent::Error { .. })
    }
}
