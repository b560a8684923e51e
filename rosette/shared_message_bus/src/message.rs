use std::any::Any;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata carried by every message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message identifier.
    pub id: Uuid,
    /// Name of the publishing node.
    pub source: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    /// Stamps a fresh header for a message published by `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A value that can travel over the bus.
///
/// Messages are immutable once published; the bus only ever hands out shared
/// references to them.
pub trait Message: Any + Send + Sync {
    /// Header stamped when the message was created.
    fn header(&self) -> &MessageHeader;
}
