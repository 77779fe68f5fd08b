use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as seen by scripts, either the one that triggered a run or one
/// retrieved from a subscription store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpyMessage {
    /// Sequence number assigned by the transport (0 if unknown)
    pub id: u64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retained: bool,
    pub timestamp: DateTime<Utc>,
}

impl SpyMessage {
    /// Create a QoS 0, non-retained message stamped with the current time
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: 0,
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retained: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}
