use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use spyglass_events::SpyMessage;
use spyglass_scripting_host::MessageTransport;

/// Local stand-in for a broker connection.
///
/// Publications are logged and looped back to exact-topic subscriptions,
/// so scripts that read their own traffic can be exercised offline.
#[derive(Default)]
pub struct LoggingTransport {
    next_id: AtomicU64,
    subscriptions: Mutex<HashSet<String>>,
    received: Mutex<HashMap<String, Vec<SpyMessage>>>,
}

impl MessageTransport for LoggingTransport {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) -> bool {
        let payload = String::from_utf8_lossy(payload);
        info!(
            target: "transport",
            "PUBLISH {} qos={} retained={} {}",
            topic, qos, retained, payload
        );

        let subscribed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic);
        if subscribed {
            let message = SpyMessage::new(topic, payload)
                .with_id(self.next_id.fetch_add(1, Ordering::Relaxed))
                .with_qos(qos)
                .with_retained(retained);
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(topic.to_string())
                .or_default()
                .push(message);
        }
        true
    }

    fn subscribe(&self, topic: &str, qos: u8) -> bool {
        info!(target: "transport", "SUBSCRIBE {} qos={}", topic, qos);
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        true
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        info!(target: "transport", "UNSUBSCRIBE {}", topic);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
    }

    fn messages(&self, topic: &str) -> Vec<SpyMessage> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}
