#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use spyglass_events::NotificationDispatcher;
use spyglass_scripting_host::{
    MessageTransport, Script, ScriptManager, ScriptRunningState, ScriptStateChanged, SpyMessage,
};

/// Accepts every publication and serves them back through `messages`
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<SpyMessage>>,
}

impl RecordingTransport {
    pub fn published(&self) -> Vec<SpyMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages(topic).into_iter().map(|m| m.payload).collect()
    }
}

impl MessageTransport for RecordingTransport {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) -> bool {
        let mut published = self.published.lock().unwrap();
        let id = published.len() as u64;
        published.push(
            SpyMessage::new(topic, String::from_utf8_lossy(payload))
                .with_id(id)
                .with_qos(qos)
                .with_retained(retained),
        );
        true
    }

    fn messages(&self, topic: &str) -> Vec<SpyMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

pub struct Harness {
    pub manager: Arc<ScriptManager>,
    pub transport: Arc<RecordingTransport>,
    pub events: UnboundedReceiver<ScriptStateChanged>,
}

pub fn harness(watchdog_interval: Duration) -> Harness {
    let (tx, events) = mpsc::unbounded_channel();
    let (dispatcher, _task) = NotificationDispatcher::spawn(&Handle::current(), Arc::new(tx));
    let transport = Arc::new(RecordingTransport::default());
    let manager = ScriptManager::new(Handle::current(), dispatcher, transport.clone())
        .with_watchdog_interval(watchdog_interval);

    Harness {
        manager: Arc::new(manager),
        transport,
        events,
    }
}

/// Poll until the script reaches `state`
pub async fn wait_for_state(script: &Script, state: ScriptRunningState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if script.status() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    script.status() == state
}

/// Poll until no run owns the script any more
pub async fn wait_until_idle(script: &Script, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !script.is_active() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    !script.is_active()
}

/// Every state notified for the script once its run has ended
pub async fn settled_states(
    events: &mut UnboundedReceiver<ScriptStateChanged>,
    script: &Script,
    timeout: Duration,
) -> Vec<ScriptRunningState> {
    wait_until_idle(script, timeout).await;

    let mut states = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if event.script_id == script.id() {
            states.push(event.new_state);
        }
    }
    states
}
