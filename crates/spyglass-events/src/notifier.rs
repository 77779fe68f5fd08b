use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::script_events::ScriptStateChanged;

/// Receives script state changes; owned by the surrounding application
pub trait Notifier: Send + Sync + 'static {
    fn on_state_changed(&self, event: &ScriptStateChanged);
}

/// Forwards every event into a channel
impl Notifier for UnboundedSender<ScriptStateChanged> {
    fn on_state_changed(&self, event: &ScriptStateChanged) {
        let _ = self.send(event.clone());
    }
}

/// Simple notifier that logs all state changes
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn on_state_changed(&self, event: &ScriptStateChanged) {
        info!(target: "events", "Script {} is now {}", event.script_id, event.new_state);
    }
}

/// Hands state changes to a notifier on a separate task.
///
/// `dispatch` only enqueues, so a script thread never waits on the notifier
/// and a slow notifier never holds up a script. Events are delivered in the
/// order they were dispatched.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sender: UnboundedSender<ScriptStateChanged>,
}

impl NotificationDispatcher {
    /// Spawn the delivery task on the given runtime
    pub fn spawn(handle: &Handle, notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ScriptStateChanged>();

        let task = handle.spawn(async move {
            while let Some(event) = receiver.recv().await {
                notifier.on_state_changed(&event);
                trace!(target: "events", "Notified [{}] script's state to [{}]", event.script_id, event.new_state);
            }
            debug!(target: "events", "Notification dispatcher shutting down");
        });

        (Self { sender }, task)
    }

    /// A dispatcher that drops every event
    pub fn disabled() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self { sender }
    }

    /// Queue an event for delivery
    pub fn dispatch(&self, event: ScriptStateChanged) {
        if let Err(e) = self.sender.send(event) {
            trace!(target: "events", "Dropping state change for {}: dispatcher closed", e.0.script_id);
        }
    }
}
