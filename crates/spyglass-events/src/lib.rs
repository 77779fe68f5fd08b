/// Core event types for the spyglass script engine
///
/// This crate holds the values that cross the boundary between the engine and
/// the surrounding application (state changes, messages, the notifier seam),
/// so collaborators can depend on it without pulling in the engine itself.
pub mod message;
pub mod notifier;
pub mod script_events;

pub use message::SpyMessage;
pub use notifier::{LoggingNotifier, NotificationDispatcher, Notifier};
pub use script_events::{ScriptRunningState, ScriptStateChanged};
