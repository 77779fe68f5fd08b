use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use spyglass_events::SpyMessage;

use crate::error::{ScriptError, ScriptResult};
use crate::script::ScriptTelemetry;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Connection-facing operations available to scripts.
///
/// Implemented by whatever owns the broker connection. Every method may be
/// called from a blocking evaluation thread.
pub trait MessageTransport: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) -> bool;

    fn subscribe(&self, _topic: &str, _qos: u8) -> bool {
        false
    }

    fn unsubscribe(&self, _topic: &str) -> bool {
        false
    }

    /// Messages received so far on the given subscription
    fn messages(&self, _topic: &str) -> Vec<SpyMessage> {
        Vec::new()
    }
}

/// Transport for engines without a connection; drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl MessageTransport for NullTransport {
    fn publish(&self, topic: &str, _payload: &[u8], _qos: u8, _retained: bool) -> bool {
        trace!(target: "scripting", "No connection, dropping publication on {}", topic);
        false
    }
}

/// The I/O bridge bound into every evaluation as `spy` (and `mqtt`).
///
/// Besides forwarding to the transport, every call that does real work
/// refreshes the script's heartbeat.
#[derive(Clone)]
pub struct ScriptIo {
    script_name: String,
    telemetry: Arc<ScriptTelemetry>,
    transport: Arc<dyn MessageTransport>,
    cancel: CancellationToken,
}

impl ScriptIo {
    pub fn new(
        script_name: impl Into<String>,
        telemetry: Arc<ScriptTelemetry>,
        transport: Arc<dyn MessageTransport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            script_name: script_name.into(),
            telemetry,
            transport,
            cancel,
        }
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn touch(&self) {
        self.telemetry.touch();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        debug!(target: "scripting", "Timeout for script {} changed to {:?}", self.script_name, timeout);
        self.telemetry.set_timeout(timeout);
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a shell command and return its standard output
    pub fn execute(&self, command: &str) -> ScriptResult<String> {
        self.touch();
        debug!(target: "scripting", "Script {} executing: {}", self.script_name, command);

        let output = shell(command).output().map_err(|e| {
            ScriptError::Runtime(format!("Cannot execute '{}': {}", command, e))
        })?;

        if !output.status.success() {
            warn!(
                target: "scripting",
                "Command '{}' from {} exited with {}",
                command, self.script_name, output.status
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Sleep for the given duration; returns `false` if woken by a stop request
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) -> bool {
        self.touch();
        let published = self.transport.publish(topic, payload, qos, retained);
        if published {
            self.telemetry.record_publication();
        }
        published
    }

    pub fn subscribe(&self, topic: &str, qos: u8) -> bool {
        self.touch();
        self.transport.subscribe(topic, qos)
    }

    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.touch();
        self.transport.unsubscribe(topic)
    }

    pub fn messages(&self, topic: &str) -> Vec<SpyMessage> {
        self.touch();
        self.transport.messages(topic)
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
