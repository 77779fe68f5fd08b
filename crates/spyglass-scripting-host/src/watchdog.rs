use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use spyglass_events::{NotificationDispatcher, ScriptRunningState};

use crate::script::Script;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Whether a script that last touched `idle` ago has outlived its timeout
pub fn is_unresponsive(idle: Duration, timeout: Duration) -> bool {
    idle > timeout
}

/// Marks a running script as not responding once it stops touching.
///
/// One watchdog covers one pass of an asynchronous run and goes away when
/// the pass ends or the script leaves Running.
pub struct HealthWatchdog {
    script: Arc<Script>,
    dispatcher: NotificationDispatcher,
    interval: Duration,
    pass: CancellationToken,
}

impl HealthWatchdog {
    pub fn new(
        script: Arc<Script>,
        dispatcher: NotificationDispatcher,
        interval: Duration,
        pass: CancellationToken,
    ) -> Self {
        Self {
            script,
            dispatcher,
            interval,
            pass,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        while self.script.status() == ScriptRunningState::Running {
            tokio::select! {
                _ = self.pass.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.pass.is_cancelled() {
                break;
            }

            let idle = self.script.telemetry().idle_for();
            let timeout = self.script.timeout();
            if is_unresponsive(idle, timeout) && self.script.freeze_if_running(&self.dispatcher) {
                warn!(
                    target: "scripting",
                    "Script {} not responding (last touch {} ms ago, timeout {} ms)",
                    self.script.name(),
                    idle.as_millis(),
                    timeout.as_millis()
                );
            }
        }

        debug!(target: "scripting", "Watchdog for {} ended", self.script.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_unresponsive() {
        let timeout = Duration::from_millis(200);
        assert!(!is_unresponsive(Duration::from_millis(100), timeout));
        assert!(!is_unresponsive(Duration::from_millis(200), timeout));
        assert!(is_unresponsive(Duration::from_millis(201), timeout));
    }
}
