use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use spyglass_events::{NotificationDispatcher, ScriptRunningState};

use crate::context::InvocationContext;
use crate::error::{ScriptError, ScriptResult};
use crate::runtime::EvalOutcome;
use crate::script::Script;
use crate::watchdog::HealthWatchdog;

/// Where a run executes
#[derive(Debug, Clone)]
pub enum RunMode {
    /// On the caller's thread, one pass, `repeat` ignored
    Synchronous,
    /// On a blocking task, watched, repeating when configured
    Asynchronous(Handle),
}

impl RunMode {
    pub fn is_asynchronous(&self) -> bool {
        matches!(self, RunMode::Asynchronous(_))
    }
}

/// What a finished run went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub script_id: String,
    pub final_state: ScriptRunningState,
    pub passes: u32,
    pub error: Option<String>,
}

/// Executes one script body until it reaches a terminal state.
///
/// The script must already have been claimed with a successful
/// `Script::begin_run`, so the first pass starts in Running.
pub struct ScriptRunner {
    script: Arc<Script>,
    ctx: InvocationContext,
    dispatcher: NotificationDispatcher,
    mode: RunMode,
    watchdog_interval: Duration,
}

impl ScriptRunner {
    pub(crate) fn new(
        script: Arc<Script>,
        ctx: InvocationContext,
        dispatcher: NotificationDispatcher,
        mode: RunMode,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            script,
            ctx,
            dispatcher,
            mode,
            watchdog_interval,
        }
    }

    /// Blocks until the run ends
    pub fn run(self) -> RunReport {
        let repeat = self.script.is_repeat() && self.mode.is_asynchronous();
        let mut passes = 0;
        let mut failure = None;

        debug!(target: "scripting", "Running script {}", self.script.name());

        let final_state = loop {
            passes += 1;
            self.script.touch();

            let watch = self.start_watchdog();
            let result = self.evaluate_once();
            if let Some(pass) = watch {
                pass.cancel();
            }

            match result {
                Err(ScriptError::Cancelled) => break ScriptRunningState::Stopped,
                Err(e) => {
                    error!(target: "scripting", "Script {} failed: {}", self.script.name(), e);
                    self.script.set_last_error(&e);
                    failure = Some(e.to_string());
                    break ScriptRunningState::Failed;
                }
                Ok(_) if self.ctx.is_cancelled() => break ScriptRunningState::Stopped,
                Ok(EvalOutcome::StoppedByScript) => break ScriptRunningState::Stopped,
                Ok(EvalOutcome::Finished) if repeat => {
                    self.script
                        .transition(ScriptRunningState::Finished, &self.dispatcher);
                    self.script
                        .transition(ScriptRunningState::Running, &self.dispatcher);
                }
                Ok(EvalOutcome::Finished) => break ScriptRunningState::Finished,
            }
        };

        self.script.stop_tasks();
        self.script.complete_run(final_state, &self.dispatcher);

        info!(
            target: "scripting",
            "Script {} ended as {} after {} pass(es)",
            self.script.name(),
            final_state,
            passes
        );

        RunReport {
            script_id: self.script.id().to_string(),
            final_state,
            passes,
            error: failure,
        }
    }

    fn evaluate_once(&self) -> ScriptResult<EvalOutcome> {
        // Re-read every pass so edits to the file apply to the next pass
        let source = self.script.source().read()?;
        self.script
            .with_runtime(|runtime| runtime.evaluate(&source, &self.ctx))
    }

    fn start_watchdog(&self) -> Option<CancellationToken> {
        let RunMode::Asynchronous(handle) = &self.mode else {
            return None;
        };

        let pass = self.ctx.io().cancellation().child_token();
        let watchdog = HealthWatchdog::new(
            self.script.clone(),
            self.dispatcher.clone(),
            self.watchdog_interval,
            pass.clone(),
        );
        handle.spawn(watchdog.run());
        Some(pass)
    }
}
