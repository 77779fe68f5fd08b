mod rhai_runtime;

pub use rhai_runtime::RhaiRuntime;

use std::sync::Arc;

use spyglass_events::ScriptRunningState;

use crate::context::{InvocationContext, ScriptValue};
use crate::error::ScriptResult;

/// How a completed evaluation wants its run to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    /// The body returned normally (any value other than `false`)
    Finished,
    /// The body returned `false`
    StoppedByScript,
}

impl EvalOutcome {
    pub fn state(self) -> ScriptRunningState {
        match self {
            EvalOutcome::Finished => ScriptRunningState::Finished,
            EvalOutcome::StoppedByScript => ScriptRunningState::Stopped,
        }
    }
}

/// A script language the engine can drive.
///
/// One instance is created per registered script and is only ever used
/// by one invocation at a time. Implementations must end evaluation with
/// [`ScriptError::Cancelled`](crate::ScriptError::Cancelled) soon after the
/// context's cancellation token fires.
pub trait ScriptRuntime: Send {
    /// Evaluate a whole script body
    fn evaluate(&mut self, source: &str, ctx: &InvocationContext) -> ScriptResult<EvalOutcome>;

    /// Call a top-level function defined in `source`.
    ///
    /// Returns `Ok(None)` when no function with that name and arity exists.
    fn invoke_function(
        &mut self,
        source: &str,
        function: &str,
        args: &[ScriptValue],
        ctx: &InvocationContext,
    ) -> ScriptResult<Option<ScriptValue>>;
}

/// Builds the runtime for a script, given its name
pub type RuntimeFactory = Arc<dyn Fn(&str) -> Box<dyn ScriptRuntime> + Send + Sync>;

pub fn rhai_runtime_factory() -> RuntimeFactory {
    Arc::new(|name: &str| Box::new(RhaiRuntime::new(name)) as Box<dyn ScriptRuntime>)
}
