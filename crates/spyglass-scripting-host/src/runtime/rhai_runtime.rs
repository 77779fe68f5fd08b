use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST, INT};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{EvalOutcome, ScriptRuntime};
use crate::context::{InvocationContext, ScriptValue};
use crate::error::{ScriptError, ScriptResult};
use crate::io::ScriptIo;

const SPY_BINDING: &str = "spy";
const MQTT_BINDING: &str = "mqtt";
const LOGGER_BINDING: &str = "logger";

/// Per-script logger bound as `logger`
#[derive(Debug, Clone)]
struct ScriptLogger {
    script: Arc<str>,
}

/// [`ScriptRuntime`] backed by an embedded Rhai engine
pub struct RhaiRuntime {
    engine: Engine,
    script_name: Arc<str>,
}

impl RhaiRuntime {
    pub fn new(script_name: &str) -> Self {
        let script_name: Arc<str> = Arc::from(script_name);
        let mut engine = Engine::new();
        register_bridge(&mut engine);

        let name = script_name.clone();
        engine.on_print(move |text| info!(target: "script", "[{}] {}", name, text));
        let name = script_name.clone();
        engine.on_debug(move |text, _source, pos| {
            debug!(target: "script", "[{}] {} @ {}", name, text, pos)
        });

        Self {
            engine,
            script_name,
        }
    }

    fn compile(&self, source: &str) -> ScriptResult<AST> {
        let mut ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        ast.set_source(self.script_name.as_ref());
        Ok(ast)
    }

    /// Install the cancellation check and the bindings for one invocation.
    ///
    /// Bindings are pushed into the top-level scope and also resolved for
    /// function bodies, which do not see the caller's scope.
    #[allow(deprecated)]
    fn prepare(&mut self, ctx: &InvocationContext) -> ScriptResult<Scope<'static>> {
        let cancel = ctx.io().cancellation().clone();
        self.engine
            .on_progress(move |_| cancel.is_cancelled().then_some(Dynamic::UNIT));

        let mut globals: BTreeMap<String, Dynamic> = BTreeMap::new();
        for (name, value) in ctx.bindings() {
            let value = to_dynamic(value)
                .map_err(|e| ScriptError::Runtime(format!("Cannot bind '{}': {}", name, e)))?;
            globals.insert(name.clone(), value);
        }
        globals.insert(SPY_BINDING.into(), Dynamic::from(ctx.io().clone()));
        globals.insert(MQTT_BINDING.into(), Dynamic::from(ctx.io().clone()));
        globals.insert(
            LOGGER_BINDING.into(),
            Dynamic::from(ScriptLogger {
                script: self.script_name.clone(),
            }),
        );

        let mut scope = Scope::new();
        for (name, value) in &globals {
            scope.push_dynamic(name.as_str(), value.clone());
        }

        let globals = Arc::new(globals);
        self.engine.on_var(move |name, _index, context| {
            if context.scope().contains(name) {
                return Ok(None);
            }
            Ok(globals.get(name).cloned())
        });

        Ok(scope)
    }
}

impl ScriptRuntime for RhaiRuntime {
    fn evaluate(&mut self, source: &str, ctx: &InvocationContext) -> ScriptResult<EvalOutcome> {
        let ast = self.compile(source)?;
        let mut scope = self.prepare(ctx)?;

        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(map_eval_error)?;

        Ok(outcome_of(&value))
    }

    fn invoke_function(
        &mut self,
        source: &str,
        function: &str,
        args: &[ScriptValue],
        ctx: &InvocationContext,
    ) -> ScriptResult<Option<ScriptValue>> {
        let ast = self.compile(source)?;
        let defined = ast
            .iter_functions()
            .any(|f| f.name == function && f.params.len() == args.len());
        if !defined {
            trace!(target: "scripting", "{} does not define {}/{}", self.script_name, function, args.len());
            return Ok(None);
        }

        let mut scope = self.prepare(ctx)?;
        let args = args
            .iter()
            .map(to_dynamic)
            .collect::<Result<Vec<Dynamic>, _>>()
            .map_err(|e| ScriptError::Runtime(format!("Cannot pass arguments: {}", e)))?;

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let value = self
            .engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &ast, function, args)
            .map_err(map_eval_error)?;

        Ok(Some(to_script_value(&value)))
    }
}

fn register_bridge(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptIo>("ScriptIo")
        .register_fn("touch", |io: &mut ScriptIo| io.touch())
        .register_fn("setTimeout", |io: &mut ScriptIo, ms: INT| {
            io.set_timeout(millis(ms))
        })
        .register_fn(
            "execute",
            |io: &mut ScriptIo, command: &str| -> Result<String, Box<EvalAltResult>> {
                io.execute(command).map_err(|e| e.to_string().into())
            },
        )
        .register_fn("sleep", |io: &mut ScriptIo, ms: INT| io.sleep(millis(ms)))
        .register_fn("publish", |io: &mut ScriptIo, topic: &str, payload: &str| {
            io.publish(topic, payload.as_bytes(), 0, false)
        })
        .register_fn(
            "publish",
            |io: &mut ScriptIo, topic: &str, payload: &str, qos: INT, retained: bool| {
                io.publish(topic, payload.as_bytes(), qos.clamp(0, 2) as u8, retained)
            },
        )
        .register_fn("subscribe", |io: &mut ScriptIo, topic: &str| {
            io.subscribe(topic, 0)
        })
        .register_fn("subscribe", |io: &mut ScriptIo, topic: &str, qos: INT| {
            io.subscribe(topic, qos.clamp(0, 2) as u8)
        })
        .register_fn("unsubscribe", |io: &mut ScriptIo, topic: &str| {
            io.unsubscribe(topic)
        })
        .register_fn(
            "getMessages",
            |io: &mut ScriptIo, topic: &str| -> Result<Array, Box<EvalAltResult>> {
                io.messages(topic).iter().map(to_dynamic).collect()
            },
        );

    engine
        .register_type_with_name::<ScriptLogger>("Logger")
        .register_fn("trace", |l: &mut ScriptLogger, msg: &str| {
            trace!(target: "script", "[{}] {}", l.script, msg)
        })
        .register_fn("debug", |l: &mut ScriptLogger, msg: &str| {
            debug!(target: "script", "[{}] {}", l.script, msg)
        })
        .register_fn("info", |l: &mut ScriptLogger, msg: &str| {
            info!(target: "script", "[{}] {}", l.script, msg)
        })
        .register_fn("warn", |l: &mut ScriptLogger, msg: &str| {
            warn!(target: "script", "[{}] {}", l.script, msg)
        })
        .register_fn("error", |l: &mut ScriptLogger, msg: &str| {
            error!(target: "script", "[{}] {}", l.script, msg)
        });
}

fn millis(ms: INT) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// `false` stops the run; anything else, including no value, finishes it
fn outcome_of(value: &Dynamic) -> EvalOutcome {
    match value.as_bool() {
        Ok(false) => EvalOutcome::StoppedByScript,
        _ => EvalOutcome::Finished,
    }
}

fn to_script_value(value: &Dynamic) -> ScriptValue {
    from_dynamic::<ScriptValue>(value).unwrap_or_else(|_| ScriptValue::String(value.to_string()))
}

fn is_termination(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_termination(inner),
        _ => false,
    }
}

fn map_eval_error(err: Box<EvalAltResult>) -> ScriptError {
    if is_termination(&err) {
        ScriptError::Cancelled
    } else {
        ScriptError::Evaluation(err.to_string())
    }
}
