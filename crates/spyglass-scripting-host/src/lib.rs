//! Script execution engine for spyglass.
//!
//! Scripts are registered with a [`ScriptManager`], run through a
//! [`ScriptRunner`] and, when asynchronous, supervised by a
//! [`HealthWatchdog`] that flags scripts that stop responding. Every state
//! change is handed to a [`NotificationDispatcher`](spyglass_events::NotificationDispatcher).

pub mod context;
pub mod error;
pub mod io;
pub mod manager;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod script;
pub mod script_runner;
pub mod script_scanner;
pub mod watchdog;

pub use context::{InvocationContext, ScriptArgs, ScriptValue};
pub use error::{ScriptError, ScriptResult};
pub use io::{MessageTransport, NullTransport, ScriptIo};
pub use manager::ScriptManager;
pub use registry::{create_manager_from_config, run_auto_start_scripts};
pub use reload::{setup_reload_signal, ReloadSignal};
pub use runtime::{EvalOutcome, RhaiRuntime, RuntimeFactory, ScriptRuntime};
pub use script::{Script, ScriptSource, ScriptTelemetry, StoppableTask, SCRIPT_EXTENSION};
pub use script_runner::{RunMode, RunReport, ScriptRunner};
pub use script_scanner::{list_script_files, ScanResult, ScriptScanner};
pub use watchdog::{HealthWatchdog, DEFAULT_WATCHDOG_INTERVAL};

pub use spyglass_events::{ScriptRunningState, ScriptStateChanged, SpyMessage};
