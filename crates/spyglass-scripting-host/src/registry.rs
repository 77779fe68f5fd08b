use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use spyglass_config::ScriptingConfig;
use spyglass_events::NotificationDispatcher;

use crate::context::ScriptArgs;
use crate::io::MessageTransport;
use crate::manager::ScriptManager;

/// Create a script manager from config and register the configured scripts
pub fn create_manager_from_config(
    handle: Handle,
    dispatcher: NotificationDispatcher,
    transport: Arc<dyn MessageTransport>,
    config: &ScriptingConfig,
) -> ScriptManager {
    debug!(target: "scripting", "Creating script manager");
    let manager = ScriptManager::new(handle, dispatcher, transport)
        .with_watchdog_interval(config.watchdog_interval());

    manager.add_custom_parameters(parameters_from_config(config));

    if config.enabled {
        manager.populate_scripts(&config.scripts);
        let script_dir = config.script_dir();
        debug!(target: "scripting", "Loading scripts from: {}", script_dir.display());
        manager.populate_from_directory(&script_dir, config.recursive);
    }

    manager
}

/// Start every registered auto-start script asynchronously; returns how many started
pub fn run_auto_start_scripts(manager: &ScriptManager) -> usize {
    manager
        .scripts()
        .iter()
        .filter(|script| script.is_auto_start())
        .filter(|script| manager.run_script(script, true, None))
        .count()
}

fn parameters_from_config(config: &ScriptingConfig) -> ScriptArgs {
    let mut parameters = ScriptArgs::new();
    for (name, value) in &config.parameters {
        match serde_json::to_value(value) {
            Ok(value) => {
                parameters.insert(name.clone(), value);
            }
            Err(e) => {
                warn!(target: "scripting", "Ignoring parameter {}: {}", name, e);
            }
        }
    }
    parameters
}
