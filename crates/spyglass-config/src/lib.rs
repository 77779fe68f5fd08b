pub mod paths;
pub mod scripting_config;
pub mod spyglass_config;

pub use paths::ProjectPaths;
pub use scripting_config::{ScriptDetails, ScriptingConfig, DEFAULT_SCRIPT_TIMEOUT_MS};
pub use spyglass_config::{ConfigLoadError, SpyglassConfig};
