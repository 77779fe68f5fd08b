use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while registering, evaluating or invoking scripts
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The configured script file does not exist
    #[error("Script {} does not exist", .0.display())]
    NotFound(PathBuf),

    /// The script file exists but could not be read
    #[error("Cannot read script {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source text is not a valid script
    #[error("Compile error: {0}")]
    Compile(String),

    /// The script raised an error while running
    #[error("Execution error: {0}")]
    Evaluation(String),

    /// Evaluation ended because a stop was requested
    #[error("Script stopped on request")]
    Cancelled,

    /// The script's runtime is in use by another invocation
    #[error("Script {0} is busy")]
    Busy(String),

    /// A host facility used by the script failed
    #[error("{0}")]
    Runtime(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;
