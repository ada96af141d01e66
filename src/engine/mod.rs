mod process;
#[cfg(test)]
pub(crate) mod scripted;

pub use process::ProcessEngine;

use crate::model::{ResultKey, ResultTable};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no record attached")]
    NotAttached,

    #[error("cannot attach record '{record}': {reason}")]
    Attach { record: String, reason: String },

    #[error("failed to launch engine {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("engine produced malformed output: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("no table for {0}")]
    UnknownTable(ResultKey),

    #[error("{0}")]
    Other(String),
}

/// Synchronous binding to the analysis engine.
///
/// Calls may block for as long as the engine takes; the job lane is the only
/// caller, so implementations need not be `Sync`.
pub trait EngineBinding: Send + 'static {
    /// Make `record` the subject of subsequent evaluations.
    fn attach(&mut self, record: &str) -> Result<(), EngineError>;

    /// Run a command string and return its textual log.
    fn evaluate(&mut self, command: &str) -> Result<String, EngineError>;

    /// Keys of the tables produced by the last evaluation.
    fn list_result_tables(&self) -> Vec<ResultKey>;

    fn get_table(&self, key: &ResultKey) -> Result<ResultTable, EngineError>;

    fn reset_variables(&mut self);

    fn apply_variable(&mut self, name: &str, value: &str);

    /// Run a directive whose output is discarded.
    fn silent_directive(&mut self, text: &str) -> Result<(), EngineError>;
}
