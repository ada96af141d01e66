//! Engine binding backed by an external program.
//!
//! Each evaluation runs `<program> <args...> <record> [name=value ...]` with the
//! command text on stdin and expects a single JSON document on stdout.

use super::{EngineBinding, EngineError};
use crate::model::{EngineConfig, ResultKey, ResultTable};
use serde::Deserialize;
use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Debug, Default, Deserialize)]
struct EngineOutput {
    #[serde(default)]
    log: String,
    #[serde(default)]
    tables: Vec<TableOutput>,
}

#[derive(Debug, Deserialize)]
struct TableOutput {
    command: String,
    #[serde(default)]
    stratum: String,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

impl TableOutput {
    fn key(&self) -> ResultKey {
        ResultKey::new(&self.command, &self.stratum)
    }

    fn to_table(&self) -> ResultTable {
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();
        ResultTable::new(self.columns.clone(), rows)
    }
}

fn cell_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct ProcessEngine {
    cfg: EngineConfig,
    record: Option<String>,
    vars: Vec<(String, String)>,
    last: EngineOutput,
}

impl ProcessEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            record: None,
            vars: Vec::new(),
            last: EngineOutput::default(),
        }
    }

    fn invoke(&self, input: &str) -> Result<EngineOutput, EngineError> {
        let record = self.record.as_deref().ok_or(EngineError::NotAttached)?;
        let program = self.cfg.program.display().to_string();

        let mut child = Command::new(&self.cfg.program)
            .args(&self.cfg.args)
            .arg(record)
            .args(self.vars.iter().map(|(k, v)| format!("{k}={v}")))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn { program, source })?;

        // Feed stdin from a helper thread so a chatty engine can't deadlock on a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_owned();
            std::thread::spawn(move || stdin.write_all(input.as_bytes()))
        });

        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            match handle.join() {
                Ok(Ok(())) => {}
                // The engine may legitimately exit without reading all of stdin.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_) => return Err(EngineError::Other("stdin writer panicked".into())),
            }
        }

        if !output.status.success() {
            return Err(EngineError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(EngineOutput::default());
        }
        Ok(serde_json::from_str(&stdout)?)
    }
}

impl EngineBinding for ProcessEngine {
    fn attach(&mut self, record: &str) -> Result<(), EngineError> {
        if record.trim().is_empty() {
            return Err(EngineError::Attach {
                record: record.to_string(),
                reason: "empty record id".into(),
            });
        }
        self.record = Some(record.to_string());
        self.last = EngineOutput::default();
        Ok(())
    }

    fn evaluate(&mut self, command: &str) -> Result<String, EngineError> {
        self.last = EngineOutput::default();
        let out = self.invoke(command)?;
        let log = out.log.clone();
        self.last = out;
        Ok(log)
    }

    fn list_result_tables(&self) -> Vec<ResultKey> {
        self.last.tables.iter().map(TableOutput::key).collect()
    }

    fn get_table(&self, key: &ResultKey) -> Result<ResultTable, EngineError> {
        self.last
            .tables
            .iter()
            .find(|t| t.command == key.command && t.stratum == key.stratum)
            .map(TableOutput::to_table)
            .ok_or_else(|| EngineError::UnknownTable(key.clone()))
    }

    fn reset_variables(&mut self) {
        self.vars.clear();
    }

    fn apply_variable(&mut self, name: &str, value: &str) {
        self.vars.push((name.to_string(), value.to_string()));
    }

    fn silent_directive(&mut self, text: &str) -> Result<(), EngineError> {
        self.invoke(text).map(|_| ())
    }
}
