//! In-memory engine for controller and lane tests.

use super::{EngineBinding, EngineError};
use crate::model::{ResultKey, ResultTable};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub(crate) enum Script {
    Output {
        log: String,
        tables: Vec<(ResultKey, ResultTable)>,
    },
    Fail(String),
    Panic(String),
    /// Lists `key` but fails to return it.
    BrokenTable(ResultKey),
    /// Panics with a payload whose drop panics again, taking the lane down.
    KillLane,
}

struct LaneKiller;

impl Drop for LaneKiller {
    fn drop(&mut self) {
        panic!("lane torn down");
    }
}

impl Script {
    pub(crate) fn output(log: &str, tables: Vec<(ResultKey, ResultTable)>) -> Self {
        Script::Output {
            log: log.to_string(),
            tables,
        }
    }
}

/// Calls observed by the engine, shared with the test body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Attach(String),
    Reset,
    Var(String, String),
    Eval(String),
    Directive(String),
}

pub(crate) struct ScriptedEngine {
    scripts: HashMap<String, Script>,
    fallback: Script,
    record: Option<String>,
    last: Vec<(ResultKey, ResultTable)>,
    calls: Arc<Mutex<Vec<Call>>>,
    gate: Option<Receiver<()>>,
    reject_attach: Vec<String>,
    broken: Option<ResultKey>,
}

impl ScriptedEngine {
    pub(crate) fn new(fallback: Script) -> Self {
        Self {
            scripts: HashMap::new(),
            fallback,
            record: None,
            last: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            gate: None,
            reject_attach: Vec::new(),
            broken: None,
        }
    }

    pub(crate) fn with_record(mut self, record: &str, script: Script) -> Self {
        self.scripts.insert(record.to_string(), script);
        self
    }

    /// Block every evaluation until a unit is sent on the paired sender.
    pub(crate) fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn rejecting_attach(mut self, record: &str) -> Self {
        self.reject_attach.push(record.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
        self.calls.clone()
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl EngineBinding for ScriptedEngine {
    fn attach(&mut self, record: &str) -> Result<(), EngineError> {
        self.log(Call::Attach(record.to_string()));
        if self.reject_attach.iter().any(|r| r == record) {
            return Err(EngineError::Attach {
                record: record.to_string(),
                reason: "missing".into(),
            });
        }
        self.record = Some(record.to_string());
        Ok(())
    }

    fn evaluate(&mut self, command: &str) -> Result<String, EngineError> {
        self.log(Call::Eval(command.to_string()));
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        let record = self.record.clone().ok_or(EngineError::NotAttached)?;
        let script = self
            .scripts
            .get(&record)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        self.last.clear();
        self.broken = None;
        match script {
            Script::Output { log, tables } => {
                self.last = tables;
                Ok(log)
            }
            Script::Fail(msg) => Err(EngineError::Other(msg)),
            Script::Panic(msg) => panic!("{msg}"),
            Script::KillLane => std::panic::panic_any(LaneKiller),
            Script::BrokenTable(key) => {
                self.broken = Some(key.clone());
                self.last = vec![(key, ResultTable::default())];
                Ok("partial".into())
            }
        }
    }

    fn list_result_tables(&self) -> Vec<ResultKey> {
        self.last.iter().map(|(k, _)| k.clone()).collect()
    }

    fn get_table(&self, key: &ResultKey) -> Result<ResultTable, EngineError> {
        if self.broken.as_ref() == Some(key) {
            return Err(EngineError::Other(format!("table {key} vanished")));
        }
        self.last
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| EngineError::UnknownTable(key.clone()))
    }

    fn reset_variables(&mut self) {
        self.log(Call::Reset);
    }

    fn apply_variable(&mut self, name: &str, value: &str) {
        self.log(Call::Var(name.to_string(), value.to_string()));
    }

    fn silent_directive(&mut self, text: &str) -> Result<(), EngineError> {
        self.log(Call::Directive(text.to_string()));
        Err(EngineError::Other("directive ignored".into()))
    }
}

pub(crate) fn table(columns: &[&str], rows: &[&[&str]]) -> ResultTable {
    ResultTable::new(
        columns.iter().map(|c| c.to_string()).collect(),
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect(),
    )
}

/// `n` rows of `["<id>", "<i>"]` under columns `ID`, `N`.
pub(crate) fn rows_for(id: &str, n: usize) -> ResultTable {
    ResultTable::new(
        vec!["ID".into(), "N".into()],
        (0..n).map(|i| vec![id.to_string(), i.to_string()]).collect(),
    )
}
