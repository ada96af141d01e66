use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub engine: EngineConfig,
    pub command: String,
    #[serde(default)]
    pub params_file: Option<std::path::PathBuf>,
    #[serde(default)]
    pub params: Vec<Param>,
    pub records: Vec<String>,
    /// Evaluate across `records` as a project run even when only one is given.
    pub project: bool,
    pub na_token: Option<String>,
    pub transpose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub program: std::path::PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directive run silently after every evaluation, e.g. to undo report hiding.
    #[serde(default)]
    pub cleanup_directive: Option<String>,
}

/// A `(name, value)` pair handed to the engine before each evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: String,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Identity of one output table within a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub command: String,
    pub stratum: String,
}

impl ResultKey {
    pub fn new(command: impl Into<String>, stratum: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stratum: stratum.into(),
        }
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.command, self.stratum)
    }
}

/// Rectangular table of named columns. Cell contents are opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Concatenate `other`'s rows after ours.
    ///
    /// Columns only present in `other` are appended to the header; cells a
    /// side does not have are left empty. No row is dropped or reordered.
    pub fn append(&mut self, other: ResultTable) {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }

        if other.columns == self.columns {
            let width = self.columns.len();
            self.rows
                .extend(other.rows.into_iter().map(|row| pad_row(row, width)));
            return;
        }

        // The nth incoming column of a name maps to our nth column of that name.
        let mut mapping = Vec::with_capacity(other.columns.len());
        for (i, name) in other.columns.iter().enumerate() {
            let nth = other.columns[..i].iter().filter(|c| *c == name).count();
            let existing = self
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| *c == name)
                .nth(nth)
                .map(|(idx, _)| idx);
            let idx = match existing {
                Some(idx) => idx,
                None => {
                    self.columns.push(name.clone());
                    self.columns.len() - 1
                }
            };
            mapping.push(idx);
        }

        let width = self.columns.len();
        for row in &mut self.rows {
            row.resize(width, String::new());
        }
        for row in other.rows {
            let mut out = vec![String::new(); width];
            for (cell, &idx) in row.into_iter().zip(mapping.iter()) {
                out[idx] = cell;
            }
            self.rows.push(out);
        }
    }

    /// Copy of the table with the named column removed (if present).
    pub fn without_column(&self, name: &str) -> ResultTable {
        let Some(idx) = self.columns.iter().position(|c| c == name) else {
            return self.clone();
        };
        let mut columns = self.columns.clone();
        columns.remove(idx);
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, cell)| cell.clone())
                    .collect()
            })
            .collect();
        ResultTable { columns, rows }
    }

    /// Swap rows and columns: one `VAR` column holding the original column
    /// names, followed by `row1..rowN`.
    pub fn transposed(&self) -> ResultTable {
        let mut columns = Vec::with_capacity(self.rows.len() + 1);
        columns.push("VAR".to_string());
        columns.extend((1..=self.rows.len()).map(|i| format!("row{i}")));

        let rows = self
            .columns
            .iter()
            .enumerate()
            .map(|(c, name)| {
                let mut out = Vec::with_capacity(self.rows.len() + 1);
                out.push(name.clone());
                out.extend(
                    self.rows
                        .iter()
                        .map(|row| row.get(c).cloned().unwrap_or_default()),
                );
                out
            })
            .collect();
        ResultTable { columns, rows }
    }

    /// Tab-separated rendering with a header row. Empty cells become
    /// `na_token` when one is given.
    pub fn to_tsv(&self, na_token: Option<&str>) -> String {
        let fmt_cell = |cell: &str| -> String {
            match na_token {
                Some(na) if cell.is_empty() => na.to_string(),
                _ => cell.to_string(),
            }
        };
        let mut out = self.columns.join("\t");
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = (0..self.columns.len().max(row.len()))
                .map(|i| fmt_cell(row.get(i).map(String::as_str).unwrap_or("")))
                .collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out
    }
}

fn pad_row(mut row: Vec<String>, width: usize) -> Vec<String> {
    if row.len() < width {
        row.resize(width, String::new());
    }
    row
}

/// Ordered index of result keys plus the tables behind them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub index: Vec<ResultKey>,
    pub tables: BTreeMap<ResultKey, ResultTable>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &ResultKey) -> Option<&ResultTable> {
        self.tables.get(key)
    }

    /// Tables in index order; keys missing from the map are skipped.
    pub fn keyed_tables(&self) -> Vec<KeyedTable> {
        self.index
            .iter()
            .filter_map(|key| {
                self.tables.get(key).map(|table| KeyedTable {
                    command: key.command.clone(),
                    stratum: key.stratum.clone(),
                    table: table.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The record could not be attached to the engine.
    Attach,
    /// The engine call itself failed.
    Engine,
    /// The lane caught a panic while running the job.
    Panic,
    /// Collecting or delivering a successful result failed.
    Callback,
}

/// Terminal failure of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Events emitted by the controller and consumed by presentation layers.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Drives progress indication and control enablement.
    Busy(bool),
    RecordStarted {
        record: String,
        position: usize,
        total: usize,
    },
    /// Single-record evaluation finished; render text and table index.
    Evaluated {
        record: Option<String>,
        text: String,
        index: Vec<ResultKey>,
        elapsed: Duration,
    },
    ProjectFinished {
        // Box to keep UiEvent small; the aggregate can be large.
        results: Box<ResultSet>,
    },
    EvaluationFailed {
        record: Option<String>,
        failure: Failure,
    },
    Table {
        key: ResultKey,
        table: ResultTable,
    },
    Info(InfoEvent),
}

#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    /// A user request was refused (no record attached, bad parameters, ...).
    Rejected(String),
    Index(Vec<ResultKey>),
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Rejected(msg) => format!("Error: {msg}"),
            InfoEvent::Index(keys) if keys.is_empty() => "No tables".to_string(),
            InfoEvent::Index(keys) => keys
                .iter()
                .map(|k| format!("{}\t{}", k.command, k.stratum))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedTable {
    pub command: String,
    pub stratum: String,
    pub table: ResultTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub run_id: String,
    pub command: String,
    pub records: Vec<String>,
    pub project: bool,
    #[serde(default)]
    pub failures: Vec<RecordFailure>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub index: Vec<ResultKey>,
    #[serde(default)]
    pub tables: Vec<KeyedTable>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}
