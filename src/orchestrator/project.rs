//! Project-mode accumulation across an ordered list of records.

use crate::model::{Failure, RecordFailure, ResultKey, ResultSet, ResultTable};
use std::collections::{BTreeMap, HashSet};

/// What the controller should do after moving the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Evaluate this record next.
    Next(String),
    /// The last record was just consumed; finalize once.
    Finished,
    /// Already finished before this call; nothing to do.
    Idle,
}

#[derive(Debug, Default)]
pub struct ProjectState {
    records: Vec<String>,
    index: usize,
    frames: Vec<Vec<ResultKey>>,
    results: BTreeMap<ResultKey, ResultTable>,
    failures: Vec<RecordFailure>,
}

impl ProjectState {
    pub fn start(records: Vec<String>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Step for the first record, or `Finished` for an empty list.
    pub fn begin(&self) -> Advance {
        match self.records.first() {
            Some(record) if self.index == 0 => Advance::Next(record.clone()),
            Some(_) => Advance::Idle,
            None => Advance::Finished,
        }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&str> {
        self.records.get(self.index).map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.index < self.records.len()
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn failures(&self) -> &[RecordFailure] {
        &self.failures
    }

    /// Fold one record's tables into the aggregate.
    ///
    /// A record without tables leaves no key frame behind.
    pub fn accumulate(&mut self, tables: Vec<(ResultKey, ResultTable)>) {
        if tables.is_empty() {
            return;
        }
        self.frames
            .push(tables.iter().map(|(key, _)| key.clone()).collect());
        for (key, table) in tables {
            match self.results.get_mut(&key) {
                Some(existing) => existing.append(table),
                None => {
                    self.results.insert(key, table);
                }
            }
        }
    }

    pub fn record_failure(&mut self, failure: &Failure) {
        let Some(record) = self.current() else {
            return;
        };
        self.failures.push(RecordFailure {
            record: record.to_string(),
            kind: failure.kind,
            message: failure.message.clone(),
        });
    }

    /// Move past the current record. A no-op once finished.
    pub fn advance(&mut self) -> Advance {
        if self.is_finished() {
            return Advance::Idle;
        }
        self.index += 1;
        match self.current() {
            Some(record) => Advance::Next(record.to_string()),
            None => Advance::Finished,
        }
    }

    /// Jump to the finished state without evaluating the remaining records.
    pub fn abandon(&mut self) {
        self.index = self.records.len();
    }

    /// Combined, de-duplicated index plus the aggregate tables.
    ///
    /// `None` when no record produced any tables.
    pub fn finish(&self) -> Option<ResultSet> {
        if self.frames.is_empty() {
            return None;
        }
        let mut seen = HashSet::new();
        let index = self
            .frames
            .iter()
            .flatten()
            .filter(|key| seen.insert(*key))
            .cloned()
            .collect();
        Some(ResultSet {
            index,
            tables: self.results.clone(),
        })
    }
}
