//! Evaluation controller.
//!
//! Owns the busy lane, the attached record, display state and the project
//! run. Every mutation happens on the task that calls into it; the lane only
//! hands back [`Completion`]s.

use super::executor::{
    Completion, Evaluation, JobExecutor, JobId, LaneClosed, Outcome, Submission,
};
use super::project::{Advance, ProjectState};
use crate::engine::EngineBinding;
use crate::model::{
    Failure, FailureKind, InfoEvent, RecordFailure, ResultKey, ResultSet, ResultTable, UiEvent,
};
use crate::params::{ParamError, ParamSource};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("no record attached")]
    NoEngineAttached,

    #[error(transparent)]
    LaneClosed(#[from] LaneClosed),

    #[error(transparent)]
    Params(#[from] ParamError),
}

/// Outcome of starting a project run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStart {
    /// The first evaluable record is in flight.
    Started(JobId),
    /// No record could be submitted; the run already finished.
    Completed,
    /// A job was in flight; nothing changed.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalState {
    Idle,
    Running,
    Delivering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Project,
}

/// Whether the presented view reflects the latest evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    NotRendered,
    Current,
    Stale,
}

/// What presentation layers may show.
#[derive(Debug, Clone)]
pub struct DisplayState {
    pub log: String,
    pub results: ResultSet,
    pub render: RenderState,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            log: String::new(),
            results: ResultSet::default(),
            render: RenderState::NotRendered,
        }
    }
}

impl DisplayState {
    fn clear(&mut self) {
        self.log.clear();
        self.results = ResultSet::default();
    }
}

pub struct Controller {
    executor: JobExecutor,
    params: Box<dyn ParamSource>,
    events: UnboundedSender<UiEvent>,
    state: EvalState,
    mode: Mode,
    attached: Option<String>,
    command: String,
    project: Option<ProjectState>,
    display: DisplayState,
}

impl Controller {
    pub fn new<E: EngineBinding>(
        engine: E,
        cleanup_directive: Option<String>,
        params: Box<dyn ParamSource>,
        events: UnboundedSender<UiEvent>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            executor: JobExecutor::spawn(engine, cleanup_directive)?,
            params,
            events,
            state: EvalState::Idle,
            mode: Mode::Single,
            attached: None,
            command: String::new(),
            project: None,
            display: DisplayState::default(),
        })
    }

    pub fn state(&self) -> EvalState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_busy(&self) -> bool {
        self.executor.is_busy()
    }

    pub fn attached(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    pub fn project(&self) -> Option<&ProjectState> {
        self.project.as_ref()
    }

    pub fn project_running(&self) -> bool {
        self.project.as_ref().is_some_and(ProjectState::is_running)
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn failures(&self) -> &[RecordFailure] {
        self.project
            .as_ref()
            .map(ProjectState::failures)
            .unwrap_or_default()
    }

    /// Select the record later evaluations run against. Refused while busy.
    pub fn attach(&mut self, record: &str) -> bool {
        if self.is_busy() {
            tracing::debug!(record, "attach ignored: job in flight");
            return false;
        }
        self.display.clear();
        self.attached = Some(record.to_string());
        true
    }

    /// Drop project state and displayed results. Refused while busy.
    pub fn clear(&mut self) -> bool {
        if self.is_busy() {
            return false;
        }
        self.project = None;
        self.mode = Mode::Single;
        self.display.clear();
        true
    }

    pub fn mark_rendered(&mut self) {
        self.display.render = RenderState::Current;
    }

    /// Single-record evaluation of `command` against the attached record.
    pub fn evaluate(&mut self, command: &str) -> Result<Submission, EvalError> {
        let record = self.attached.clone().ok_or(EvalError::NoEngineAttached)?;
        if self.is_busy() {
            tracing::debug!("evaluate ignored: job in flight");
            return Ok(Submission::Rejected);
        }
        self.mode = Mode::Single;
        self.command = command.to_string();
        self.submit(record)
    }

    /// Evaluate `command` across `records` in order, aggregating their tables.
    pub fn start_project(
        &mut self,
        records: Vec<String>,
        command: &str,
    ) -> ProjectStart {
        if self.is_busy() {
            tracing::debug!("project start ignored: job in flight");
            return ProjectStart::Rejected;
        }
        tracing::info!(records = records.len(), "starting project run");
        let project = ProjectState::start(records);
        let first = project.begin();
        self.project = Some(project);
        self.mode = Mode::Project;
        self.command = command.to_string();
        self.display.clear();
        match self.drive_project(first) {
            Some(id) => ProjectStart::Started(id),
            None => ProjectStart::Completed,
        }
    }

    /// Display form of a held table. Single-record views hide the `ID` column.
    pub fn view_table(&self, key: &ResultKey, transpose: bool) -> Option<ResultTable> {
        let table = self.display.results.get(key)?;
        let table = match self.mode {
            Mode::Single => table.without_column("ID"),
            Mode::Project => table.clone(),
        };
        Some(if transpose { table.transposed() } else { table })
    }

    /// Wait for the in-flight job, if any.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.executor.next_completion().await
    }

    /// Handle the lane going away while a job was in flight.
    pub fn lane_lost(&mut self) {
        if !self.is_busy() {
            return;
        }
        self.state = EvalState::Delivering;
        let failure = Failure::new(FailureKind::Engine, LaneClosed.to_string());
        self.on_failure(self.attached.clone(), &failure);
        self.unlock();
        self.state = EvalState::Idle;

        // Nothing more can run; close the project with what it has.
        if self.project_running() {
            if let Some(project) = self.project.as_mut() {
                project.abandon();
            }
            self.finish_project();
        }
    }

    /// Deliver one completion: route results, unlock, then chain the next
    /// project record if one remains.
    pub fn handle_completion(&mut self, completion: Completion) {
        self.state = EvalState::Delivering;
        let Completion {
            job,
            outcome,
            elapsed,
        } = completion;
        tracing::debug!(job = job.id, elapsed_ms = elapsed.as_millis() as u64, "job completed");

        let record = Some(job.record.clone());
        match outcome {
            Outcome::Success(eval) => {
                if let Err(failure) = self.on_success(&job.record, eval, elapsed) {
                    self.on_failure(record, &failure);
                }
            }
            Outcome::Failure(failure) => self.on_failure(record, &failure),
        }

        self.unlock();
        self.state = EvalState::Idle;

        if self.mode == Mode::Project {
            let next = self
                .project
                .as_mut()
                .map(ProjectState::advance)
                .unwrap_or(Advance::Idle);
            self.drive_project(next);
        }
    }

    fn on_success(
        &mut self,
        record: &str,
        eval: Evaluation,
        elapsed: std::time::Duration,
    ) -> Result<(), Failure> {
        let Evaluation { text, tables } = eval;

        let mut seen = HashSet::new();
        if let Some((dup, _)) = tables.iter().find(|(key, _)| !seen.insert(key.clone())) {
            return Err(Failure::new(
                FailureKind::Callback,
                format!("duplicate result table {dup}"),
            ));
        }

        match self.mode {
            Mode::Project => {
                self.display.log.push_str(&text);
                if let Some(project) = self.project.as_mut() {
                    project.accumulate(tables);
                }
            }
            Mode::Single => {
                let index: Vec<ResultKey> = tables.iter().map(|(k, _)| k.clone()).collect();
                self.display.log = text.clone();
                self.display.results = ResultSet {
                    index: index.clone(),
                    tables: tables.into_iter().collect::<BTreeMap<_, _>>(),
                };
                let _ = self.events.send(UiEvent::Evaluated {
                    record: Some(record.to_string()),
                    text,
                    index,
                    elapsed,
                });
            }
        }
        Ok(())
    }

    fn on_failure(&mut self, record: Option<String>, failure: &Failure) {
        if self.mode == Mode::Project {
            if let Some(project) = self.project.as_mut() {
                project.record_failure(failure);
            }
        }
        let _ = self.events.send(UiEvent::EvaluationFailed {
            record,
            failure: failure.clone(),
        });
    }

    /// Shared exit path for every completion.
    fn unlock(&mut self) {
        self.executor.release();
        if self.display.render == RenderState::Current {
            self.display.render = RenderState::Stale;
        }
        let _ = self.events.send(UiEvent::Busy(false));
    }

    fn submit(&mut self, record: String) -> Result<Submission, EvalError> {
        if self.mode == Mode::Single {
            self.display.clear();
        }
        let params = self.params.params()?;
        let submission = self
            .executor
            .submit(record.clone(), self.command.clone(), params)?;
        if let Submission::Accepted(_) = submission {
            self.attached = Some(record);
            self.state = EvalState::Running;
            let _ = self.events.send(UiEvent::Busy(true));
        }
        Ok(submission)
    }

    /// Submit project records until one is accepted or the run finishes.
    /// Returns the id of the job left in flight, if any.
    fn drive_project(&mut self, mut step: Advance) -> Option<JobId> {
        loop {
            let record = match step {
                Advance::Next(record) => record,
                Advance::Finished => {
                    self.finish_project();
                    return None;
                }
                Advance::Idle => return None,
            };

            let (position, total) = self
                .project
                .as_ref()
                .map(|p| (p.position() + 1, p.record_count()))?;
            tracing::info!(record = %record, position, total, "evaluating record");
            self.display.log.push_str(&format!(
                "\n\n{}\nProcessing: {record} (#{position})\n",
                "-".repeat(66)
            ));
            let _ = self.events.send(UiEvent::RecordStarted {
                record: record.clone(),
                position,
                total,
            });

            match self.submit(record.clone()) {
                Ok(Submission::Accepted(id)) => return Some(id),
                Ok(Submission::Rejected) => {
                    tracing::warn!(record = %record, "project record rejected: lane busy");
                    return None;
                }
                Err(e) => {
                    // Treated like a failed evaluation: record it and move on.
                    let failure = Failure::new(FailureKind::Engine, e.to_string());
                    self.on_failure(Some(record), &failure);
                    step = self
                        .project
                        .as_mut()
                        .map(ProjectState::advance)
                        .unwrap_or(Advance::Idle);
                }
            }
        }
    }

    fn finish_project(&mut self) {
        let Some(project) = self.project.as_ref() else {
            return;
        };
        tracing::info!(
            records = project.record_count(),
            failures = project.failures().len(),
            "project run finished"
        );
        match project.finish() {
            Some(results) => {
                self.display.results = results.clone();
                let _ = self.events.send(UiEvent::ProjectFinished {
                    results: Box::new(results),
                });
            }
            None => {
                let _ = self.events.send(UiEvent::Info(InfoEvent::Message(
                    "Project run produced no tables".into(),
                )));
            }
        }
    }
}
