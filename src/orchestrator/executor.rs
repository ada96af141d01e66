//! Single-lane job executor.
//!
//! One dedicated thread owns the engine and runs one job at a time. Work
//! arrives over a channel of capacity 1; every job produces exactly one
//! [`Completion`] on an unbounded channel read by the control task.

use crate::engine::EngineBinding;
use crate::model::{Failure, FailureKind, Param, ResultKey, ResultTable};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Monotonic job sequence number, for diagnostics.
pub type JobId = u64;

/// One unit of work for the lane.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub record: String,
    pub command: String,
    pub params: Vec<Param>,
}

/// Result of a successful evaluation, tables already pulled from the engine.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub text: String,
    pub tables: Vec<(ResultKey, ResultTable)>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Evaluation),
    Failure(Failure),
}

/// Terminal notification for a job, delivered once.
#[derive(Debug)]
pub struct Completion {
    pub job: Job,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Whether a submission was taken by the lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted(JobId),
    /// A job is already in flight; nothing was queued.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
#[error("job lane has shut down")]
pub struct LaneClosed;

pub struct JobExecutor {
    work_tx: mpsc::Sender<Job>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    busy: bool,
    next_id: JobId,
}

impl JobExecutor {
    /// Start the lane thread, moving `engine` onto it.
    pub fn spawn<E: EngineBinding>(
        engine: E,
        cleanup_directive: Option<String>,
    ) -> std::io::Result<Self> {
        let (work_tx, work_rx) = mpsc::channel::<Job>(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel::<Completion>();

        std::thread::Builder::new()
            .name("eval-lane".into())
            .spawn(move || lane(engine, cleanup_directive, work_rx, done_tx))?;

        Ok(Self {
            work_tx,
            done_rx,
            busy: false,
            next_id: 1,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Hand a job to the lane unless one is already in flight.
    pub fn submit(
        &mut self,
        record: String,
        command: String,
        params: Vec<Param>,
    ) -> Result<Submission, LaneClosed> {
        if self.busy {
            tracing::debug!("submission rejected: job in flight");
            return Ok(Submission::Rejected);
        }

        let id = self.next_id;
        let job = Job {
            id,
            record,
            command,
            params,
        };
        self.busy = true;
        if self.work_tx.try_send(job).is_err() {
            self.busy = false;
            return Err(LaneClosed);
        }
        self.next_id += 1;
        tracing::debug!(job = id, "job submitted");
        Ok(Submission::Accepted(id))
    }

    /// Wait for the in-flight job's completion. Returns `None` when idle or
    /// when the lane is gone.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        if !self.busy {
            return None;
        }
        self.done_rx.recv().await
    }

    /// Clear the busy flag. Called once all handling for a completion is done.
    pub fn release(&mut self) {
        self.busy = false;
    }
}

fn lane<E: EngineBinding>(
    mut engine: E,
    cleanup_directive: Option<String>,
    mut work_rx: mpsc::Receiver<Job>,
    done_tx: mpsc::UnboundedSender<Completion>,
) {
    let mut attached: Option<String> = None;

    while let Some(job) = work_rx.blocking_recv() {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_job(&mut engine, &mut attached, &job)
        }))
        .unwrap_or_else(|payload| {
            // Engine state is unknown after a panic; force a fresh attach next time.
            attached = None;
            Outcome::Failure(Failure::new(FailureKind::Panic, panic_message(&*payload)))
        });

        if let Some(directive) = cleanup_directive.as_deref() {
            let res = panic::catch_unwind(AssertUnwindSafe(|| engine.silent_directive(directive)));
            if !matches!(res, Ok(Ok(()))) {
                tracing::debug!(job = job.id, "cleanup directive failed (ignored)");
            }
        }

        if let Outcome::Failure(f) = &outcome {
            tracing::warn!(job = job.id, kind = ?f.kind, error = %f.message, "job failed");
        }

        let completion = Completion {
            job,
            outcome,
            elapsed: started.elapsed(),
        };
        if done_tx.send(completion).is_err() {
            break;
        }
    }
}

fn run_job<E: EngineBinding>(engine: &mut E, attached: &mut Option<String>, job: &Job) -> Outcome {
    if attached.as_deref() != Some(job.record.as_str()) {
        if let Err(e) = engine.attach(&job.record) {
            *attached = None;
            return Outcome::Failure(Failure::new(FailureKind::Attach, e.to_string()));
        }
        *attached = Some(job.record.clone());
    }

    engine.reset_variables();
    for p in &job.params {
        engine.apply_variable(&p.name, &p.value);
    }

    let text = match engine.evaluate(&job.command) {
        Ok(text) => text,
        Err(e) => return Outcome::Failure(Failure::new(FailureKind::Engine, e.to_string())),
    };

    let mut tables = Vec::new();
    for key in engine.list_result_tables() {
        match engine.get_table(&key) {
            Ok(table) => tables.push((key, table)),
            Err(e) => {
                return Outcome::Failure(Failure::new(
                    FailureKind::Callback,
                    format!("reading {key}: {e}"),
                ))
            }
        }
    }

    Outcome::Success(Evaluation { text, tables })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("engine panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("engine panicked: {s}")
    } else {
        "engine panicked".to_string()
    }
}
