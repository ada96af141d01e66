//! Control loop.
//!
//! Multiplexes UI commands with lane completions on a single task, so all
//! controller state has exactly one writer.

use super::evaluation::{Controller, ProjectStart};
use super::executor::Submission;
use crate::model::{InfoEvent, ResultKey, UiEvent};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers to drive evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UiCommand {
    Attach(String),
    Evaluate(String),
    RunProject {
        records: Vec<String>,
        command: String,
    },
    Show {
        key: ResultKey,
        transpose: bool,
    },
    Render,
    Clear,
    Quit,
}

/// Run until `Quit` (or the command channel closes) and no work remains.
pub(crate) async fn run_controller(
    controller: &mut Controller,
    events: UnboundedSender<UiEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut quit_pending = false;

    loop {
        // Project records chain inside completion handling, so an idle lane means no run is left.
        if quit_pending && !controller.is_busy() {
            break;
        }

        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the in-flight job and any project run to finish.
                        quit_pending = true;
                    }
                    Some(cmd) => apply_command(controller, &events, cmd),
                }
            }
            // Only poll completions while a job is in flight; otherwise park this branch.
            done = async {
                if controller.is_busy() {
                    return controller.next_completion().await;
                }
                futures::future::pending().await
            } => {
                match done {
                    Some(completion) => controller.handle_completion(completion),
                    None => controller.lane_lost(),
                }
            }
        }
    }

    Ok(())
}

fn apply_command(controller: &mut Controller, events: &UnboundedSender<UiEvent>, cmd: UiCommand) {
    let info = |msg: InfoEvent| {
        let _ = events.send(UiEvent::Info(msg));
    };

    match cmd {
        UiCommand::Attach(record) => {
            if controller.attach(&record) {
                info(InfoEvent::Message(format!("Attached {record}")));
            }
        }
        UiCommand::Evaluate(command) => match controller.evaluate(&command) {
            Ok(Submission::Accepted(_)) => {}
            // Double submissions are dropped quietly.
            Ok(Submission::Rejected) => {}
            Err(e) => info(InfoEvent::Rejected(e.to_string())),
        },
        UiCommand::RunProject { records, command } => {
            if controller.start_project(records, &command) == ProjectStart::Rejected {
                tracing::debug!("project run ignored: job in flight");
            }
        }
        UiCommand::Show { key, transpose } => match controller.view_table(&key, transpose) {
            Some(table) => {
                let _ = events.send(UiEvent::Table { key, table });
            }
            None => info(InfoEvent::Rejected(format!("no table {key}"))),
        },
        UiCommand::Render => {
            info(InfoEvent::Index(controller.display().results.index.clone()));
            controller.mark_rendered();
        }
        UiCommand::Clear => {
            if controller.clear() {
                info(InfoEvent::Message("Cleared".into()));
            }
        }
        UiCommand::Quit => {}
    }
}
