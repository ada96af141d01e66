//! Application-level orchestration.
//!
//! This module owns the evaluation lifecycle: the single job lane, the
//! evaluation controller and its project runs, the control loop that feeds it
//! UI commands, and post-run processing such as auto-save and exports. UI/CLI
//! layers call into this module to keep responsibilities separated.

mod controller;
mod evaluation;
mod executor;
mod post_process;
mod project;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use evaluation::Controller;
pub(crate) use post_process::{build_report, has_results, process_run_completion};
