//! Post-run processing utilities.
//!
//! Builds the run report from the controller's final state, then handles
//! auto-save and exports.

use super::evaluation::{Controller, Mode};
use crate::model::{RunConfig, RunReport};
use crate::storage;
use std::path::Path;
use std::time::Duration;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub report: RunReport,
    pub export_messages: Vec<String>,
    pub auto_saved_path: Option<std::path::PathBuf>,
}

/// Snapshot what the controller holds into a serialisable report.
pub(crate) fn build_report(cfg: &RunConfig, controller: &Controller, elapsed: Duration) -> RunReport {
    let display = controller.display();
    // A project left over from an earlier run does not describe a later single evaluation.
    let project = controller.project().filter(|_| controller.mode() == Mode::Project);
    let records = match project {
        Some(p) => p.records().to_vec(),
        None => controller.attached().map(str::to_string).into_iter().collect(),
    };
    RunReport {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        run_id: cfg.run_id.clone(),
        command: cfg.command.clone(),
        records,
        project: project.is_some(),
        failures: project.map(|p| p.failures().to_vec()).unwrap_or_default(),
        log: display.log.clone(),
        index: display.results.index.clone(),
        tables: display.results.keyed_tables(),
        elapsed,
    }
}

/// Whether a finished run has anything to report. A project run that produced
/// no tables has nothing.
pub(crate) fn has_results(report: &RunReport) -> bool {
    !(report.project && report.tables.is_empty())
}

/// Process a finished run: auto-save and export.
pub(crate) fn process_run_completion(
    report: RunReport,
    auto_save: bool,
    export_json: Option<&Path>,
    export_tsv: Option<&Path>,
    na_token: Option<&str>,
) -> ProcessedRun {
    let auto_saved_path = if auto_save {
        match storage::save_report(&report) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "auto-save failed");
                None
            }
        }
    } else {
        None
    };

    let mut export_messages = Vec::new();
    if let Some(export_path) = export_json {
        match storage::export_json(export_path, &report) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }
    if let Some(dir) = export_tsv {
        match storage::export_tsv(dir, &report, na_token) {
            Ok(paths) => export_messages.push(format!(
                "Exported {} TSV table(s) to {}",
                paths.len(),
                dir.display()
            )),
            Err(e) => export_messages.push(format!("Export TSV failed: {e:#}")),
        }
    }

    ProcessedRun {
        report,
        export_messages,
        auto_saved_path,
    }
}
