//! Report persistence and table exports.

use crate::model::RunReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "strata-runner";

/// Directory auto-saved reports go to.
pub fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("no local data directory available")?;
    Ok(base.join(APP_DIR).join("runs"))
}

/// Save a report under the default runs directory.
pub fn save_report(report: &RunReport) -> Result<PathBuf> {
    save_report_in(&runs_dir()?, report)
}

pub fn save_report_in(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let name = format!(
        "run-{}-{}.json",
        report.timestamp_utc.replace(':', "-").replace('T', "_"),
        &report.run_id[..8.min(report.run_id.len())]
    );
    let path = dir.join(name);
    export_json(&path, report)?;
    Ok(path)
}

pub fn export_json(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Write one `<command>_<stratum>.tsv` per table into `dir`.
pub fn export_tsv(dir: &Path, report: &RunReport, na_token: Option<&str>) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::with_capacity(report.tables.len());
    for t in &report.tables {
        let stem = sanitize(&format!("{}_{}", t.command, t.stratum));
        let path = dir.join(format!("{stem}.tsv"));
        std::fs::write(&path, t.table.to_tsv(na_token))
            .with_context(|| format!("write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "table".to_string()
    } else {
        trimmed.to_string()
    }
}
