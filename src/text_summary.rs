//! Text summary builder for CLI output.
//!
//! Formats a finished run report into human-readable lines for text mode.

use crate::model::{ResultTable, RunReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary. `show_tables` prints every table as TSV below its heading.
pub(crate) fn build_text_summary(
    report: &RunReport,
    show_tables: bool,
    transpose: bool,
    na_token: Option<&str>,
) -> TextSummary {
    let mut lines = Vec::new();

    if report.project {
        let failed = report.failures.len();
        lines.push(format!(
            "Project: {} record(s), {} ok, {} failed in {}",
            report.records.len(),
            report.records.len().saturating_sub(failed),
            failed,
            humantime::format_duration(round_ms(report.elapsed))
        ));
    } else if let Some(record) = report.records.first() {
        lines.push(format!(
            "Record: {record} ({})",
            humantime::format_duration(round_ms(report.elapsed))
        ));
    }

    for f in &report.failures {
        lines.push(format!("  FAILED {} [{:?}]: {}", f.record, f.kind, f.message));
    }

    if !report.project && !report.log.trim().is_empty() {
        lines.push(String::new());
        lines.extend(report.log.trim_end().lines().map(str::to_string));
    }

    if report.tables.is_empty() {
        lines.push("No tables".to_string());
        return TextSummary { lines };
    }

    lines.push(String::new());
    lines.push(format!("{:<24} {:<24} {:>8}", "Command", "Strata", "Rows"));
    for t in &report.tables {
        lines.push(format!(
            "{:<24} {:<24} {:>8}",
            t.command,
            display_stratum(&t.stratum),
            t.table.row_count()
        ));
    }

    if show_tables {
        for t in &report.tables {
            lines.push(String::new());
            lines.push(format!("== {} / {} ==", t.command, display_stratum(&t.stratum)));
            let table = view(&t.table, report.project, transpose);
            lines.extend(table.to_tsv(na_token).lines().map(str::to_string));
        }
    }

    TextSummary { lines }
}

fn view(table: &ResultTable, project: bool, transpose: bool) -> ResultTable {
    let table = if project {
        table.clone()
    } else {
        table.without_column("ID")
    };
    if transpose {
        table.transposed()
    } else {
        table
    }
}

fn display_stratum(stratum: &str) -> &str {
    if stratum.is_empty() {
        "-"
    } else {
        stratum
    }
}

fn round_ms(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::rows_for;
    use crate::model::{FailureKind, KeyedTable, RecordFailure};
    use std::time::Duration;

    fn report(project: bool) -> RunReport {
        RunReport {
            timestamp_utc: String::new(),
            run_id: "1".into(),
            command: "STATS".into(),
            records: vec!["r1".into(), "r2".into()],
            project,
            failures: vec![RecordFailure {
                record: "r2".into(),
                kind: FailureKind::Engine,
                message: "boom".into(),
            }],
            log: "line one\nline two\n".into(),
            index: Vec::new(),
            tables: vec![KeyedTable {
                command: "STATS".into(),
                stratum: String::new(),
                table: rows_for("r1", 2),
            }],
            elapsed: Duration::from_millis(1250),
        }
    }

    #[test]
    fn project_summary_counts_failures() {
        let s = build_text_summary(&report(true), false, false, None);
        assert_eq!(s.lines[0], "Project: 2 record(s), 1 ok, 1 failed in 1s 250ms");
        assert!(s.lines[1].contains("FAILED r2"));
        assert!(s.lines.iter().any(|l| l.starts_with("STATS") && l.ends_with('2')));
        // Project logs are long; only single-record runs echo them.
        assert!(!s.lines.iter().any(|l| l == "line one"));
    }

    #[test]
    fn single_summary_hides_id_column_in_tables() {
        let s = build_text_summary(&report(false), true, false, None);
        assert!(s.lines.iter().any(|l| l == "line one"));
        let heading = s.lines.iter().position(|l| l == "== STATS / - ==").unwrap();
        assert_eq!(s.lines[heading + 1], "N");
        assert_eq!(s.lines[heading + 2], "0");
    }
}
