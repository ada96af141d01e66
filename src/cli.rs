use crate::engine::ProcessEngine;
use crate::model::{EngineConfig, Param, RunConfig, RunReport, UiEvent};
use crate::orchestrator::{self, Controller, UiCommand};
use crate::params::{self, ParamFile, ParamSource};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "strata-runner",
    version,
    about = "Run analysis commands against an external engine, per record or across a whole project"
)]
pub struct Cli {
    /// Engine program; invoked as `<engine> <engine-args...> <record> [name=value...]`
    #[arg(long)]
    pub engine: PathBuf,

    /// Extra argument passed to the engine before the record id (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Directive run silently after every evaluation (errors ignored)
    #[arg(long)]
    pub cleanup_directive: Option<String>,

    /// Command text to evaluate
    #[arg(short, long, conflicts_with = "script")]
    pub command: Option<String>,

    /// Read the command text from a file
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Parameter file (`name value` per line, `%` comments); re-read before each evaluation
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// Inline parameter NAME=VALUE, applied after the parameter file (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    pub param: Vec<Param>,

    /// Record id to evaluate (repeatable; more than one runs a project)
    #[arg(long)]
    pub record: Vec<String>,

    /// Sample list whose first column holds record ids; runs a project
    #[arg(long)]
    pub sample_list: Option<PathBuf>,

    /// Print JSON report instead of the text summary
    #[arg(long, conflicts_with = "interactive")]
    pub json: bool,

    /// Print every table below the text summary
    #[arg(long)]
    pub show_tables: bool,

    /// Read commands from stdin; lines starting with `:` are directives
    #[arg(long)]
    pub interactive: bool,

    /// Export the report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export each result table as TSV into this directory
    #[arg(long)]
    pub export_tsv: Option<PathBuf>,

    /// Token written for empty cells in TSV output
    #[arg(long)]
    pub na_token: Option<String>,

    /// Show tables transposed (one row per column)
    #[arg(long)]
    pub transpose: bool,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,
}

fn parse_param(s: &str) -> Result<Param, String> {
    params::parse_param_arg(s).map_err(|e| e.to_string())
}

pub async fn run(args: Cli) -> Result<()> {
    if args.interactive {
        return run_interactive(args).await;
    }
    run_batch(args).await
}

/// Generate a random id for the run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

/// Record ids from a sample list: first whitespace-separated field per line.
pub fn load_sample_list(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read sample list {}", path.display()))?;
    Ok(parse_sample_list(&text))
}

fn parse_sample_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunConfig> {
    let command = match (&args.command, &args.script) {
        (Some(c), _) => c.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("read script {}", path.display()))?,
        (None, None) => String::new(),
    };

    let mut records = args.record.clone();
    if let Some(list) = args.sample_list.as_deref() {
        records.extend(load_sample_list(list)?);
    }

    Ok(RunConfig {
        run_id: gen_run_id(),
        engine: EngineConfig {
            program: args.engine.clone(),
            args: args.engine_args.clone(),
            cleanup_directive: args.cleanup_directive.clone(),
        },
        command,
        params_file: args.params.clone(),
        params: args.param.clone(),
        project: args.sample_list.is_some() || records.len() > 1,
        records,
        na_token: args.na_token.clone(),
        transpose: args.transpose,
    })
}

fn build_controller(cfg: &RunConfig, events: mpsc::UnboundedSender<UiEvent>) -> Result<Controller> {
    let params: Box<dyn ParamSource> = match cfg.params_file.as_deref() {
        Some(path) => Box::new(ParamFile::new(path, cfg.params.clone())),
        None => Box::new(cfg.params.clone()),
    };
    let engine = ProcessEngine::new(cfg.engine.clone());
    Controller::new(
        engine,
        cfg.engine.cleanup_directive.clone(),
        params,
        events,
    )
    .context("failed to start evaluation lane")
}

/// Render controller events for the terminal. Resolves to the number of failed evaluations.
fn spawn_event_printer(
    mut evt_rx: mpsc::UnboundedReceiver<UiEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    interactive: bool,
    na_token: Option<String>,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut failed = 0usize;
        while let Some(ev) = evt_rx.recv().await {
            match ev {
                UiEvent::Busy(_) => {}
                UiEvent::RecordStarted {
                    record,
                    position,
                    total,
                } => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "[{position}/{total}] {record}"
                    )));
                }
                UiEvent::Evaluated {
                    text,
                    index,
                    elapsed,
                    ..
                } => {
                    if interactive {
                        if !text.is_empty() {
                            let _ = out_tx.send(OutputLine::Stdout(text.trim_end().to_string()));
                        }
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "{} table(s) in {}",
                            index.len(),
                            humantime::format_duration(std::time::Duration::from_millis(
                                elapsed.as_millis() as u64
                            ))
                        )));
                    }
                }
                UiEvent::ProjectFinished { results } => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Project finished: {} table(s)",
                        results.index.len()
                    )));
                }
                UiEvent::EvaluationFailed { record, failure } => {
                    failed += 1;
                    let who = record.map(|r| format!(" ({r})")).unwrap_or_default();
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Evaluation error{who}: {}",
                        failure.message
                    )));
                }
                UiEvent::Table { key, table } => {
                    let _ = out_tx.send(OutputLine::Stdout(format!("== {key} ==")));
                    let _ = out_tx.send(OutputLine::Stdout(
                        table.to_tsv(na_token.as_deref()).trim_end().to_string(),
                    ));
                }
                UiEvent::Info(info) => {
                    let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
                }
            }
        }
        failed
    })
}

async fn run_batch(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    if cfg.records.is_empty() {
        anyhow::bail!("no records given: use --record or --sample-list");
    }
    if cfg.command.trim().is_empty() {
        anyhow::bail!("no command given: use --command or --script");
    }

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = build_controller(&cfg, evt_tx.clone())?;
    let printer = spawn_event_printer(evt_rx, out_tx.clone(), false, cfg.na_token.clone());

    if cfg.project {
        let _ = cmd_tx.send(UiCommand::RunProject {
            records: cfg.records.clone(),
            command: cfg.command.clone(),
        });
    } else {
        let _ = cmd_tx.send(UiCommand::Attach(cfg.records[0].clone()));
        let _ = cmd_tx.send(UiCommand::Evaluate(cfg.command.clone()));
    }
    let _ = cmd_tx.send(UiCommand::Quit);

    let (report, failed) = drive(&cfg, controller, evt_tx, cmd_rx, printer).await?;
    for line in batch_output(&args, &cfg, report) {
        let _ = out_tx.send(line);
    }

    drop(out_tx);
    let _ = out_handle.await;

    if !cfg.project && failed > 0 {
        anyhow::bail!("evaluation failed");
    }
    Ok(())
}

/// Run the control loop to the end, then wait until every event is printed.
async fn drive(
    cfg: &RunConfig,
    mut controller: Controller,
    evt_tx: mpsc::UnboundedSender<UiEvent>,
    cmd_rx: mpsc::UnboundedReceiver<UiCommand>,
    printer: tokio::task::JoinHandle<usize>,
) -> Result<(RunReport, usize)> {
    let started = Instant::now();
    orchestrator::run_controller(&mut controller, evt_tx, cmd_rx).await?;
    let report = orchestrator::build_report(cfg, &controller, started.elapsed());

    // Dropping the controller closes the event stream so the printer can finish.
    drop(controller);
    let failed = printer.await.context("event printer task failed")?;
    Ok((report, failed))
}

/// Save, export and render a finished batch run.
fn batch_output(args: &Cli, cfg: &RunConfig, report: RunReport) -> Vec<OutputLine> {
    let mut lines = Vec::new();
    if !orchestrator::has_results(&report) {
        lines.push(OutputLine::Stderr(
            "Project run produced no tables; no report written".to_string(),
        ));
        return lines;
    }

    let processed = orchestrator::process_run_completion(
        report,
        args.auto_save,
        args.export_json.as_deref(),
        args.export_tsv.as_deref(),
        cfg.na_token.as_deref(),
    );

    if args.json {
        match serde_json::to_string_pretty(&processed.report) {
            Ok(out) => lines.push(OutputLine::Stdout(out)),
            Err(e) => lines.push(OutputLine::Stderr(format!("Failed to serialize report: {e}"))),
        }
    } else {
        let summary = crate::text_summary::build_text_summary(
            &processed.report,
            args.show_tables,
            cfg.transpose,
            cfg.na_token.as_deref(),
        );
        lines.extend(summary.lines.into_iter().map(OutputLine::Stdout));
    }
    lines.extend(processed.export_messages.into_iter().map(OutputLine::Stderr));
    if let Some(p) = processed.auto_saved_path.as_ref() {
        lines.push(OutputLine::Stderr(format!("Saved: {}", p.display())));
    }
    lines
}

async fn run_interactive(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (reject_tx, mut reject_rx) = mpsc::unbounded_channel::<String>();
    let controller = build_controller(&cfg, evt_tx.clone())?;
    let printer = spawn_event_printer(evt_rx, out_tx.clone(), true, cfg.na_token.clone());

    let reject_out = out_tx.clone();
    let rejects = tokio::spawn(async move {
        while let Some(msg) = reject_rx.recv().await {
            let _ = reject_out.send(OutputLine::Stderr(msg));
        }
    });

    let _ = out_tx.send(OutputLine::Stderr(crate::interactive::HELP.to_string()));
    if let Some(first) = cfg.records.first() {
        let _ = cmd_tx.send(UiCommand::Attach(first.clone()));
    }
    crate::interactive::spawn_stdin_reader(cmd_tx, reject_tx, cfg.transpose, cfg.command.clone())
        .context("failed to start stdin reader")?;

    let (report, _) = drive(&cfg, controller, evt_tx, cmd_rx, printer).await?;
    // The reader drops its sender right after sending Quit.
    let _ = rejects.await;

    if !report.tables.is_empty() {
        let processed = orchestrator::process_run_completion(
            report,
            args.auto_save,
            args.export_json.as_deref(),
            args.export_tsv.as_deref(),
            cfg.na_token.as_deref(),
        );
        for msg in processed.export_messages {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
        if let Some(p) = processed.auto_saved_path.as_ref() {
            let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{rows_for, Script, ScriptedEngine};
    use crate::model::ResultKey;
    use pretty_assertions::assert_eq;

    struct Harness {
        controller: Controller,
        evt_tx: mpsc::UnboundedSender<UiEvent>,
        printer: tokio::task::JoinHandle<usize>,
        out_rx: mpsc::UnboundedReceiver<OutputLine>,
    }

    fn harness(engine: ScriptedEngine, interactive: bool) -> Harness {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let params: Vec<Param> = Vec::new();
        let controller = Controller::new(engine, None, Box::new(params), evt_tx.clone()).unwrap();
        let printer = spawn_event_printer(evt_rx, out_tx, interactive, None);
        Harness {
            controller,
            evt_tx,
            printer,
            out_rx,
        }
    }

    fn commands(cmds: Vec<UiCommand>) -> mpsc::UnboundedReceiver<UiCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        for cmd in cmds {
            tx.send(cmd).unwrap();
        }
        rx
    }

    fn split(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> (Vec<String>, Vec<String>) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        while let Ok(line) = rx.try_recv() {
            match line {
                OutputLine::Stdout(s) => out.push(s),
                OutputLine::Stderr(s) => err.push(s),
            }
        }
        (out, err)
    }

    fn args(extra: &[&str]) -> Cli {
        let mut argv = vec!["strata-runner", "--engine", "luna", "-c", "STATS"];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn final_evaluation_output_is_printed_before_shutdown() {
        for _ in 0..20 {
            let h = harness(ScriptedEngine::new(Script::output("RESULT-TEXT\n", vec![])), true);
            let Harness {
                controller,
                evt_tx,
                printer,
                mut out_rx,
            } = h;
            let cfg = build_config(&args(&["--record", "r1"])).unwrap();
            let cmd_rx = commands(vec![
                UiCommand::Attach("r1".into()),
                UiCommand::Evaluate("STATS".into()),
                UiCommand::Quit,
            ]);
            let (report, failed) = drive(&cfg, controller, evt_tx, cmd_rx, printer).await.unwrap();
            assert_eq!(failed, 0);
            assert_eq!(report.log, "RESULT-TEXT\n");
            let (out, _) = split(&mut out_rx);
            assert_eq!(out, vec!["RESULT-TEXT".to_string()]);
        }
    }

    #[tokio::test]
    async fn failed_evaluations_are_counted() {
        let h = harness(ScriptedEngine::new(Script::Fail("bad".into())), false);
        let cfg = build_config(&args(&["--record", "r1"])).unwrap();
        let cmd_rx = commands(vec![
            UiCommand::Attach("r1".into()),
            UiCommand::Evaluate("STATS".into()),
            UiCommand::Quit,
        ]);
        let (_, failed) = drive(&cfg, h.controller, h.evt_tx, cmd_rx, h.printer).await.unwrap();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn project_without_tables_writes_no_report() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("report.json");
        let json_arg = json_path.to_str().unwrap().to_string();
        let cli = args(&[
            "--record",
            "a",
            "--record",
            "b",
            "--json",
            "--auto-save",
            "false",
            "--export-json",
            &json_arg,
        ]);
        let cfg = build_config(&cli).unwrap();
        let h = harness(ScriptedEngine::new(Script::output("", vec![])), false);
        let cmd_rx = commands(vec![
            UiCommand::RunProject {
                records: cfg.records.clone(),
                command: cfg.command.clone(),
            },
            UiCommand::Quit,
        ]);
        let (report, _) = drive(&cfg, h.controller, h.evt_tx, cmd_rx, h.printer).await.unwrap();
        assert!(report.project);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for line in batch_output(&cli, &cfg, report) {
            tx.send(line).unwrap();
        }
        let (out, err) = split(&mut rx);
        assert!(out.is_empty());
        assert_eq!(err, vec!["Project run produced no tables; no report written".to_string()]);
        assert!(!json_path.exists());
    }

    #[tokio::test]
    async fn project_with_tables_prints_json_report() {
        let cli = args(&["--record", "a", "--record", "b", "--json", "--auto-save", "false"]);
        let cfg = build_config(&cli).unwrap();
        let engine = ScriptedEngine::new(Script::output("", vec![(ResultKey::new("STATS", ""), rows_for("x", 1))]));
        let h = harness(engine, false);
        let cmd_rx = commands(vec![
            UiCommand::RunProject {
                records: cfg.records.clone(),
                command: cfg.command.clone(),
            },
            UiCommand::Quit,
        ]);
        let (report, _) = drive(&cfg, h.controller, h.evt_tx, cmd_rx, h.printer).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for line in batch_output(&cli, &cfg, report) {
            tx.send(line).unwrap();
        }
        let (out, _) = split(&mut rx);
        assert_eq!(out.len(), 1);
        let back: RunReport = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(back.tables[0].table.row_count(), 2);
    }

    #[test]
    fn sample_list_takes_first_column() {
        let ids = parse_sample_list("# header\nsubj01\tedf/a.edf\tann/a.xml\n\n  subj02 x\n");
        assert_eq!(ids, vec!["subj01".to_string(), "subj02".to_string()]);
    }

    #[test]
    fn multiple_records_imply_project_mode() {
        let args = Cli::parse_from([
            "strata-runner",
            "--engine",
            "luna",
            "-c",
            "STATS",
            "--record",
            "a",
            "--record",
            "b",
            "--param",
            "sig=C3",
        ]);
        let cfg = build_config(&args).unwrap();
        assert!(cfg.project);
        assert_eq!(cfg.records, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.params, vec![Param::new("sig", "C3")]);
    }

    #[test]
    fn single_record_is_not_a_project() {
        let args = Cli::parse_from(["strata-runner", "--engine", "luna", "-c", "X", "--record", "a"]);
        let cfg = build_config(&args).unwrap();
        assert!(!cfg.project);
        assert_eq!(cfg.command, "X");
    }

    #[test]
    fn text_output_needs_no_flag() {
        let cli = args(&["--record", "a"]);
        assert!(!cli.json);
        assert!(Cli::try_parse_from(["strata-runner", "--engine", "x", "--text"]).is_err());
    }

    #[test]
    fn engine_args_accept_leading_dashes() {
        let args = Cli::parse_from([
            "strata-runner",
            "--engine",
            "luna",
            "--engine-arg",
            "--json",
            "--record",
            "a",
        ]);
        assert_eq!(args.engine_args, vec!["--json".to_string()]);
        assert!(args.auto_save);
    }

    #[test]
    fn bad_inline_param_is_rejected() {
        let res = Cli::try_parse_from(["strata-runner", "--engine", "x", "--param", "novalue"]);
        assert!(res.is_err());
    }
}
