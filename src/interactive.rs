//! Line-oriented interactive front end.
//!
//! Reads stdin on its own thread and turns each line into a [`UiCommand`], so
//! the control loop stays responsive while a job runs.

use crate::model::ResultKey;
use crate::orchestrator::UiCommand;
use std::io::BufRead;
use tokio::sync::mpsc::UnboundedSender;

pub(crate) const HELP: &str = "\
:attach ID            select the record to evaluate against
:project ID...        evaluate the last command across the given records
:show CMD [STRATUM]   print a result table
:render               list result tables and mark the view current
:clear                drop results and project state
:quit                 exit once running work finishes
anything else         evaluate as a command";

/// Parse one input line. `last_command` is reused by `:project`.
pub(crate) fn parse_line(line: &str, last_command: &str, transpose: bool) -> Result<Option<UiCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix(':') else {
        return Ok(Some(UiCommand::Evaluate(line.to_string())));
    };

    let mut parts = rest.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let cmd = match (verb, args.as_slice()) {
        ("attach", [id]) => UiCommand::Attach(id.to_string()),
        ("project", ids) if !ids.is_empty() => {
            if last_command.is_empty() {
                return Err("no command evaluated yet".into());
            }
            UiCommand::RunProject {
                records: ids.iter().map(|s| s.to_string()).collect(),
                command: last_command.to_string(),
            }
        }
        ("show", [command]) => UiCommand::Show {
            key: ResultKey::new(*command, ""),
            transpose,
        },
        ("show", [command, stratum]) => UiCommand::Show {
            key: ResultKey::new(*command, *stratum),
            transpose,
        },
        ("render", []) => UiCommand::Render,
        ("clear", []) => UiCommand::Clear,
        ("quit", []) | ("q", []) => UiCommand::Quit,
        _ => return Err(format!("unrecognised input ':{rest}'\n{HELP}")),
    };
    Ok(Some(cmd))
}

/// Forward stdin lines as commands until EOF or `:quit`. Lines that fail to
/// parse go to `rejects`.
///
/// Uses a dedicated thread with blocking reads. The thread sends `Quit` as
/// its last command and drops both senders right after.
pub(crate) fn spawn_stdin_reader(
    cmd_tx: UnboundedSender<UiCommand>,
    rejects: UnboundedSender<String>,
    transpose: bool,
    initial_command: String,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let mut last_command = initial_command;
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = rejects.send(format!("stdin: {e}"));
                        break;
                    }
                };
                match parse_line(&line, &last_command, transpose) {
                    Ok(Some(cmd)) => {
                        if let UiCommand::Evaluate(text) = &cmd {
                            last_command = text.clone();
                        }
                        let quit = cmd == UiCommand::Quit;
                        if cmd_tx.send(cmd).is_err() || quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => {
                        let _ = rejects.send(msg);
                    }
                }
            }
            let _ = cmd_tx.send(UiCommand::Quit);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_lines_evaluate() {
        assert_eq!(
            parse_line("  STATS sig=C3 ", "", false).unwrap(),
            Some(UiCommand::Evaluate("STATS sig=C3".into()))
        );
        assert_eq!(parse_line("   ", "", false).unwrap(), None);
    }

    #[test]
    fn project_reuses_last_command() {
        assert_eq!(
            parse_line(":project a b", "HEADERS", false).unwrap(),
            Some(UiCommand::RunProject {
                records: vec!["a".into(), "b".into()],
                command: "HEADERS".into(),
            })
        );
        assert!(parse_line(":project a", "", false).is_err());
    }

    #[test]
    fn show_accepts_optional_stratum() {
        assert_eq!(
            parse_line(":show PSD CH_F", "", true).unwrap(),
            Some(UiCommand::Show {
                key: ResultKey::new("PSD", "CH_F"),
                transpose: true,
            })
        );
        assert_eq!(
            parse_line(":show HEADERS", "", false).unwrap(),
            Some(UiCommand::Show {
                key: ResultKey::new("HEADERS", ""),
                transpose: false,
            })
        );
    }

    #[test]
    fn unknown_directives_are_errors() {
        assert!(parse_line(":frobnicate", "", false).is_err());
        assert!(parse_line(":attach", "", false).is_err());
    }
}
