//! Parameter parsing and sources.
//!
//! Parameters are plain `name value` (or `name=value`) lines. They are read
//! fresh before every evaluation so edits take effect on the next run.

use crate::model::Param;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("failed to read parameter file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid parameter '{0}': expected NAME=VALUE")]
    Invalid(String),
}

/// Supplies the parameter set applied before each evaluation.
pub trait ParamSource: Send {
    fn params(&self) -> Result<Vec<Param>, ParamError>;
}

impl ParamSource for Vec<Param> {
    fn params(&self) -> Result<Vec<Param>, ParamError> {
        Ok(self.clone())
    }
}

/// Parameter file re-read on every call, with inline overrides applied last.
#[derive(Debug, Clone)]
pub struct ParamFile {
    path: PathBuf,
    extra: Vec<Param>,
}

impl ParamFile {
    pub fn new(path: impl Into<PathBuf>, extra: Vec<Param>) -> Self {
        Self {
            path: path.into(),
            extra,
        }
    }
}

impl ParamSource for ParamFile {
    fn params(&self) -> Result<Vec<Param>, ParamError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ParamError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut params = parse_params(&text);
        params.extend(self.extra.iter().cloned());
        Ok(params)
    }
}

/// Parse parameter text, skipping blanks, `%` comments and malformed lines.
pub fn parse_params(text: &str) -> Vec<Param> {
    text.lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('%') {
                return None;
            }
            let toks = tokenize_pair(line);
            let [name, value] = <[String; 2]>::try_from(toks).ok()?;
            let (name, value) = (name.trim().to_string(), value.trim().to_string());
            if name.is_empty() && value.is_empty() {
                return None;
            }
            Some(Param { name, value })
        })
        .collect()
}

/// Parse a single `NAME=VALUE` argument as given on the command line.
pub fn parse_param_arg(arg: &str) -> Result<Param, ParamError> {
    match <[String; 2]>::try_from(tokenize_pair(arg.trim())) {
        Ok([name, value]) if !name.trim().is_empty() => {
            Ok(Param::new(name.trim(), value.trim()))
        }
        _ => Err(ParamError::Invalid(arg.to_string())),
    }
}

/// Split a line at the first unquoted space, tab or `=`. Quotes are kept.
fn tokenize_pair(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in line.chars() {
        if escaped {
            buf.push(ch);
            escaped = false;
            continue;
        }
        if let Some(q) = quote {
            buf.push(ch);
            if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
            buf.push(ch);
            continue;
        }
        if matches!(ch, ' ' | '\t' | '=') && out.is_empty() {
            out.push(buf.trim().to_string());
            buf.clear();
            continue;
        }
        buf.push(ch);
    }
    if !buf.is_empty() {
        out.push(buf.trim().to_string());
    }
    if out.len() == 2 {
        out[1] = out[1].trim_start_matches(&['=', ' ', '\t'][..]).to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn parses_space_and_equals_forms() {
        let params = parse_params("alpha 1\nbeta=two\ngamma = 3\n");
        assert_eq!(
            params,
            vec![
                Param::new("alpha", "1"),
                Param::new("beta", "two"),
                Param::new("gamma", "3"),
            ]
        );
    }

    #[test]
    fn skips_comments_blanks_and_single_tokens() {
        let params = parse_params("% comment\n\n   \nlonely\nkey\tvalue\n");
        assert_eq!(params, vec![Param::new("key", "value")]);
    }

    #[test]
    fn keeps_quoted_values_intact() {
        let params = parse_params("sig \"C3 C4\"\nlabel 'a=b'\n");
        assert_eq!(
            params,
            vec![Param::new("sig", "\"C3 C4\""), Param::new("label", "'a=b'")]
        );
    }

    #[test]
    fn value_may_contain_separators_after_first_split() {
        let params = parse_params("expr a = b c\n");
        assert_eq!(params, vec![Param::new("expr", "a = b c")]);
    }

    #[test]
    fn param_arg_requires_name() {
        assert_eq!(parse_param_arg("x=1").unwrap(), Param::new("x", "1"));
        assert!(parse_param_arg("=1").is_err());
        assert!(parse_param_arg("novalue").is_err());
    }

    #[test]
    fn param_file_is_reread_each_call() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a 1").unwrap();
        let source = ParamFile::new(file.path(), vec![Param::new("z", "9")]);
        assert_eq!(
            source.params().unwrap(),
            vec![Param::new("a", "1"), Param::new("z", "9")]
        );

        writeln!(file, "b 2").unwrap();
        assert_eq!(source.params().unwrap().len(), 3);
    }

    #[test]
    fn missing_param_file_is_an_error() {
        let source = ParamFile::new("/nonexistent/params.txt", Vec::new());
        assert!(matches!(source.params(), Err(ParamError::Read { .. })));
    }
}
