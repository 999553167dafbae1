//! Filters that ship with the engine, plus external command filters.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quire_cache::Section;
use quire_config::CommandFilterConfig;

use crate::filter::{Filter, FilterContext, FilterInfo, FilterMode};
use crate::error::FilterError;

/// Identity filter. Useful to give a document a key with a filter without
/// changing its content.
pub struct DexyFilter {
    info: FilterInfo,
}

impl DexyFilter {
    /// Creates the filter under alias `dexy`.
    pub fn new() -> Self {
        Self {
            info: FilterInfo::new("dexy", FilterMode::Passthrough),
        }
    }
}

impl Default for DexyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for DexyFilter {
    fn info(&self) -> &FilterInfo {
        &self.info
    }
}

/// Joins a sectioned payload back into a single text.
pub struct JoinFilter {
    info: FilterInfo,
}

impl JoinFilter {
    /// Creates the filter under alias `join`.
    pub fn new() -> Self {
        Self {
            info: FilterInfo::new("join", FilterMode::TextToText),
        }
    }
}

impl Default for JoinFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for JoinFilter {
    fn info(&self) -> &FilterInfo {
        &self.info
    }

    fn process_text(&self, _ctx: &FilterContext<'_>, input: &str) -> Result<String, FilterError> {
        // Sections were already concatenated in order on the way in.
        Ok(input.to_string())
    }
}

/// Splits text into named sections at `### @export "name"` marker lines.
///
/// A `### @end` line closes the current section. Text outside any named
/// section becomes a section numbered by position; blank unnamed stretches
/// are dropped. Marker lines are not part of any section.
pub struct SectionsFilter {
    info: FilterInfo,
}

impl SectionsFilter {
    /// Creates the filter under alias `sections`.
    pub fn new() -> Self {
        Self {
            info: FilterInfo::new("sections", FilterMode::TextToSections),
        }
    }
}

impl Default for SectionsFilter {
    fn default() -> Self {
        Self::new()
    }
}

const EXPORT_MARKER: &str = "### @export";
const END_MARKER: &str = "### @end";

impl Filter for SectionsFilter {
    fn info(&self) -> &FilterInfo {
        &self.info
    }

    fn split_sections(
        &self,
        _ctx: &FilterContext<'_>,
        input: &str,
    ) -> Result<Vec<Section>, FilterError> {
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<String> = None;
        let mut buffer = String::new();
        let mut anonymous = 0usize;

        let mut flush = |name: Option<String>,
                         buffer: &mut String,
                         sections: &mut Vec<Section>|
         -> Result<(), FilterError> {
            let text = std::mem::take(buffer);
            let name = match name {
                Some(name) => name,
                None if text.trim().is_empty() => return Ok(()),
                None => {
                    anonymous += 1;
                    anonymous.to_string()
                }
            };
            if sections.iter().any(|s| s.name == name) {
                return Err(FilterError::Failed {
                    alias: "sections".to_string(),
                    reason: format!("duplicate section name '{name}'"),
                });
            }
            sections.push(Section::new(name, text));
            Ok(())
        };

        for line in input.split_inclusive('\n') {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(EXPORT_MARKER) {
                let name = rest.trim().trim_matches('"').to_string();
                if name.is_empty() {
                    return Err(FilterError::Failed {
                        alias: "sections".to_string(),
                        reason: "export marker without a section name".to_string(),
                    });
                }
                flush(current.take(), &mut buffer, &mut sections)?;
                current = Some(name);
            } else if trimmed == END_MARKER {
                flush(current.take(), &mut buffer, &mut sections)?;
            } else {
                buffer.push_str(line);
            }
        }
        flush(current.take(), &mut buffer, &mut sections)?;
        Ok(sections)
    }
}

/// Runs an external program: the previous step's text goes to stdin and
/// stdout becomes the output.
///
/// The program runs in the step's scratch directory with `QUIRE_DOCUMENT`,
/// `QUIRE_ARTIFACT` and `QUIRE_ARGS` (the filter's argument block as JSON)
/// set in its environment.
pub struct CommandFilter {
    info: FilterInfo,
    command: Vec<String>,
}

impl CommandFilter {
    /// Builds a filter from its `[filters.<alias>]` section. `default_timeout`
    /// applies when the section has none.
    pub fn from_config(alias: &str, config: &CommandFilterConfig, default_timeout: Duration) -> Self {
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            info: FilterInfo {
                alias: alias.to_string(),
                version: config.version.clone(),
                input_extensions: config.input_extensions.clone(),
                output_extensions: config.output_extensions.clone(),
                mode: FilterMode::TextToText,
                timeout: Some(timeout),
            },
            command: config.command.clone(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> FilterError {
        FilterError::Io {
            alias: self.info.alias.clone(),
            source,
        }
    }
}

impl Filter for CommandFilter {
    fn info(&self) -> &FilterInfo {
        &self.info
    }

    fn process_text(&self, ctx: &FilterContext<'_>, input: &str) -> Result<String, FilterError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(FilterError::Failed {
                alias: self.info.alias.clone(),
                reason: "empty command".to_string(),
            });
        };
        std::fs::create_dir_all(&ctx.work_dir).map_err(|e| self.io_error(e))?;

        let filter_args = ctx.args.map(|v| v.to_string()).unwrap_or_else(|| "{}".to_string());
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&ctx.work_dir)
            .env("QUIRE_DOCUMENT", ctx.document_key)
            .env("QUIRE_ARTIFACT", ctx.artifact_key)
            .env("QUIRE_ARGS", filter_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.io_error(e))?;

        // Feed stdin and drain the pipes on their own threads so a chatty
        // child cannot block on a full pipe.
        let stdin = child.stdin.take();
        let input = input.to_string();
        let writer = thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes())?;
            }
            Ok(())
        });
        let stdout = child.stdout.take();
        let stdout_reader = thread::spawn(move || {
            let mut out = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut out);
            }
            out
        });
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut out = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut out);
            }
            out
        });

        let timeout = self.info.timeout.unwrap_or(Duration::from_secs(30));
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| self.io_error(e))? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(filter = %self.info.alias, document = %ctx.document_key, "command timed out");
                return Err(FilterError::Timeout {
                    alias: self.info.alias.clone(),
                    secs: timeout.as_secs(),
                });
            }
            thread::sleep(Duration::from_millis(10));
        };

        // A child that exits without reading stdin closes the pipe; only the
        // exit status matters then.
        let _ = writer.join();
        let out = stdout_reader.join().unwrap_or_default();
        let err = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(FilterError::Command {
                alias: self.info.alias.clone(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            });
        }
        String::from_utf8(out).map_err(|e| FilterError::Failed {
            alias: self.info.alias.clone(),
            reason: format!("output is not UTF-8: {e}"),
        })
    }
}

/// The filters every registry starts with.
pub fn builtin_filters() -> Vec<Arc<dyn Filter>> {
    vec![
        Arc::new(DexyFilter::new()),
        Arc::new(JoinFilter::new()),
        Arc::new(SectionsFilter::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::apply;
    use quire_cache::Payload;
    use std::path::PathBuf;

    fn ctx(work_dir: PathBuf) -> FilterContext<'static> {
        FilterContext {
            document_key: "a.txt|f",
            artifact_key: "a.txt|f",
            input_ext: ".txt",
            output_ext: ".txt",
            args: None,
            work_dir,
            inputs: &[],
        }
    }

    fn split(text: &str) -> Result<Vec<Section>, FilterError> {
        SectionsFilter::new().split_sections(&ctx(PathBuf::from(".")), text)
    }

    #[test]
    fn sections_split_at_markers() {
        let text = "intro\n### @export \"setup\"\nx = 1\n### @end\n### @export \"run\"\nprint(x)\n";
        let sections = split(text).unwrap();
        assert_eq!(
            sections,
            vec![
                Section::new("1", "intro\n"),
                Section::new("setup", "x = 1\n"),
                Section::new("run", "print(x)\n"),
            ]
        );
    }

    #[test]
    fn sections_drop_blank_gaps() {
        let text = "### @export \"a\"\none\n### @end\n\n### @export \"b\"\ntwo";
        let names: Vec<_> = split(text).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_section_names_fail() {
        let text = "### @export \"a\"\none\n### @export \"a\"\ntwo\n";
        assert!(split(text).is_err());
    }

    #[test]
    fn join_restores_text() {
        let sections = Payload::Sections(vec![Section::new("a", "one\n"), Section::new("b", "two\n")]);
        let out = apply(&JoinFilter::new(), &ctx(PathBuf::from(".")), &sections).unwrap();
        assert_eq!(out, Payload::Text("one\ntwo\n".into()));
    }

    fn command(cmd: &[&str], timeout_secs: Option<u64>) -> CommandFilter {
        let config = CommandFilterConfig {
            command: cmd.iter().map(|s| s.to_string()).collect(),
            input_extensions: vec![".*".into()],
            output_extensions: vec![".*".into()],
            timeout_secs,
            version: "1".into(),
        };
        CommandFilter::from_config("cmd", &config, Duration::from_secs(30))
    }

    #[cfg(unix)]
    #[test]
    fn command_pipes_stdin_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let f = command(&["tr", "a-z", "A-Z"], None);
        let out = f.process_text(&ctx(dir.path().join("work")), "hello").unwrap();
        assert_eq!(out, "HELLO");
    }

    #[cfg(unix)]
    #[test]
    fn command_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let f = command(&["sh", "-c", "echo broken >&2; exit 3"], None);
        let err = f.process_text(&ctx(dir.path().to_path_buf()), "").unwrap_err();
        match err {
            FilterError::Command { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("expected command error, got {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let f = command(&["sleep", "5"], Some(0));
        let err = f.process_text(&ctx(dir.path().to_path_buf()), "").unwrap_err();
        assert!(matches!(err, FilterError::Timeout { .. }));
    }

    #[test]
    fn empty_command_fails() {
        let f = command(&[], None);
        assert!(f.process_text(&ctx(PathBuf::from(".")), "x").is_err());
    }

    #[test]
    fn builtins_have_distinct_aliases() {
        let aliases: Vec<_> = builtin_filters().iter().map(|f| f.info().alias.clone()).collect();
        assert_eq!(aliases, vec!["dexy", "join", "sections"]);
    }
}
