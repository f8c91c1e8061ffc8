//! External tool invocation and stderr classification

use regex::{Regex, RegexBuilder};
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::types::{ErrorKind, JobError};

/// Longest stderr excerpt kept in a job's error message
const MAX_MESSAGE_LEN: usize = 500;

/// Captured result of a finished tool process
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run `program` with `args` to completion.
///
/// The child is spawned with `kill_on_drop`, so dropping the returned future
/// (timeout, cancellation, aborted task) kills the process. Spawn failures
/// are reported as job errors: a missing or non-executable binary is
/// permanent, anything else is transient.
pub async fn run_tool(program: &Path, args: &[OsString]) -> std::result::Result<ToolOutput, JobError> {
    tracing::debug!("Running {} {:?}", program.display(), args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            let message = format!("{} could not be started: {}", program.display(), e);
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    JobError::tool(message).permanent()
                }
                _ => JobError::transient(message),
            }
        })?;

    Ok(ToolOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

struct PatternRule {
    regex: Regex,
    kind: ErrorKind,
    permanent: bool,
}

/// Ordered stderr classification table of one adapter.
///
/// The first matching rule decides the error kind; unmatched output is a
/// retryable `tool_execution` failure.
pub struct ErrorPatterns {
    rules: Vec<PatternRule>,
}

impl ErrorPatterns {
    /// Compile `(pattern, kind, permanent)` rules; patterns are case-insensitive
    pub fn new(rules: &[(&str, ErrorKind, bool)]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(pattern, kind, permanent)| {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::config(format!("bad error pattern '{}': {}", pattern, e)))?;
                Ok(PatternRule {
                    regex,
                    kind: *kind,
                    permanent: *permanent,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Classify the stderr of a failed run of `tool`
    pub fn classify(&self, tool: &str, status: ExitStatus, stderr: &str) -> JobError {
        let message = format!("{} exited with {}: {}", tool, status, excerpt(stderr));

        match self.rules.iter().find(|rule| rule.regex.is_match(stderr)) {
            Some(rule) => JobError {
                kind: rule.kind,
                message,
                permanent: rule.permanent,
            },
            None => JobError::tool(message),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Tail of stderr, trimmed to the last lines that fit the message budget
fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "(no diagnostic output)".to_string();
    }
    if trimmed.len() <= MAX_MESSAGE_LEN {
        return trimmed.to_string();
    }

    let mut start = trimmed.len() - MAX_MESSAGE_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
