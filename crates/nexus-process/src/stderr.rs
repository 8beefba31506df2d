//! Stderr scanning, failure classification and secret redaction.

use std::collections::VecDeque;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use crate::STDERR_TAIL_LINES;

/// Replaces known secrets (stream keys) in text before it is logged.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Placeholder written in place of a secret.
    pub const MASK: &'static str = "****";

    /// Create a redactor for the given secrets. Empty strings are ignored.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a key that contains another key is fully masked.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Redact every secret in `text`.
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), Self::MASK);
            }
        }
        out
    }

    /// Redact and join an argument list for logging.
    pub fn join_args(&self, args: &[String]) -> String {
        args.iter()
            .map(|a| self.apply(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The last lines a process wrote to stderr, already redacted.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines from oldest to newest.
    pub fn lines(&self) -> impl ExactSizeIterator<Item = &str> + DoubleEndedIterator + '_ {
        self.lines.iter().map(String::as_str)
    }

    /// The newest `n` lines, oldest first.
    pub fn last(&self, n: usize) -> impl ExactSizeIterator<Item = &str> + '_ {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Returns true for stderr lines worth surfacing in the logs.
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("failed") || lower.contains("[warning]")
}

/// Map well-known ffmpeg failure lines to a short reason, newest line first.
pub fn classify_failure<'a, I>(lines: I) -> Option<&'static str>
where
    I: DoubleEndedIterator<Item = &'a str>,
{
    for line in lines.rev() {
        if line.contains("Connection refused") {
            return Some("remote server refused connection");
        }
        if line.contains("Connection timed out") {
            return Some("remote server connection timed out");
        }
        if line.contains("Connection reset") || line.contains("Broken pipe") {
            return Some("connection reset by remote server");
        }
        if line.contains("No such file or directory") {
            return Some("input not found");
        }
        if line.contains("Input/output error") || line.contains("error code: -5") {
            return Some("I/O error, network connection lost");
        }
        if line.contains("Invalid data found when processing input") {
            return Some("input is not a valid media stream");
        }
        if line.contains("error muxing packet") {
            return Some("failed to send packet (possible network issue)");
        }
    }
    None
}

/// Read stderr to EOF, logging error lines and keeping a redacted tail.
pub async fn scan_stderr<R>(reader: R, label: String, redactor: Redactor) -> StderrTail
where
    R: AsyncRead + Unpin,
{
    let mut tail = StderrTail::default();
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let redacted = redactor.apply(&line);
                if is_error_line(&line) {
                    warn!(label = %label, "{}", redacted);
                }
                tail.push(redacted);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    tail
}
