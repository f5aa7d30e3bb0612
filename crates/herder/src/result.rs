//! Result envelope for one-shot commands.

use serde::Serialize;
use serde_json::Value;

/// Exit code, raw output, and best-effort decoded payload of one command.
///
/// Comparing a `ShellResult` with a JSON value or a string compares against
/// the payload when one was decoded and against raw stdout otherwise, so a
/// test can assert `result == json!({...})` or `result == "text"` alike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellResult {
    exitcode: i32,
    stdout: String,
    stderr: String,
    #[serde(rename = "json")]
    payload: Option<Value>,
}

impl ShellResult {
    /// Builds an envelope.
    #[must_use]
    pub fn new(
        exitcode: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            exitcode,
            stdout: stdout.into(),
            stderr: stderr.into(),
            payload,
        }
    }

    /// Raw exit code of the command. Non-zero is not interpreted here.
    #[must_use]
    pub const fn exitcode(&self) -> i32 {
        self.exitcode
    }

    /// Captured stdout, decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured stderr, decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Decoded payload, absent when stdout was not structured.
    #[must_use]
    pub const fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Compares against `expected`: the payload if present, else stdout as a
    /// JSON string.
    #[must_use]
    pub fn matches(&self, expected: &Value) -> bool {
        match &self.payload {
            Some(payload) => payload == expected,
            None => expected.as_str() == Some(self.stdout.as_str()),
        }
    }

    fn matches_text(&self, expected: &str) -> bool {
        match &self.payload {
            Some(payload) => payload.as_str() == Some(expected),
            None => self.stdout == expected,
        }
    }
}

impl PartialEq<Value> for ShellResult {
    fn eq(&self, other: &Value) -> bool {
        self.matches(other)
    }
}

impl PartialEq<str> for ShellResult {
    fn eq(&self, other: &str) -> bool {
        self.matches_text(other)
    }
}

impl PartialEq<&str> for ShellResult {
    fn eq(&self, other: &&str) -> bool {
        self.matches_text(other)
    }
}

impl PartialEq<String> for ShellResult {
    fn eq(&self, other: &String) -> bool {
        self.matches_text(other)
    }
}
