//! Replay comparison types: byte-for-byte output matching with first-diff
//! reporting.

use serde::Serialize;

/// Which recorded stream diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// Standard output diverged.
    Stdout,
    /// Standard error diverged.
    Stderr,
}

/// The first line where a replayed stream diverged from the recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirstDiff {
    /// The diverging stream.
    pub kind: DiffKind,
    /// 1-based line number of the first differing line.
    pub line: usize,
    /// The recorded line (lossy UTF-8).
    pub expected: String,
    /// The replayed line (lossy UTF-8).
    pub actual: String,
}

/// Outcome of replaying a bundle and comparing observable outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// True when both streams match and the exit code is zero.
    pub success: bool,
    /// Stdout matched byte-for-byte.
    #[serde(rename = "stdoutMatches")]
    pub stdout_matches: bool,
    /// Stderr matched byte-for-byte.
    #[serde(rename = "stderrMatches")]
    pub stderr_matches: bool,
    /// The first divergence, when any stream differed.
    #[serde(rename = "firstDiff", skip_serializing_if = "Option::is_none")]
    pub first_diff: Option<FirstDiff>,
    /// The replayed process exit code.
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

impl ReplayReport {
    /// Builds a report by comparing recorded and replayed streams.
    #[must_use]
    pub fn compare(
        recorded_stdout: &[u8],
        actual_stdout: &[u8],
        recorded_stderr: &[u8],
        actual_stderr: &[u8],
        exit_code: i32,
    ) -> Self {
        let stdout_matches = recorded_stdout == actual_stdout;
        let stderr_matches = recorded_stderr == actual_stderr;

        // Stdout divergence is reported first; it is the primary
        // observable channel.
        let first_diff = if stdout_matches {
            first_line_diff(recorded_stderr, actual_stderr)
                .map(|(line, expected, actual)| FirstDiff {
                    kind: DiffKind::Stderr,
                    line,
                    expected,
                    actual,
                })
        } else {
            first_line_diff(recorded_stdout, actual_stdout)
                .map(|(line, expected, actual)| FirstDiff {
                    kind: DiffKind::Stdout,
                    line,
                    expected,
                    actual,
                })
        };

        Self {
            success: stdout_matches && stderr_matches && exit_code == 0,
            stdout_matches,
            stderr_matches,
            first_diff,
            exit_code,
        }
    }
}

/// Finds the first differing line between two byte streams.
///
/// Returns `(1-based line, expected, actual)`; a stream that ends early
/// contributes an empty string for its missing line.
fn first_line_diff(expected: &[u8], actual: &[u8]) -> Option<(usize, String, String)> {
    if expected == actual {
        return None;
    }
    let expected_lines: Vec<&[u8]> = expected.split(|&b| b == b'\n').collect();
    let actual_lines: Vec<&[u8]> = actual.split(|&b| b == b'\n').collect();
    let max = expected_lines.len().max(actual_lines.len());
    for i in 0..max {
        let e = expected_lines.get(i).copied().unwrap_or_default();
        let a = actual_lines.get(i).copied().unwrap_or_default();
        if e != a {
            return Some((
                i + 1,
                String::from_utf8_lossy(e).into_owned(),
                String::from_utf8_lossy(a).into_owned(),
            ));
        }
    }
    // Byte-level difference with identical line splits (e.g. trailing
    // newline variance); report the last line.
    Some((
        max,
        String::from_utf8_lossy(expected_lines.last().copied().unwrap_or_default()).into_owned(),
        String::from_utf8_lossy(actual_lines.last().copied().unwrap_or_default()).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_streams_succeed() {
        let report = ReplayReport::compare(b"a\nb\n", b"a\nb\n", b"", b"", 0);
        assert!(report.success);
        assert!(report.first_diff.is_none());
    }

    #[test]
    fn stdout_divergence_reports_line() {
        let report = ReplayReport::compare(b"a\nb\nc\n", b"a\nX\nc\n", b"", b"", 0);
        assert!(!report.success);
        assert!(!report.stdout_matches);
        let diff = report.first_diff.unwrap();
        assert_eq!(diff.kind, DiffKind::Stdout);
        assert_eq!(diff.line, 2);
        assert_eq!(diff.expected, "b");
        assert_eq!(diff.actual, "X");
    }

    #[test]
    fn stderr_divergence_reported_when_stdout_matches() {
        let report = ReplayReport::compare(b"same\n", b"same\n", b"ok\n", b"boom\n", 0);
        assert!(report.stdout_matches);
        assert!(!report.stderr_matches);
        assert_eq!(report.first_diff.unwrap().kind, DiffKind::Stderr);
    }

    #[test]
    fn truncated_stream_diffs_at_missing_line() {
        let report = ReplayReport::compare(b"a\nb\n", b"a\n", b"", b"", 0);
        let diff = report.first_diff.unwrap();
        assert_eq!(diff.line, 2);
        assert_eq!(diff.expected, "b");
        assert_eq!(diff.actual, "");
    }

    #[test]
    fn nonzero_exit_fails_even_with_matching_streams() {
        let report = ReplayReport::compare(b"a\n", b"a\n", b"", b"", 3);
        assert!(!report.success);
        assert!(report.stdout_matches);
        assert_eq!(report.exit_code, 3);
    }
}
