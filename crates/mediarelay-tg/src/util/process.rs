use crate::observability::metrics::PROCESS_DURATION_SECONDS;
use crate::prelude::*;
use crate::util::retry::{self, ClassifyError, Transience};
use crate::util::DynError;
use crate::{err, Result};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Only the tail of stderr is preserved in errors. The tail is where the
/// tools write the reason of the failure.
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProcessError {
    #[error("Couldn't run program that contains a nul byte: {program:?} {args:?}")]
    NulByte { program: String, args: Vec<String> },

    #[error("Failed to spawn the program. Command:\n{cmd}")]
    Spawn { cmd: String, source: std::io::Error },

    #[error("Program timed out after {timeout:.2?}. Command:\n{cmd}")]
    Timeout { cmd: String, timeout: Duration },

    #[error("Program failed with {status}. Command:\n{cmd}\nStderr:\n{stderr}")]
    Failed {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Program returned bad output. Command:\n{cmd}\nOutput:\n{output}")]
    BadOutput {
        cmd: String,
        output: String,
        source: Box<DynError>,
    },
}

impl ClassifyError for ProcessError {
    fn transience(&self) -> Option<Transience> {
        match self {
            Self::Timeout { .. } => Some(Transience::Transient),
            Self::Spawn { source, .. } => retry::io_transience(source),
            // The reason is somewhere in the free-form stderr
            Self::Failed { .. } => None,
            Self::NulByte { .. } | Self::BadOutput { .. } => Some(Transience::Permanent),
        }
    }

    /// The command line contains the input of the program, so only stderr
    /// tells what went wrong
    fn retry_message(&self) -> String {
        match self {
            Self::Failed { stderr, .. } => stderr.clone(),
            _ => self.display_chain().to_string(),
        }
    }
}

impl ProcessError {
    /// Text that the program wrote to stderr, if it ran to completion
    pub(crate) fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Runs the program to completion and returns its stdout.
///
/// The program is killed if it doesn't finish within `timeout`.
pub(crate) async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
    let display_args = shlex::try_join(args.iter().copied()).map_err(|_| {
        err!(ProcessError::NulByte {
            program: program.to_owned(),
            args: args.iter().map(|&arg| arg.to_owned()).collect::<Vec<_>>(),
        })
    })?;

    let cmd = format!("{program} {display_args}");
    debug!(%cmd, "Running program");

    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let start = Instant::now();
    let output = tokio::time::timeout(timeout, output).await;
    let elapsed = start.elapsed();

    let (result, output) = match output {
        Err(_elapsed) => ("timeout", Err(err!(ProcessError::Timeout { cmd, timeout }))),
        Ok(Err(source)) => ("spawn_error", Err(err!(ProcessError::Spawn { cmd, source }))),
        Ok(Ok(output)) if !output.status.success() => (
            "err",
            Err(err!(ProcessError::Failed {
                cmd,
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            })),
        ),
        Ok(Ok(output)) => ("ok", Ok(output.stdout)),
    };

    metrics::histogram!(
        PROCESS_DURATION_SECONDS,
        elapsed.as_secs_f64(),
        "program" => program.to_owned(),
        "result" => result
    );

    debug!(
        %program,
        result,
        duration = tracing_duration(elapsed),
        "Program finished"
    );

    output
}

pub(crate) async fn run_utf8(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let bytes = run(program, args, timeout).await?;
    String::from_utf8(bytes).map_err(|source| {
        err!(ProcessError::BadOutput {
            cmd: format!("{program} {args:?}"),
            output: String::from_utf8_lossy(source.as_bytes()).into_owned(),
            source: Box::new(source) as Box<DynError>,
        })
    })
}

pub(crate) async fn run_json<T: serde::de::DeserializeOwned>(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<T> {
    let output = run_utf8(program, args, timeout).await?;
    serde_json::from_str(&output).map_err(|source| {
        err!(ProcessError::BadOutput {
            cmd: format!("{program} {args:?}"),
            output: truncate_start(&output, MAX_STDERR_CHARS).to_owned(),
            source: Box::new(source) as Box<DynError>,
        })
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    truncate_start(stderr.trim_end(), MAX_STDERR_CHARS).to_owned()
}

/// Keeps at most `max_chars` characters at the end of the string
fn truncate_start(str: &str, max_chars: usize) -> &str {
    let skip = str.chars().count().saturating_sub(max_chars);
    let byte_offset = str
        .char_indices()
        .nth(skip)
        .map(|(offset, _)| offset)
        .unwrap_or(str.len());
    &str[byte_offset..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use assert_process_error as assert_err;
    use expect_test::{expect, Expect};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[track_caller]
    fn assert_process_error(err: &crate::Error, expected: Expect) {
        let ErrorKind::Process { source } = err.kind() else {
            panic!("Unexpected error kind: {err:?}");
        };
        let actual = match source {
            ProcessError::Failed { status, stderr, .. } => {
                format!("Failed({:?}, {stderr:?})", status.code())
            }
            ProcessError::Timeout { timeout, .. } => format!("Timeout({timeout:?})"),
            ProcessError::Spawn { source, .. } => format!("Spawn({:?})", source.kind()),
            ProcessError::NulByte { .. } => "NulByte".to_owned(),
            ProcessError::BadOutput { output, .. } => format!("BadOutput({output:?})"),
        };
        expected.assert_eq(&actual);
    }

    #[test]
    fn truncation_keeps_the_tail() {
        expect!["lo wörld"].assert_eq(truncate_start("hello wörld", 8));
        expect!["short"].assert_eq(truncate_start("short", 8));
    }

    #[test_log::test(tokio::test)]
    async fn captures_stdout() {
        let output = run_utf8("sh", &["-c", "echo hello"], TIMEOUT).await.unwrap();
        expect!["hello\n"].assert_eq(&output);
    }

    #[test_log::test(tokio::test)]
    async fn failure_captures_stderr() {
        let err = run("sh", &["-c", "echo 'ERROR: boom' >&2; exit 3"], TIMEOUT)
            .await
            .unwrap_err();

        assert_err(&err, expect![[r#"Failed(Some(3), "ERROR: boom")"#]]);
        assert_eq!(crate::util::retry::ClassifyError::transience(&err), None);
    }

    #[test]
    fn failures_are_classified_by_stderr_not_by_command() {
        use crate::util::retry::RetryPolicy;
        use std::os::unix::process::ExitStatusExt;

        let failed = |stderr: &str| -> crate::Error {
            err!(ProcessError::Failed {
                cmd: "yt-dlp --no-playlist https://www.youtube.com/watch?v=abc&t=ETIMEDOUT".to_owned(),
                status: ExitStatus::from_raw(1 << 8),
                stderr: stderr.to_owned(),
            })
        };

        let policy = RetryPolicy::default();

        assert!(!policy.is_retryable(&failed("ERROR: [youtube] abc: Video unavailable")));
        assert!(policy.is_retryable(&failed("ERROR: getaddrinfo failed")));
    }

    #[test_log::test(tokio::test)]
    async fn timeout_kills_the_program() {
        let err = run("sleep", &["10"], Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_err(&err, expect!["Timeout(50ms)"]);
        assert_eq!(
            crate::util::retry::ClassifyError::transience(&err),
            Some(Transience::Transient)
        );
    }

    #[test_log::test(tokio::test)]
    async fn missing_program() {
        let err = run("definitely-not-installed-program", &[], TIMEOUT)
            .await
            .unwrap_err();

        assert_err(&err, expect!["Spawn(NotFound)"]);
    }

    #[test_log::test(tokio::test)]
    async fn bad_json() {
        let err = run_json::<serde_json::Value>("sh", &["-c", "echo not-json"], TIMEOUT)
            .await
            .unwrap_err();

        assert_err(&err, expect![[r#"BadOutput("not-json\n")"#]]);
    }
}
