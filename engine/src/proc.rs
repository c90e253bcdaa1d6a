use std::{path::Path, process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command, time::Instant};
use tracing::debug;

/// Decision taken by an output filter on every chunk the child prints.
pub enum FilterVerdict {
	Continue,
	/// Kill the child immediately; carries the matched pattern.
	Kill(String),
}

pub type OutputFilter = dyn Fn(&str, &str) -> FilterVerdict + Send + Sync;

/// A filter that kills the child as soon as any of the given substrings
/// shows up in its output.
pub fn fatal_pattern_filter(patterns: &'static [&'static str]) -> Box<OutputFilter> {
	Box::new(move |chunk, _accumulated| {
		for pattern in patterns {
			if chunk.contains(pattern) {
				return FilterVerdict::Kill((*pattern).to_string());
			}
		}
		FilterVerdict::Continue
	})
}

#[derive(Error, Debug)]
pub enum ProcError {
	#[error("failed to spawn {program}: {source}")]
	Spawn { program: String, source: std::io::Error },
	#[error("{program} timed out after {after:?}")]
	TimedOut { program: String, after: Duration },
	#[error("{program} output matched fatal pattern: {pattern}")]
	Fatal { program: String, pattern: String },
	#[error("{program} exited with status {status}, expected {expected}")]
	BadExit { program: String, status: i32, expected: i32 },
	#[error("io error running {program}: {source}")]
	Io { program: String, source: std::io::Error },
}

pub struct CommandOutput {
	pub status: i32,
	/// stdout and stderr, merged in arrival order.
	pub output: String,
}

// Effectively forever; subprocess timeouts are bounded well below this.
const NO_TIMEOUT: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Run a subprocess in `cwd`, streaming its merged output through an
/// optional filter that can abort it, under a wall-clock timeout. The
/// child is killed hard (SIGKILL) on timeout or filter abort; semantic
/// results are expected to flow through files, not the captured output.
pub async fn run_command(
	program: &str,
	args: &[&str],
	cwd: &Path,
	timeout: Option<Duration>,
	expect_status: Option<i32>,
	filter: Option<&OutputFilter>,
) -> Result<CommandOutput, ProcError> {
	debug!(program, ?args, cwd = %cwd.display(), "running command");

	let mut child = Command::new(program)
		.args(args)
		.current_dir(cwd)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.map_err(|source| ProcError::Spawn { program: program.to_string(), source })?;

	let mut stdout = child.stdout.take().expect("stdout is piped");
	let mut stderr = child.stderr.take().expect("stderr is piped");

	let deadline = Instant::now() + timeout.unwrap_or(NO_TIMEOUT);
	let mut output = String::new();
	let mut stdout_buf = [0u8; 4096];
	let mut stderr_buf = [0u8; 4096];
	let mut stdout_open = true;
	let mut stderr_open = true;

	let io_error = |source| ProcError::Io { program: program.to_string(), source };
	let timed_out = || ProcError::TimedOut {
		program: program.to_string(),
		after: timeout.unwrap_or(NO_TIMEOUT),
	};

	while stdout_open || stderr_open {
		let chunk = tokio::select! {
			read = stdout.read(&mut stdout_buf), if stdout_open => match read.map_err(io_error)? {
				0 => {
					stdout_open = false;
					None
				},
				n => Some(String::from_utf8_lossy(&stdout_buf[..n]).into_owned()),
			},
			read = stderr.read(&mut stderr_buf), if stderr_open => match read.map_err(io_error)? {
				0 => {
					stderr_open = false;
					None
				},
				n => Some(String::from_utf8_lossy(&stderr_buf[..n]).into_owned()),
			},
			() = tokio::time::sleep_until(deadline) => {
				let _ = child.kill().await;
				return Err(timed_out());
			},
		};

		if let Some(chunk) = chunk {
			debug!(program, "output: {}", chunk.trim_end());
			if let Some(filter) = filter {
				if let FilterVerdict::Kill(pattern) = filter(&chunk, &output) {
					let _ = child.kill().await;
					return Err(ProcError::Fatal { program: program.to_string(), pattern });
				}
			}
			output.push_str(&chunk);
		}
	}

	let status = tokio::time::timeout_at(deadline, child.wait())
		.await
		.map_err(|_elapsed| timed_out())?
		.map_err(io_error)?;
	let status = status.code().unwrap_or(-1);

	if let Some(expected) = expect_status {
		if status != expected {
			return Err(ProcError::BadExit {
				program: program.to_string(),
				status,
				expected,
			});
		}
	}
	Ok(CommandOutput { status, output })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn captures_merged_output_and_status() {
		let dir = tempfile::tempdir().unwrap();
		let result = run_command(
			"sh",
			&["-c", "echo out; echo err 1>&2"],
			dir.path(),
			Some(Duration::from_secs(5)),
			Some(0),
			None,
		)
		.await
		.unwrap();
		assert_eq!(result.status, 0);
		assert!(result.output.contains("out"));
		assert!(result.output.contains("err"));
	}

	#[tokio::test]
	async fn asserts_the_expected_exit_status() {
		let dir = tempfile::tempdir().unwrap();
		let result = run_command(
			"sh",
			&["-c", "exit 3"],
			dir.path(),
			Some(Duration::from_secs(5)),
			Some(0),
			None,
		)
		.await;
		assert!(matches!(
			result,
			Err(ProcError::BadExit { status: 3, expected: 0, .. })
		));
	}

	#[tokio::test]
	async fn kills_on_timeout() {
		let dir = tempfile::tempdir().unwrap();
		let started = std::time::Instant::now();
		let result = run_command(
			"sh",
			&["-c", "sleep 30"],
			dir.path(),
			Some(Duration::from_millis(100)),
			Some(0),
			None,
		)
		.await;
		assert!(matches!(result, Err(ProcError::TimedOut { .. })));
		assert!(started.elapsed() < Duration::from_secs(10));
	}

	#[tokio::test]
	async fn filter_aborts_on_fatal_output() {
		let dir = tempfile::tempdir().unwrap();
		let filter = fatal_pattern_filter(&["Unable to download signature!"]);
		let started = std::time::Instant::now();
		let result = run_command(
			"sh",
			&["-c", "echo 'Unable to download signature!'; sleep 30"],
			dir.path(),
			Some(Duration::from_secs(60)),
			Some(0),
			Some(&filter),
		)
		.await;
		assert!(matches!(result, Err(ProcError::Fatal { .. })));
		assert!(started.elapsed() < Duration::from_secs(10));
	}
}
