//! Bounded execution of allowlisted command batches.
//!
//! Children run without a shell, with a sanitized environment and a
//! per-step wall-clock timeout. Output is captured with caps; the batch
//! stops at the first failing step.

use crate::allowlist;
use nos_common::agent::{RunStep, StepResult};
use nos_common::{Error, Result};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Maximum steps per `/v1/run` request.
pub const MAX_STEPS: usize = 32;

/// Stderr capture cap per step.
pub const STDERR_CAP: usize = 4096;

/// Timeout for mutating tools.
pub const MUTATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for status probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn sanitized(cmd: &mut Command) {
    cmd.env_clear()
        .env("PATH", "/usr/sbin:/usr/bin:/bin")
        .env("LC_ALL", "C")
        .env("LANG", "C");
}

fn truncate_bytes(bytes: &[u8], cap: usize) -> String {
    let end = bytes.len().min(cap);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Run one already-validated step with the given timeout.
pub async fn run_step_with_timeout(
    cmd: &str,
    args: &[String],
    timeout: Duration,
) -> Result<StepResult> {
    debug!(command = cmd, ?args, "spawning child");

    let mut child = Command::new(cmd);
    child.args(args).kill_on_drop(true);
    sanitized(&mut child);

    let output = tokio::time::timeout(timeout, child.output())
        .await
        .map_err(|_| Error::Internal(format!("{} timed out after {:?}", cmd, timeout)))?
        .map_err(|e| Error::Internal(format!("failed to spawn {}: {}", cmd, e)))?;

    Ok(StepResult {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: truncate_bytes(&output.stderr, STDERR_CAP),
    })
}

/// Run one allowlisted step, picking the timeout from its probe class.
pub async fn run_allowlisted_step(cmd: &str, args: &[String]) -> Result<StepResult> {
    allowlist::validate(cmd, args)?;
    let timeout = if allowlist::is_probe(cmd, args) {
        PROBE_TIMEOUT
    } else {
        MUTATE_TIMEOUT
    };
    run_step_with_timeout(cmd, args, timeout).await
}

/// Execute a batch of steps.
///
/// The whole batch is validated against the allowlist before anything is
/// spawned; a single invalid step rejects the batch. Execution stops at
/// the first step with a non-zero exit code, whose result is included.
pub async fn run_batch(steps: &[RunStep]) -> Result<Vec<StepResult>> {
    if steps.is_empty() {
        return Err(Error::InvalidInput("steps must not be empty".to_string()));
    }
    if steps.len() > MAX_STEPS {
        return Err(Error::InvalidInput(format!(
            "too many steps: {} (max {})",
            steps.len(),
            MAX_STEPS
        )));
    }

    for step in steps {
        allowlist::validate(&step.cmd, &step.args)?;
    }

    let mut results = Vec::with_capacity(steps.len());
    for step in steps {
        let result = run_allowlisted_step(&step.cmd, &step.args).await?;
        let failed = result.code != 0;
        if failed {
            warn!(
                command = %step.cmd,
                code = result.code,
                "step failed, stopping batch"
            );
        }
        results.push(result);
        if failed {
            break;
        }
    }

    Ok(results)
}

/// Run an arbitrary internal tool (not client-supplied) with the sanitized
/// environment and a bounded timeout. Used by the engines for host tooling
/// that is not part of the `/v1/run` allowlist.
pub async fn run_tool(cmd: &str, args: &[&str], timeout: Duration) -> Result<StepResult> {
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    run_step_with_timeout(cmd, &owned, timeout).await
}

/// [`run_tool`] with extra environment variables on top of the sanitized
/// baseline (for tools that are configured through the environment).
pub async fn run_tool_env(
    cmd: &str,
    args: &[&str],
    env: &[(&str, &str)],
    timeout: Duration,
) -> Result<StepResult> {
    let mut child = Command::new(cmd);
    child.args(args).kill_on_drop(true);
    sanitized(&mut child);
    for (k, v) in env {
        child.env(k, v);
    }

    let output = tokio::time::timeout(timeout, child.output())
        .await
        .map_err(|_| Error::Internal(format!("{} timed out after {:?}", cmd, timeout)))?
        .map_err(|e| Error::Internal(format!("failed to spawn {}: {}", cmd, e)))?;

    Ok(StepResult {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: truncate_bytes(&output.stderr, STDERR_CAP),
    })
}

/// Like [`run_tool`] but errors when the exit code is non-zero, carrying
/// the tool's stderr.
pub async fn run_tool_checked(cmd: &str, args: &[&str], timeout: Duration) -> Result<StepResult> {
    let result = run_tool(cmd, args, timeout).await?;
    if result.code != 0 {
        return Err(Error::Internal(format!(
            "{} failed ({}): {}",
            cmd,
            result.code,
            result.stderr.trim()
        )));
    }
    Ok(result)
}
