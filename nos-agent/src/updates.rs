//! Package-manager bridge.
//!
//! `plan` simulates an upgrade and parses the pending update list;
//! `apply` runs the real upgrade under a generous bound. Hosts without an
//! apt-compatible package manager get `not_implemented`.

use nos_common::agent::{UpdatesApplyResponse, UpdatesPlanResponse};
use nos_common::{Error, Result};
use std::time::Duration;
use tracing::info;

use crate::exec;
use crate::parsers;

const PLAN_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Tail kept from the tool output on apply.
const OUTPUT_TAIL: usize = 8 * 1024;

fn unsupported(e: &Error) -> bool {
    matches!(e, Error::Internal(msg) if msg.contains("failed to spawn"))
}

/// Simulate an upgrade and return the parsed plan.
pub async fn plan() -> Result<UpdatesPlanResponse> {
    let result = exec::run_tool("apt-get", &["-s", "upgrade"], PLAN_TIMEOUT)
        .await
        .map_err(|e| {
            if unsupported(&e) {
                Error::NotImplemented("no apt-compatible package manager".to_string())
            } else {
                e
            }
        })?;

    if result.code != 0 {
        return Err(Error::Internal(format!(
            "simulate failed ({}): {}",
            result.code,
            result.stderr.trim()
        )));
    }

    let updates = parsers::parse_updates_plan(&result.stdout);
    info!(pending = updates.len(), "update plan computed");
    Ok(UpdatesPlanResponse { updates })
}

/// Apply pending updates non-interactively.
pub async fn apply() -> Result<UpdatesApplyResponse> {
    let result = exec::run_tool_env(
        "apt-get",
        &[
            "-y",
            "-o",
            "Dpkg::Options::=--force-confdef",
            "-o",
            "Dpkg::Options::=--force-confold",
            "upgrade",
        ],
        &[("DEBIAN_FRONTEND", "noninteractive")],
        APPLY_TIMEOUT,
    )
    .await
    .map_err(|e| {
        if unsupported(&e) {
            Error::NotImplemented("no apt-compatible package manager".to_string())
        } else {
            e
        }
    })?;

    let mut output = result.stdout;
    if output.len() > OUTPUT_TAIL {
        let mut start = output.len() - OUTPUT_TAIL;
        while !output.is_char_boundary(start) {
            start += 1;
        }
        output = output[start..].to_string();
    }

    if result.code != 0 {
        return Err(Error::Internal(format!(
            "upgrade failed ({}): {}",
            result.code,
            result.stderr.trim()
        )));
    }

    info!("updates applied");
    Ok(UpdatesApplyResponse { ok: true, output })
}
