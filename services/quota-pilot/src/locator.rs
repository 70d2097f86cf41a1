//! Companion language server discovery
//!
//! The desktop client runs a local language server that exposes its own
//! quota endpoint. Its pid, CSRF token and extension port are only visible
//! on its command line, so we scan the process table for it.

use serde::Serialize;
use tracing::debug;

/// Executable name fragment of the companion process.
pub const PROCESS_NAME: &str = "language_server_antigravity";

const CSRF_FLAG: &str = "--csrf_token=";
const PORT_FLAG: &str = "--extension_server_port=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionProcess {
    pub pid: u32,
    pub csrf_token: String,
    pub port: u16,
}

/// Parse one `ps aux` line. `None` unless it is the companion process with
/// both flags present.
pub fn parse_process_line(line: &str) -> Option<CompanionProcess> {
    if !line.contains(PROCESS_NAME) {
        return None;
    }

    // ps aux columns: USER PID %CPU ...
    let pid = line.split_whitespace().nth(1)?.parse().ok()?;

    let mut csrf_token = None;
    let mut port = None;
    for arg in line.split_whitespace() {
        if let Some(value) = arg.strip_prefix(CSRF_FLAG) {
            csrf_token = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix(PORT_FLAG) {
            port = value.parse().ok();
        }
    }

    Some(CompanionProcess {
        pid,
        csrf_token: csrf_token.filter(|t| !t.is_empty())?,
        port: port?,
    })
}

/// First companion process in `ps aux` output.
pub fn find_in_listing(listing: &str) -> Option<CompanionProcess> {
    listing.lines().find_map(parse_process_line)
}

/// Scan the process table. Any failure counts as "not running".
pub async fn find_companion_process() -> Option<CompanionProcess> {
    let output = match tokio::process::Command::new("ps").arg("aux").output().await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(status = %output.status, "ps exited unsuccessfully");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "failed to run ps");
            return None;
        }
    };

    let found = find_in_listing(&String::from_utf8_lossy(&output.stdout));
    debug!(found = found.is_some(), "companion process scan complete");
    found
}
