//! Find and force-terminate the processes listening on the debug port.
//!
//! Uses the platform tools (`netstat`/`taskkill` on Windows, `lsof`/`kill`
//! elsewhere). Every failure here is logged and swallowed.

use std::collections::BTreeSet;
use tokio::process::Command;
use tracing::debug;

/// PIDs bound to `port` according to `netstat -ano` output.
///
/// Only rows whose *local* address ends in `:<port>` count, so a client
/// connection to the port from another process is not picked up.
pub fn parse_netstat(output: &str, port: u16) -> BTreeSet<u32> {
    let suffix = format!(":{port}");
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 || !parts[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !parts[1].ends_with(&suffix) {
                return None;
            }
            parts.last()?.parse::<u32>().ok()
        })
        .filter(|pid| *pid != 0)
        .collect()
}

/// PIDs from `lsof -t` output (one per line).
pub fn parse_lsof(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
        .collect()
}

/// Look up the listening processes for `port`.
pub async fn pids_on_port(port: u16) -> BTreeSet<u32> {
    if cfg!(windows) {
        match Command::new("netstat").arg("-ano").output().await {
            Ok(out) => parse_netstat(&String::from_utf8_lossy(&out.stdout), port),
            Err(e) => {
                debug!(error = %e, "netstat unavailable");
                BTreeSet::new()
            }
        }
    } else {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output()
            .await;
        match output {
            Ok(out) => parse_lsof(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                debug!(error = %e, "lsof unavailable");
                BTreeSet::new()
            }
        }
    }
}

/// Force-kill `pid` and its children. Returns whether the kill was accepted.
pub async fn kill_tree(pid: u32) -> bool {
    let pid_arg = pid.to_string();
    if cfg!(windows) {
        return Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid_arg])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
    }

    // Children first so they are not reparented before we see them.
    let _ = Command::new("pkill")
        .args(["-KILL", "-P", &pid_arg])
        .output()
        .await;
    Command::new("kill")
        .args(["-KILL", &pid_arg])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
