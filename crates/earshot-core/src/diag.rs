//! Local process/port diagnostics backing the `/api/diagnostics` endpoint.

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

/// Result of a liveness probe against a local broker process.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyHealth {
    /// healthy | degraded | unhealthy
    pub status: String,
    pub pid: Option<i32>,
    pub pid_alive: bool,
    pub port_open: bool,
    pub uptime_seconds: Option<u64>,
    pub uptime: Option<String>,
    pub address: String,
    pub details: String,
}

/// Probe the process recorded in `pid_file` and the TCP `address`.
///
/// `status` is `healthy` iff the PID is alive and the port accepts
/// connections, `degraded` when exactly one holds, `unhealthy` otherwise.
pub fn proxy_health(address: &str, pid_file: &Path) -> ProxyHealth {
    let pid = read_pid_file(pid_file);
    let alive = pid.map(pid_alive).unwrap_or(false);
    let open = port_open(address);

    let uptime_seconds = if alive {
        pid.and_then(process_uptime_secs)
            .or_else(|| pid_file_age_secs(pid_file))
    } else {
        None
    };

    let status = match (alive, open) {
        (true, true) => "healthy",
        (false, false) => "unhealthy",
        _ => "degraded",
    };

    let details = match (alive, open) {
        (true, true) => "process alive, port reachable".to_string(),
        (true, false) => format!("process alive but {address} not reachable"),
        (false, true) => format!("{address} reachable but recorded process is gone"),
        (false, false) => "process gone and port unreachable".to_string(),
    };

    ProxyHealth {
        status: status.to_string(),
        pid,
        pid_alive: alive,
        port_open: open,
        uptime_seconds,
        uptime: uptime_seconds.map(humanize_secs),
        address: address.to_string(),
        details,
    }
}

/// Local machine hostname (empty string when unavailable).
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Signal-0 liveness check.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) probes existence without sending a signal. EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

fn port_open(address: &str) -> bool {
    let addr: SocketAddr = match address.parse() {
        Ok(a) => a,
        Err(_) => return false,
    };
    TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok()
}

/// Uptime from /proc: (now - boot_time) - starttime/HZ. Negative results
/// (clock skew) are suppressed.
fn process_uptime_secs(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 22 (1-based) is starttime in clock ticks; fields 2 can contain
    // spaces inside parentheses, so split after the closing paren.
    let after_comm = stat.rsplit_once(')')?.1;
    let starttime_ticks: u64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let uptime_file = std::fs::read_to_string("/proc/uptime").ok()?;
    let system_uptime: f64 = uptime_file.split_whitespace().next()?.parse().ok()?;

    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    let started_secs_after_boot = starttime_ticks as f64 / hz as f64;
    let uptime = system_uptime - started_secs_after_boot;
    if uptime < 0.0 {
        None
    } else {
        Some(uptime as u64)
    }
}

/// Fallback: age of the PID file itself.
fn pid_file_age_secs(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = std::time::SystemTime::now().duration_since(modified).ok()?;
    Some(age.as_secs())
}

fn humanize_secs(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
