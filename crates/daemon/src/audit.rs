//! Append-only audit log
//!
//! One line per event: `{timestamp} {TYPE} {key=value,key=value}`. The
//! download-saving counter is rebuilt from `SHARE` lines at startup so the
//! statistic survives restarts.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use passim_core::Result;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// Event type for a publish.
pub const EVENT_PUBLISH: &str = "PBLSH";
/// Event type for a completed serve.
pub const EVENT_SHARE: &str = "SHARE";
/// Event type for an item deletion.
pub const EVENT_DELETE: &str = "DELTE";

pub struct AuditLog {
    logdir: PathBuf,
}

impl AuditLog {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.logdir.join("audit.log")
    }

    /// Append one event line. Key order is preserved.
    pub fn append(&self, kind: &str, pairs: &[(&str, String)]) -> Result<()> {
        std::fs::create_dir_all(&self.logdir)?;
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "-".to_string());
        let args: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let line = format!("{} {} {}\n", timestamp, kind, args.join(","));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Sum the bytes served to remote peers across all recorded `SHARE`
    /// lines. A missing log means zero.
    pub fn restore_download_saving(&self) -> Result<u64> {
        let path = self.log_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut total = 0u64;
        for line in text.lines() {
            let mut sections = line.splitn(3, ' ');
            let _timestamp = sections.next();
            if sections.next() != Some(EVENT_SHARE) {
                continue;
            }
            let Some(args) = sections.next() else {
                continue;
            };
            total += share_line_saving(args);
        }
        debug!("restored download saving of {} bytes from {}", total, path.display());
        Ok(total)
    }
}

/// Bytes one SHARE argument list contributes: the `size=` value, unless the
/// recorded peer address is loopback.
fn share_line_saving(args: &str) -> u64 {
    let mut size = 0u64;
    let mut loopback = false;
    for section in args.split(',') {
        let Some((key, value)) = section.split_once('=') else {
            continue;
        };
        match key {
            "size" => size = value.parse().unwrap_or(0),
            "ipaddr" => {
                loopback = value
                    .parse::<IpAddr>()
                    .map(|addr| addr.is_loopback())
                    .unwrap_or(false);
            }
            _ => {}
        }
    }
    if loopback {
        0
    } else {
        size
    }
}

/// Best-effort logging wrapper shared by the serve and publish paths.
pub fn append_or_warn(audit: &AuditLog, kind: &str, pairs: &[(&str, String)]) {
    if let Err(e) = audit.append(kind, pairs) {
        tracing::warn!("failed to log: {}", e);
    }
}
