//! Passim Core
//!
//! Shared primitives for the passim LAN cache daemon: content hashes,
//! the item model, daemon status, and the common error type.

pub mod item;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use item::{Item, ItemAttrs, ItemFlags, ItemRecord};

/// mDNS service type the daemon registers and browses.
pub const SERVICE_TYPE: &str = "_cache._tcp";

/// mDNS domain; the empty string means "the default domain" (.local).
pub const SERVICE_DOMAIN: &str = "";

/// Timeout for every call to the external discovery daemon.
pub const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(150);

/// Default HTTPS listen port.
pub const DEFAULT_PORT: u16 = 27500;

/// Default per-publish byte cap (100 MiB).
pub const DEFAULT_MAX_ITEM_SIZE: u64 = 104_857_600;

/// Default carbon cost in kg CO₂e per GB served.
pub const DEFAULT_CARBON_COST: f64 = 0.026367;

/// Sentinel meaning "no limit" for max-age and share-limit.
pub const UNLIMITED: u32 = u32::MAX;

/// Content hash — SHA-256 over the exact stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    /// Compute the hash of a byte buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut id = [0u8; 32];
        id.copy_from_slice(&hash);
        Self(id)
    }

    /// Hex form: 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex. Uppercase input is accepted and folded to lowercase.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(Error::Validation(format!(
                "expected 64 hex characters, got {} bytes",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::Validation(e.to_string()))?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }

    /// Whether a query value even looks like a hash: 64 ASCII hex chars.
    pub fn is_well_formed(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// The hex form truncated to 60 characters, the longest token that fits
    /// in a single DNS-SD subtype label.
    pub fn truncated(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(60);
        hex
    }
}

impl std::fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Observable daemon status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Starting,
    Loading,
    Running,
    DisabledMetered,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Loading => "loading",
            Status::Running => "running",
            Status::DisabledMetered => "disabled-metered",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason phrases for every status code the daemon can emit. The phrase text
/// is observable in response bodies, so it lives here rather than being
/// borrowed from whatever HTTP library is in use.
pub fn status_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        303 => "See Other",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        406 => "Not Acceptable",
        423 => "Locked",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        _ => "Unknown",
    }
}

/// Read the boot epoch token: the value of the `btime` line in /proc/stat.
/// Opaque to callers; two equal tokens mean "same boot".
pub fn boot_token() -> Option<String> {
    let buf = std::fs::read_to_string("/proc/stat").ok()?;
    parse_boot_token(&buf)
}

fn parse_boot_token(stat: &str) -> Option<String> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .map(|v| v.trim().to_string())
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("discovery daemon error: {0}")]
    Upstream(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable kind string for the control plane.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::PermissionDenied(_) => "permission-denied",
            Error::AlreadyExists(_) => "already-exists",
            Error::NotFound(_) => "not-found",
            Error::QuotaExceeded(_) => "quota-exceeded",
            Error::Upstream(_) => "upstream",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
