//! Extended-attribute helpers for item metadata.
//!
//! Numeric attributes are stored as raw native-endian u32, string attributes
//! as UTF-8 bytes. A missing attribute is not an error; callers supply the
//! fallback.

use std::io;
use std::path::Path;

use passim_core::{Error, Result};

/// Attribute holding the age bound in seconds.
pub const MAX_AGE: &str = "user.max_age";
/// Attribute holding the share limit.
pub const SHARE_LIMIT: &str = "user.share_limit";
/// Attribute holding the publisher's executable basename.
pub const CMDLINE: &str = "user.cmdline";
/// Attribute holding the boot epoch recorded at publish time.
pub const BOOT_TIME: &str = "user.boot_time";
/// Attribute caching the content hash of a contributed file.
pub const CHECKSUM_SHA256: &str = "user.checksum.sha256";

fn get_err(path: &Path, name: &str, err: io::Error) -> Error {
    Error::Io(io::Error::new(
        err.kind(),
        format!("failed to get {} on {}: {}", name, path.display(), err),
    ))
}

fn set_err(path: &Path, name: &str, err: io::Error) -> Error {
    Error::Io(io::Error::new(
        err.kind(),
        format!("failed to set {} on {}: {}", name, path.display(), err),
    ))
}

pub fn get_u32(path: &Path, name: &str, fallback: u32) -> Result<u32> {
    match xattr::get(path, name).map_err(|e| get_err(path, name, e))? {
        Some(buf) => {
            let bytes: [u8; 4] = buf.as_slice().try_into().map_err(|_| {
                Error::Validation(format!("invalid data for {} on {}", name, path.display()))
            })?;
            Ok(u32::from_ne_bytes(bytes))
        }
        None => Ok(fallback),
    }
}

pub fn set_u32(path: &Path, name: &str, value: u32) -> Result<()> {
    xattr::set(path, name, &value.to_ne_bytes()).map_err(|e| set_err(path, name, e))
}

pub fn get_string(path: &Path, name: &str) -> Result<Option<String>> {
    match xattr::get(path, name).map_err(|e| get_err(path, name, e))? {
        Some(buf) => {
            let s = String::from_utf8(buf).map_err(|_| {
                Error::Validation(format!("invalid data for {} on {}", name, path.display()))
            })?;
            Ok(Some(s))
        }
        None => Ok(None),
    }
}

pub fn set_string(path: &Path, name: &str, value: &str) -> Result<()> {
    xattr::set(path, name, value.as_bytes()).map_err(|e| set_err(path, name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xattrs_supported(dir: &Path) -> bool {
        let probe = dir.join("xattr-probe");
        std::fs::write(&probe, b"x").unwrap();
        xattr::set(&probe, "user.probe", b"1").is_ok()
    }

    #[test]
    fn test_u32_roundtrip_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let path = dir.path().join("file");
        std::fs::write(&path, b"data").unwrap();

        assert_eq!(get_u32(&path, MAX_AGE, 86_400).unwrap(), 86_400);
        set_u32(&path, MAX_AGE, 3_600).unwrap();
        assert_eq!(get_u32(&path, MAX_AGE, 86_400).unwrap(), 3_600);
    }

    #[test]
    fn test_string_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let path = dir.path().join("file");
        std::fs::write(&path, b"data").unwrap();

        assert_eq!(get_string(&path, CMDLINE).unwrap(), None);
        set_string(&path, CMDLINE, "fwupd").unwrap();
        assert_eq!(get_string(&path, CMDLINE).unwrap().as_deref(), Some("fwupd"));
    }
}
