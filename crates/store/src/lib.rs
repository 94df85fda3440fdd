//! Passim Store
//!
//! Content-addressed filesystem store for the passim daemon.
//!
//! Layout:
//! ```text
//! <data_dir>/<hash>-<basename>
//! ```
//!
//! Sharing policy travels with the file as extended attributes
//! (`user.max_age`, `user.share_limit`, `user.cmdline`, `user.boot_time`),
//! so a daemon restart rebuilds the full item set from disk alone.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use passim_core::{Error, Item, ItemAttrs, ItemFlags, Result, Sha256Hash, UNLIMITED};
use tracing::{debug, info, warn};

pub mod xattrs;

/// Fallback age bound for owned files missing the xattr: one day.
const FALLBACK_MAX_AGE: u32 = 24 * 60 * 60;

/// Fallback share limit for owned files missing the xattr.
const FALLBACK_SHARE_LIMIT: u32 = 5;

/// In-memory index over the on-disk item set.
pub struct ItemStore {
    data_dir: PathBuf,
    items: HashMap<Sha256Hash, Item>,
}

impl ItemStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            items: HashMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<&Item> {
        self.items.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Sha256Hash) -> Option<&mut Item> {
        self.items.get_mut(hash)
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.items.contains_key(hash)
    }

    /// All items. Iteration order is not meaningful.
    pub fn list(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hashes that should be advertised: everything not disabled.
    pub fn enabled_hashes(&self) -> Vec<Sha256Hash> {
        self.items
            .values()
            .filter(|item| item.enabled())
            .map(|item| item.hash)
            .collect()
    }

    /// Ingest published bytes and persist them under the owned data
    /// directory. The write is atomic: a temp file in the same directory is
    /// persisted into place once fully written.
    pub fn add(
        &mut self,
        bytes: &[u8],
        attrs: &ItemAttrs,
        cmdline: Option<String>,
        now: u64,
        current_boot: Option<&str>,
    ) -> Result<&Item> {
        if attrs.basename.is_empty() || attrs.basename.contains('/') {
            return Err(Error::Validation(format!(
                "invalid basename {:?}",
                attrs.basename
            )));
        }
        if attrs.share_count >= attrs.share_limit {
            return Err(Error::Validation(format!(
                "share count {} >= share-limit {}",
                attrs.share_count, attrs.share_limit
            )));
        }

        let hash = Sha256Hash::from_bytes(bytes);
        if self.items.contains_key(&hash) {
            return Err(Error::AlreadyExists(hash.to_hex()));
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(format!("{}-{}", hash, attrs.basename));
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.data_dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        xattrs::set_u32(&path, xattrs::MAX_AGE, attrs.max_age)?;
        xattrs::set_u32(&path, xattrs::SHARE_LIMIT, attrs.share_limit)?;
        if let Some(ref cmdline) = cmdline {
            xattrs::set_string(&path, xattrs::CMDLINE, cmdline)?;
        }

        let mut flags = attrs.flags;
        let mut boot_token = None;
        if flags.has(ItemFlags::NEXT_REBOOT) {
            if let Some(token) = current_boot {
                xattrs::set_string(&path, xattrs::BOOT_TIME, token)?;
                boot_token = Some(token.to_string());
            }
            // held back until the next boot
            flags.insert(ItemFlags::DISABLED);
        }

        let item = Item {
            hash,
            basename: attrs.basename.clone(),
            size: bytes.len() as u64,
            ctime: now,
            max_age: attrs.max_age,
            share_limit: attrs.share_limit,
            share_count: attrs.share_count,
            cmdline,
            flags,
            boot_token,
            content_type: detect_content_type(&attrs.basename),
            path,
        };
        debug!("added {} as {}", item.hash, item.path.display());
        Ok(self.items.entry(hash).or_insert(item))
    }

    /// Delete the backing file and forget the item. The entry survives a
    /// failed file deletion so the next sweep can retry it.
    pub fn remove(&mut self, hash: &Sha256Hash) -> Result<Item> {
        let item = self
            .items
            .get(hash)
            .ok_or_else(|| Error::NotFound(hash.to_hex()))?;
        match std::fs::remove_file(&item.path) {
            Ok(()) => {}
            // an already-missing backing file does not block the eviction
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to delete {}: {}", item.path.display(), e),
                )))
            }
        }
        let item = self.items.remove(hash).expect("entry checked above");
        debug!("removed {}", item.hash);
        Ok(item)
    }

    /// Rebuild the item set from the owned data directory. Filenames carry
    /// `{hash}-{basename}`, but the hash is always recomputed from the bytes
    /// rather than trusted from the name.
    pub fn scan_owned(&mut self, now: u64, current_boot: Option<&str>) -> Result<()> {
        if !self.data_dir.exists() {
            debug!(
                "not loading resources from {} as it does not exist",
                self.data_dir.display()
            );
            return Ok(());
        }
        debug!("loading resources from {}", self.data_dir.display());
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((_, basename)) = name.split_once('-') else {
                return Err(Error::Validation(format!(
                    "expected {{hash}}-{{filename}} and got {}",
                    name
                )));
            };
            let item = self.load_owned_file(&path, basename, now, current_boot)?;
            self.items.insert(item.hash, item);
        }
        Ok(())
    }

    fn load_owned_file(
        &self,
        path: &Path,
        basename: &str,
        now: u64,
        current_boot: Option<&str>,
    ) -> Result<Item> {
        let bytes = read_nofollow(path)?;
        let hash = Sha256Hash::from_bytes(&bytes);

        let max_age = xattrs::get_u32(path, xattrs::MAX_AGE, FALLBACK_MAX_AGE)?;
        let share_limit = xattrs::get_u32(path, xattrs::SHARE_LIMIT, FALLBACK_SHARE_LIMIT)?;
        let cmdline = xattrs::get_string(path, xattrs::CMDLINE)?.filter(|s| !s.is_empty());

        let mut flags = ItemFlags::default();
        let boot_token = xattrs::get_string(path, xattrs::BOOT_TIME)?;
        if let Some(ref stored) = boot_token {
            flags.insert(ItemFlags::NEXT_REBOOT);
            // still the boot it was published in: keep it held back
            if current_boot == Some(stored.as_str()) {
                flags.insert(ItemFlags::DISABLED);
            }
        }

        Ok(Item {
            hash,
            basename: basename.to_string(),
            size: bytes.len() as u64,
            ctime: file_ctime(path).unwrap_or(now),
            max_age,
            share_limit,
            share_count: 0,
            cmdline,
            flags,
            boot_token,
            content_type: detect_content_type(basename),
            path: path.to_path_buf(),
        })
    }

    /// Rescan the package-contributed directories. Contributed items are
    /// replaced wholesale so the scan is idempotent; their backing files are
    /// read-only and never deleted here.
    pub fn scan_contributed(&mut self, paths: &[PathBuf], now: u64) -> Result<()> {
        let stale: Vec<Sha256Hash> = self
            .items
            .values()
            .filter(|item| item.is_contributed())
            .map(|item| item.hash)
            .collect();
        for hash in stale {
            debug!("removing {} due to rescan", hash);
            self.items.remove(&hash);
        }

        for dir in paths {
            if !dir.exists() {
                debug!(
                    "not loading resources from {} as it does not exist",
                    dir.display()
                );
                continue;
            }
            debug!("scanning {}", dir.display());
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if !entry.file_type()?.is_file() {
                    continue;
                }
                match self.load_contributed_file(&path, now) {
                    Ok(item) => {
                        self.items.insert(item.hash, item);
                    }
                    Err(Error::PermissionDenied(msg)) => {
                        info!("skipping {}: {}", path.display(), msg);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn load_contributed_file(&self, path: &Path, now: u64) -> Result<Item> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let cached = xattrs::get_string(path, xattrs::CHECKSUM_SHA256)?
            .filter(|s| !s.is_empty())
            .and_then(|s| Sha256Hash::from_hex(&s).ok());
        let (hash, size) = match cached {
            Some(hash) => {
                // make sure the file is still openable without following links
                let file = open_nofollow(path)?;
                (hash, file.metadata()?.len())
            }
            None => {
                let bytes = read_nofollow(path)?;
                let hash = Sha256Hash::from_bytes(&bytes);
                // cache for next time; the directory may be read-only
                if let Err(e) = xattrs::set_string(path, xattrs::CHECKSUM_SHA256, &hash.to_hex()) {
                    debug!("cannot cache checksum for {}: {}", path.display(), e);
                }
                (hash, bytes.len() as u64)
            }
        };

        Ok(Item {
            hash,
            basename: basename.clone(),
            size,
            ctime: file_ctime(path).unwrap_or(now),
            max_age: UNLIMITED,
            share_limit: UNLIMITED,
            share_count: 0,
            cmdline: None,
            flags: ItemFlags::default(),
            boot_token: None,
            content_type: detect_content_type(&basename),
            path: path.to_path_buf(),
        })
    }

    /// Evict every item whose age bound has been crossed. Returns the items
    /// that were removed.
    pub fn sweep(&mut self, now: u64) -> Vec<Item> {
        debug!("checking for max-age");
        let expired: Vec<Sha256Hash> = self
            .items
            .values()
            .filter(|item| item.expired(now))
            .map(|item| item.hash)
            .collect();
        let mut evicted = Vec::new();
        for hash in expired {
            match self.remove(&hash) {
                Ok(item) => {
                    debug!("deleting {} [{}] as max-age reached", hash, item.basename);
                    evicted.push(item);
                }
                Err(e) => warn!("failed to evict {}: {}", hash, e),
            }
        }
        evicted
    }
}

/// Open a file refusing to follow symlinks. A symlink is a permission
/// problem, not an I/O failure.
pub fn open_nofollow(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ELOOP) {
                Error::PermissionDenied(format!("skipping symlink {}", path.display()))
            } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(e.to_string())
            } else {
                Error::Io(e)
            }
        })
}

fn read_nofollow(path: &Path) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut file = open_nofollow(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn file_ctime(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

/// Best-effort content-type probe from the basename, captured once at item
/// load so serving never has to stat the file again.
pub fn detect_content_type(basename: &str) -> Option<String> {
    let ext = basename.rsplit_once('.').map(|(_, ext)| ext)?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "bin" | "cab" | "dat" => "application/octet-stream",
        "bz2" => "application/x-bzip2",
        "css" => "text/css",
        "gz" => "application/gzip",
        "html" | "htm" => "text/html",
        "ico" => "image/vnd.microsoft.icon",
        "jcat" => "application/json",
        "json" => "application/json",
        "md" | "txt" => "text/plain",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "xml" => "text/xml",
        "xz" => "application/x-xz",
        "zst" => "application/zstd",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ItemStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ItemStore::new(dir.path().join("data"));
        (dir, store)
    }

    fn default_attrs(basename: &str) -> ItemAttrs {
        ItemAttrs {
            basename: basename.to_string(),
            max_age: 86_400,
            share_limit: 5,
            share_count: 0,
            flags: ItemFlags::default(),
        }
    }

    #[test]
    fn test_add_and_get() {
        let (_dir, mut store) = test_store();
        let item = store
            .add(b"hello world\n", &default_attrs("HELLO.md"), Some("tester".into()), 100, None)
            .unwrap();
        assert_eq!(
            item.hash.to_hex(),
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
        assert_eq!(item.size, 12);
        assert_eq!(item.ctime, 100);
        let hash = item.hash;
        let path = item.path.clone();

        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("-HELLO.md"));
        assert_eq!(store.get(&hash).unwrap().basename, "HELLO.md");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let (_dir, mut store) = test_store();
        store
            .add(b"same bytes", &default_attrs("a.bin"), None, 0, None)
            .unwrap();
        let err = store
            .add(b"same bytes", &default_attrs("b.bin"), None, 0, None)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_add_validates_basename() {
        let (_dir, mut store) = test_store();
        let err = store
            .add(b"x", &default_attrs("../etc/passwd"), None, 0, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = store.add(b"x", &default_attrs(""), None, 0, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_add_validates_share_counts() {
        let (_dir, mut store) = test_store();
        let mut attrs = default_attrs("x.bin");
        attrs.share_count = 5;
        attrs.share_limit = 5;
        let err = store.add(b"x", &attrs, None, 0, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_remove_deletes_backing_file() {
        let (_dir, mut store) = test_store();
        let item = store
            .add(b"to be removed", &default_attrs("x.bin"), None, 0, None)
            .unwrap();
        let hash = item.hash;
        let path = item.path.clone();

        store.remove(&hash).unwrap();
        assert!(!path.exists());
        assert!(store.get(&hash).is_none());
        assert!(matches!(store.remove(&hash), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_scan_owned_recomputes_hash() {
        let (_dir, mut store) = test_store();
        let data_dir = store.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir).unwrap();
        // filename lies about the hash; the bytes win
        std::fs::write(data_dir.join(format!("{}-lied.bin", "0".repeat(64))), b"truth").unwrap();

        store.scan_owned(50, None).unwrap();
        assert_eq!(store.len(), 1);
        let item = store.list().next().unwrap();
        assert_eq!(item.hash, Sha256Hash::from_bytes(b"truth"));
        assert_eq!(item.basename, "lied.bin");
        // xattr fallbacks
        assert_eq!(item.max_age, 86_400);
        assert_eq!(item.share_limit, 5);
        assert_eq!(item.cmdline, None);
    }

    #[test]
    fn test_scan_owned_rejects_unsplittable_names() {
        let (_dir, mut store) = test_store();
        let data_dir = store.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("nodash"), b"x").unwrap();
        assert!(matches!(store.scan_owned(0, None), Err(Error::Validation(_))));
    }

    #[test]
    fn test_scan_owned_refuses_symlinks() {
        let (_dir, mut store) = test_store();
        let data_dir = store.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir).unwrap();
        let target = data_dir.join(format!("{}-real.bin", "1".repeat(64)));
        std::fs::write(&target, b"real").unwrap();
        std::os::unix::fs::symlink(&target, data_dir.join(format!("{}-link.bin", "2".repeat(64))))
            .unwrap();
        assert!(matches!(
            store.scan_owned(0, None),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_next_reboot_activation() {
        let (_dir, mut store) = test_store();
        let mut attrs = default_attrs("staged.bin");
        attrs.flags.insert(ItemFlags::NEXT_REBOOT);
        let item = store
            .add(b"staged", &attrs, Some("tester".into()), 0, Some("boot-1"))
            .unwrap();
        // held back in the boot it was published in
        assert!(item.flags.has(ItemFlags::DISABLED));
        assert_eq!(item.boot_token.as_deref(), Some("boot-1"));

        // same boot: still disabled after a rescan
        let mut rescan = ItemStore::new(store.data_dir());
        rescan.scan_owned(0, Some("boot-1")).unwrap();
        let reloaded = rescan.list().next().unwrap();
        if reloaded.boot_token.is_some() {
            assert!(reloaded.flags.has(ItemFlags::DISABLED));
            assert!(reloaded.flags.has(ItemFlags::NEXT_REBOOT));
        }

        // a different boot token activates the item
        let mut rebooted = ItemStore::new(store.data_dir());
        rebooted.scan_owned(0, Some("boot-2")).unwrap();
        let reloaded = rebooted.list().next().unwrap();
        if reloaded.boot_token.is_some() {
            assert!(!reloaded.flags.has(ItemFlags::DISABLED));
            assert!(reloaded.flags.has(ItemFlags::NEXT_REBOOT));
        }
    }

    #[test]
    fn test_scan_contributed_unlimited_and_idempotent() {
        let (dir, mut store) = test_store();
        let contrib = dir.path().join("contrib");
        std::fs::create_dir_all(&contrib).unwrap();
        std::fs::write(contrib.join("vendor.bin"), b"vendor bytes").unwrap();

        let paths = vec![contrib.clone()];
        store.scan_contributed(&paths, 10).unwrap();
        assert_eq!(store.len(), 1);
        let item = store.list().next().unwrap();
        assert_eq!(item.max_age, UNLIMITED);
        assert_eq!(item.share_limit, UNLIMITED);
        assert_eq!(item.cmdline, None);
        assert!(item.is_contributed());
        let first_hash = item.hash;

        // rescanning does not duplicate
        store.scan_contributed(&paths, 20).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.list().next().unwrap().hash, first_hash);

        // removing the source file drops the item on rescan
        std::fs::remove_file(contrib.join("vendor.bin")).unwrap();
        store.scan_contributed(&paths, 30).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_contributed_skips_symlinks() {
        let (dir, mut store) = test_store();
        let contrib = dir.path().join("contrib");
        std::fs::create_dir_all(&contrib).unwrap();
        std::fs::write(contrib.join("ok.bin"), b"fine").unwrap();
        std::os::unix::fs::symlink(contrib.join("ok.bin"), contrib.join("link.bin")).unwrap();

        store.scan_contributed(&[contrib], 0).unwrap();
        // the symlink is skipped, not fatal
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_expired_only() {
        let (_dir, mut store) = test_store();
        let mut short = default_attrs("short.bin");
        short.max_age = 10;
        let mut long = default_attrs("long.bin");
        long.max_age = UNLIMITED;

        let short_hash = store.add(b"short", &short, None, 100, None).unwrap().hash;
        let long_hash = store.add(b"long", &long, None, 100, None).unwrap().hash;

        assert!(store.sweep(105).is_empty());
        let evicted = store.sweep(200);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].hash, short_hash);
        assert!(store.get(&short_hash).is_none());
        assert!(store.get(&long_hash).is_some());
    }

    #[test]
    fn test_enabled_hashes_excludes_disabled() {
        let (_dir, mut store) = test_store();
        let mut attrs = default_attrs("hidden.bin");
        attrs.flags.insert(ItemFlags::DISABLED);
        store.add(b"hidden", &attrs, None, 0, None).unwrap();
        let visible = store
            .add(b"visible", &default_attrs("visible.bin"), None, 0, None)
            .unwrap()
            .hash;
        assert_eq!(store.enabled_hashes(), vec![visible]);
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("a.md").as_deref(), Some("text/plain"));
        assert_eq!(detect_content_type("style.css").as_deref(), Some("text/css"));
        assert_eq!(detect_content_type("no-extension"), None);
    }
}
