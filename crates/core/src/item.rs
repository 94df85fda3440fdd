//! The item model: one cached file plus its sharing policy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Sha256Hash, UNLIMITED};

/// Item flag bits, stored as a u64 so unknown bits survive round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemFlags(pub u64);

impl ItemFlags {
    /// Present in the store but never advertised or served.
    pub const DISABLED: u64 = 1 << 0;
    /// Published now, activated after the next reboot.
    pub const NEXT_REBOOT: u64 = 1 << 1;

    pub fn has(&self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u64) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u64) {
        self.0 &= !flag;
    }

    fn name(flag: u64) -> &'static str {
        match flag {
            Self::DISABLED => "disabled",
            Self::NEXT_REBOOT => "next-reboot",
            _ => "unknown",
        }
    }
}

impl std::fmt::Display for ItemFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("none");
        }
        let mut first = true;
        for bit in 0..64 {
            let flag = 1u64 << bit;
            if self.0 & flag == 0 {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            f.write_str(Self::name(flag))?;
            first = false;
        }
        Ok(())
    }
}

/// Publisher-supplied attributes for a new item.
#[derive(Debug, Clone)]
pub struct ItemAttrs {
    pub basename: String,
    pub max_age: u32,
    pub share_limit: u32,
    pub share_count: u32,
    pub flags: ItemFlags,
}

impl Default for ItemAttrs {
    fn default() -> Self {
        Self {
            basename: String::new(),
            max_age: UNLIMITED,
            share_limit: UNLIMITED,
            share_count: 0,
            flags: ItemFlags::default(),
        }
    }
}

/// One cached file and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Item {
    /// Content digest; primary key within the store.
    pub hash: Sha256Hash,
    /// Name the file is served under. Never contains `/`.
    pub basename: String,
    /// Byte length of the stored content.
    pub size: u64,
    /// Creation time, seconds since the Unix epoch, assigned at publication.
    pub ctime: u64,
    /// Upper bound on age in seconds; `UNLIMITED` means never expire.
    pub max_age: u32,
    /// Upper bound on `share_count`; `UNLIMITED` means no cap.
    pub share_limit: u32,
    /// Completed serves so far.
    pub share_count: u32,
    /// Basename of the publishing process's executable, for provenance.
    pub cmdline: Option<String>,
    pub flags: ItemFlags,
    /// Boot epoch recorded at publish time, only with `NEXT_REBOOT`.
    pub boot_token: Option<String>,
    /// Backing file on disk.
    pub path: PathBuf,
    /// Content type captured when the item was loaded.
    pub content_type: Option<String>,
}

impl Item {
    /// Age in seconds at `now` (seconds since the Unix epoch).
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.ctime)
    }

    /// Whether the age bound has been crossed.
    pub fn expired(&self, now: u64) -> bool {
        self.max_age != UNLIMITED && self.age(now) > u64::from(self.max_age)
    }

    /// Advertised and serveable.
    pub fn enabled(&self) -> bool {
        !self.flags.has(ItemFlags::DISABLED)
    }

    /// Items picked up from a package-contributed directory: no publishing
    /// process and both limits left unbounded.
    pub fn is_contributed(&self) -> bool {
        self.cmdline.is_none() && self.max_age == UNLIMITED && self.share_limit == UNLIMITED
    }

    pub fn to_record(&self) -> ItemRecord {
        ItemRecord {
            filename: self.basename.clone(),
            cmdline: self.cmdline.clone().unwrap_or_default(),
            hash: self.hash.to_hex(),
            max_age: self.max_age,
            flags: self.flags.0,
            share_limit: self.share_limit,
            share_count: self.share_count,
            size: self.size,
        }
    }

    /// Rebuild the publicly readable fields from a record. The backing path,
    /// ctime, and boot token are daemon-private and left empty.
    pub fn from_record(record: &ItemRecord) -> Result<Self> {
        if record.filename.contains('/') {
            return Err(Error::Validation(format!(
                "invalid basename {:?}",
                record.filename
            )));
        }
        Ok(Item {
            hash: Sha256Hash::from_hex(&record.hash)?,
            basename: record.filename.clone(),
            size: record.size,
            ctime: 0,
            max_age: record.max_age,
            share_limit: record.share_limit,
            share_count: record.share_count,
            cmdline: if record.cmdline.is_empty() {
                None
            } else {
                Some(record.cmdline.clone())
            },
            flags: ItemFlags(record.flags),
            boot_token: None,
            path: PathBuf::new(),
            content_type: None,
        })
    }
}

/// Serialized item form used on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub filename: String,
    #[serde(default)]
    pub cmdline: String,
    pub hash: String,
    #[serde(rename = "max-age")]
    pub max_age: u32,
    #[serde(default)]
    pub flags: u64,
    #[serde(rename = "share-limit")]
    pub share_limit: u32,
    #[serde(rename = "share-count", default)]
    pub share_count: u32,
    #[serde(default)]
    pub size: u64,
}
