//! Daemon configuration
//!
//! Loaded from the key-file at `{sysconfdir}/passim.conf`, group `[daemon]`.
//! Package-contributed directories are named by `{sysconfdir}/passim.d/*.conf`
//! key-files, each carrying `[passim] Path=...`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use passim_core::{Error, Result, DEFAULT_CARBON_COST, DEFAULT_MAX_ITEM_SIZE, DEFAULT_PORT};
use tracing::debug;

const CONFIG_GROUP: &str = "daemon";
const CONTRIB_GROUP: &str = "passim";

/// Runtime configuration for one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTPS listen port.
    pub port: u16,
    /// Owned data directory; the only writable shared resource.
    pub path: PathBuf,
    /// Per-publish byte cap.
    pub max_item_size: u64,
    /// kg CO₂e per GB served, for the carbon-saving counter.
    pub carbon_cost: f64,
    /// Advertise over IPv6 in addition to IPv4.
    pub use_ipv6: bool,
    /// Directory holding `passim.conf` and `passim.d/`.
    pub sysconfdir: PathBuf,
    /// State directory for TLS material.
    pub statedir: PathBuf,
    /// Install data directory for the static index assets.
    pub datadir: PathBuf,
    /// Audit log directory.
    pub logdir: PathBuf,
    /// Control-plane socket path.
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let statedir = PathBuf::from("/var/lib/passim");
        Self {
            port: DEFAULT_PORT,
            path: statedir.join("data"),
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            carbon_cost: DEFAULT_CARBON_COST,
            use_ipv6: false,
            sysconfdir: PathBuf::from("/etc"),
            statedir,
            datadir: PathBuf::from("/usr/share/passim"),
            logdir: default_logdir(),
            socket_path: default_socket_path(),
        }
    }
}

fn default_logdir() -> PathBuf {
    if let Ok(dir) = std::env::var("LOGS_DIRECTORY") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/log/passim")
}

fn default_socket_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("passim.sock");
    }
    PathBuf::from("/tmp/passim.sock")
}

impl DaemonConfig {
    /// Load from an explicit key-file path, or the default location. A
    /// missing file means defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.sysconfdir.join("passim.conf"));
        if !path.exists() {
            debug!("not loading {} as it does not exist", path.display());
            return Ok(config);
        }
        let text = std::fs::read_to_string(&path)?;
        let keyfile = parse_keyfile(&text);
        config.apply(&keyfile)?;
        Ok(config)
    }

    fn apply(&mut self, keyfile: &Keyfile) -> Result<()> {
        if let Some(v) = keyfile.get(CONFIG_GROUP, "Port") {
            self.port = v
                .parse()
                .map_err(|_| Error::Validation(format!("invalid Port value {:?}", v)))?;
        }
        if let Some(v) = keyfile.get(CONFIG_GROUP, "Path") {
            self.path = PathBuf::from(v);
        }
        if let Some(v) = keyfile.get(CONFIG_GROUP, "MaxItemSize") {
            self.max_item_size = v
                .parse()
                .map_err(|_| Error::Validation(format!("invalid MaxItemSize value {:?}", v)))?;
        }
        if let Some(v) = keyfile.get(CONFIG_GROUP, "CarbonCost") {
            self.carbon_cost = v
                .parse()
                .map_err(|_| Error::Validation(format!("invalid CarbonCost value {:?}", v)))?;
        }
        if let Some(v) = keyfile.get(CONFIG_GROUP, "IPv6") {
            self.use_ipv6 = parse_bool(v)
                .ok_or_else(|| Error::Validation(format!("invalid IPv6 value {:?}", v)))?;
        }
        Ok(())
    }

    /// The directory watched for contributed config changes.
    pub fn contributed_conf_dir(&self) -> PathBuf {
        self.sysconfdir.join("passim.d")
    }

    /// Directories named by `passim.d/*.conf` files, to be scanned for
    /// contributed items.
    pub fn contributed_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.contributed_conf_dir();
        let mut paths = Vec::new();
        if !dir.exists() {
            debug!("not loading {} as it does not exist", dir.display());
            return Ok(paths);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let keyfile = parse_keyfile(&text);
            let value = keyfile.get(CONTRIB_GROUP, "Path").ok_or_else(|| {
                Error::Validation(format!("{} has no [passim] Path key", path.display()))
            })?;
            paths.push(PathBuf::from(value));
        }
        Ok(paths)
    }

    /// The URI the HTTPS server is reachable under from this host.
    pub fn uri(&self) -> String {
        format!("https://localhost:{}/", self.port)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

struct Keyfile(HashMap<String, HashMap<String, String>>);

impl Keyfile {
    fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.0.get(group)?.get(key).map(String::as_str)
    }
}

fn parse_keyfile(text: &str) -> Keyfile {
    let mut groups: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(group) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = group.to_string();
            groups.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            groups
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Keyfile(groups)
}
