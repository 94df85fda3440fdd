//! Discovery client
//!
//! Mirrors the store's hash set into mDNS service subtypes and finds peers
//! holding a wanted hash. The external discovery daemon is reached through
//! the [`AvahiBus`] trait — a request/response surface equivalent to Avahi's
//! control API plus its signal stream — which is also the substitution point
//! for tests.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use passim_core::{Error, Result, Sha256Hash, DISCOVERY_TIMEOUT, SERVICE_DOMAIN, SERVICE_TYPE};
use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{browser, resolver};

/// Any address family.
pub const PROTO_UNSPEC: i32 = -1;
/// IPv4 only.
pub const PROTO_INET: i32 = 0;
/// Browse result flag: the record was published by this host.
pub const LOOKUP_RESULT_LOCAL: u32 = 8;

/// One service record produced by a browse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFound {
    pub interface: i32,
    pub protocol: i32,
    pub name: String,
    pub kind: String,
    pub domain: String,
    pub flags: u32,
}

/// Signals delivered by the discovery daemon, tagged with the emitting
/// object's path so concurrent browses and resolves can be told apart.
#[derive(Debug, Clone)]
pub enum AvahiSignal {
    ItemNew { path: String, service: ServiceFound },
    AllForNow { path: String },
    CacheExhausted { path: String },
    Failure { path: String, message: String },
    Found { path: String, host: String, port: u16 },
}

/// Request/response session with the external discovery daemon.
///
/// `subscribe` must deliver signals for an object from the moment its
/// prepare call returns; implementations buffer rather than drop.
#[async_trait]
pub trait AvahiBus: Send + Sync {
    async fn entry_group_new(&self) -> Result<String>;
    async fn entry_group_reset(&self, group: &str) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    async fn entry_group_add_service(
        &self,
        group: &str,
        name: &str,
        kind: &str,
        domain: &str,
        port: u16,
        protocol: i32,
    ) -> Result<()>;
    async fn entry_group_add_subtype(
        &self,
        group: &str,
        name: &str,
        kind: &str,
        domain: &str,
        subtype: &str,
    ) -> Result<()>;
    async fn entry_group_commit(&self, group: &str) -> Result<()>;
    async fn service_browser_prepare(
        &self,
        subtype: &str,
        domain: &str,
        protocol: i32,
    ) -> Result<String>;
    async fn service_resolver_prepare(&self, service: &ServiceFound) -> Result<String>;
    async fn start(&self, path: &str) -> Result<()>;
    async fn free(&self, path: &str) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<AvahiSignal>;
}

/// Race a discovery call against the short daemon-health timeout.
pub(crate) async fn with_timeout<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(DISCOVERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Upstream("discovery daemon timed out".to_string())),
    }
}

/// The subtype label a hash is advertised under.
pub fn subtype_for_hash(hash: &Sha256Hash) -> String {
    format!("_{}._sub.{}", hash.truncated(), SERVICE_TYPE)
}

/// Client side of the discovery daemon session: owns the entry group and the
/// advertised instance name.
pub struct AvahiClient {
    bus: Arc<dyn AvahiBus>,
    name: String,
    port: u16,
    protocol: i32,
    entry_group: Mutex<Option<String>>,
}

impl AvahiClient {
    pub fn new(bus: Arc<dyn AvahiBus>, port: u16, use_ipv6: bool) -> Self {
        let suffix: u16 = rand::thread_rng().gen();
        Self {
            bus,
            name: format!("Passim-{:04X}", suffix),
            port,
            protocol: if use_ipv6 { PROTO_UNSPEC } else { PROTO_INET },
            entry_group: Mutex::new(None),
        }
    }

    /// The advertised instance name, `Passim-XXXX`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Establish the session: create the entry group used by all later
    /// registrations.
    pub async fn connect(&self) -> Result<()> {
        let mut group = self.entry_group.lock().await;
        if group.is_some() {
            return Ok(());
        }
        let path = with_timeout(self.bus.entry_group_new()).await?;
        debug!("connecting to {}", path);
        *group = Some(path);
        Ok(())
    }

    /// Replace the advertised set: reset the entry group, add the base
    /// service, one subtype per hash, and commit. Runs to completion before
    /// the caller may begin the next registration.
    pub async fn register(&self, hashes: &[Sha256Hash]) -> Result<()> {
        let group = self.entry_group.lock().await;
        let group = group
            .as_deref()
            .ok_or_else(|| Error::Upstream("no session with the discovery daemon".to_string()))?;

        debug!("resetting {}", self.name);
        with_timeout(self.bus.entry_group_reset(group)).await?;
        with_timeout(self.bus.entry_group_add_service(
            group,
            &self.name,
            SERVICE_TYPE,
            SERVICE_DOMAIN,
            self.port,
            self.protocol,
        ))
        .await?;
        for hash in hashes {
            let subtype = subtype_for_hash(hash);
            debug!("adding subtype {}", subtype);
            with_timeout(self.bus.entry_group_add_subtype(
                group,
                &self.name,
                SERVICE_TYPE,
                SERVICE_DOMAIN,
                &subtype,
            ))
            .await?;
        }
        with_timeout(self.bus.entry_group_commit(group)).await?;
        Ok(())
    }

    /// Withdraw everything this daemon advertises.
    pub async fn unregister(&self) -> Result<()> {
        let group = self.entry_group.lock().await;
        let group = group
            .as_deref()
            .ok_or_else(|| Error::Upstream("no session with the discovery daemon".to_string()))?;
        with_timeout(self.bus.entry_group_reset(group)).await
    }

    /// Find reachable peers advertising `hash`: browse the subtype, resolve
    /// every non-local record, and return the deduplicated `host:port`
    /// strings. A failed resolve of one candidate does not abort the rest.
    pub async fn find(
        &self,
        hash: &Sha256Hash,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let subtype = subtype_for_hash(hash);
        info!("searching for {}", hash);
        let services =
            browser::browse(self.bus.as_ref(), &subtype, self.protocol, cancel).await?;

        let mut addresses: Vec<String> = Vec::new();
        let mut last_error = None;
        for service in &services {
            match resolver::resolve(self.bus.as_ref(), service, cancel).await {
                Ok(address) => {
                    if addresses.contains(&address) {
                        debug!("already found {}, ignoring", address);
                    } else {
                        debug!("new address {}, adding", address);
                        addresses.push(address);
                    }
                }
                Err(e) => {
                    warn!("failed to resolve {}: {}", service.name, e);
                    last_error = Some(e);
                }
            }
        }
        if addresses.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| Error::Upstream(format!("cannot find {}", hash))));
        }
        Ok(addresses)
    }
}

/// Stand-in transport for hosts where no session with the discovery daemon
/// has been wired up; every request reports the daemon unreachable, which
/// the daemon treats as a survivable upstream condition.
pub struct DisconnectedBus {
    signals: broadcast::Sender<AvahiSignal>,
}

impl DisconnectedBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(1);
        Self { signals }
    }

    fn unreachable<T>() -> Result<T> {
        Err(Error::Upstream(
            "discovery daemon is not reachable".to_string(),
        ))
    }
}

impl Default for DisconnectedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AvahiBus for DisconnectedBus {
    async fn entry_group_new(&self) -> Result<String> {
        Self::unreachable()
    }
    async fn entry_group_reset(&self, _group: &str) -> Result<()> {
        Self::unreachable()
    }
    async fn entry_group_add_service(
        &self,
        _group: &str,
        _name: &str,
        _kind: &str,
        _domain: &str,
        _port: u16,
        _protocol: i32,
    ) -> Result<()> {
        Self::unreachable()
    }
    async fn entry_group_add_subtype(
        &self,
        _group: &str,
        _name: &str,
        _kind: &str,
        _domain: &str,
        _subtype: &str,
    ) -> Result<()> {
        Self::unreachable()
    }
    async fn entry_group_commit(&self, _group: &str) -> Result<()> {
        Self::unreachable()
    }
    async fn service_browser_prepare(
        &self,
        _subtype: &str,
        _domain: &str,
        _protocol: i32,
    ) -> Result<String> {
        Self::unreachable()
    }
    async fn service_resolver_prepare(&self, _service: &ServiceFound) -> Result<String> {
        Self::unreachable()
    }
    async fn start(&self, _path: &str) -> Result<()> {
        Self::unreachable()
    }
    async fn free(&self, _path: &str) -> Result<()> {
        Self::unreachable()
    }
    fn subscribe(&self) -> broadcast::Receiver<AvahiSignal> {
        self.signals.subscribe()
    }
}
