//! Shared test fixtures: a scripted discovery-daemon double and a daemon
//! state builder wired to temp directories.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use passim_core::{ItemAttrs, ItemFlags, Result, Sha256Hash};
use passim_daemon::avahi::{AvahiBus, AvahiSignal, ServiceFound};
use passim_daemon::config::DaemonConfig;
use passim_daemon::service::{unix_now, DaemonCommand, ServerState, SharedState};
use tokio::sync::{broadcast, mpsc, watch};
use tower::ServiceExt;

/// Scripted stand-in for the external discovery daemon.
///
/// A browse started against it replays `services` as `ItemNew` signals and
/// terminates with `AllForNow`; a resolve replays the address scripted for
/// the service name. Every remote call is recorded for assertions.
pub struct FakeAvahi {
    signals: broadcast::Sender<AvahiSignal>,
    counter: AtomicUsize,
    pub state: Mutex<FakeState>,
}

#[derive(Default)]
pub struct FakeState {
    /// Records replayed to browsers.
    pub services: Vec<ServiceFound>,
    /// Service name → resolved (host, port).
    pub addresses: HashMap<String, (String, u16)>,
    /// Service names whose resolver should signal Failure.
    pub failing_resolves: Vec<String>,
    /// Message replayed as a browse Failure instead of results.
    pub browse_failure: Option<String>,
    /// Emit nothing on start, leaving callers waiting.
    pub silent: bool,
    /// Deliver resolver signals during prepare, before Start returns.
    pub resolve_before_start: bool,
    /// Resolver object path → service name.
    pub resolvers: HashMap<String, String>,
    /// Current (uncommitted) entry-group content.
    pub entries: Vec<String>,
    /// Every committed entry-group snapshot.
    pub committed: Vec<Vec<String>>,
    /// Paths passed to Free.
    pub freed: Vec<String>,
}

impl FakeAvahi {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            signals,
            counter: AtomicUsize::new(0),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn add_peer(&self, name: &str, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.services.push(service(name, 0));
        state.addresses.insert(name.to_string(), (host.to_string(), port));
    }

    fn next_path(&self, prefix: &str) -> String {
        format!("/{}/{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn emit_resolver_signals(&self, path: &str) {
        let state = self.state.lock().unwrap();
        let Some(name) = state.resolvers.get(path) else {
            return;
        };
        if state.failing_resolves.contains(name) {
            let _ = self.signals.send(AvahiSignal::Failure {
                path: path.to_string(),
                message: format!("cannot resolve {}", name),
            });
            return;
        }
        if let Some((host, port)) = state.addresses.get(name) {
            let _ = self.signals.send(AvahiSignal::Found {
                path: path.to_string(),
                host: host.clone(),
                port: *port,
            });
        }
    }
}

pub fn service(name: &str, flags: u32) -> ServiceFound {
    ServiceFound {
        interface: 2,
        protocol: 0,
        name: name.to_string(),
        kind: "_cache._tcp".to_string(),
        domain: "local".to_string(),
        flags,
    }
}

#[async_trait]
impl AvahiBus for FakeAvahi {
    async fn entry_group_new(&self) -> Result<String> {
        Ok(self.next_path("entrygroup"))
    }

    async fn entry_group_reset(&self, _group: &str) -> Result<()> {
        self.state.lock().unwrap().entries.clear();
        Ok(())
    }

    async fn entry_group_add_service(
        &self,
        _group: &str,
        name: &str,
        kind: &str,
        _domain: &str,
        port: u16,
        _protocol: i32,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .entries
            .push(format!("service:{}:{}:{}", name, kind, port));
        Ok(())
    }

    async fn entry_group_add_subtype(
        &self,
        _group: &str,
        _name: &str,
        _kind: &str,
        _domain: &str,
        subtype: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .entries
            .push(format!("subtype:{}", subtype));
        Ok(())
    }

    async fn entry_group_commit(&self, _group: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snapshot = state.entries.clone();
        state.committed.push(snapshot);
        Ok(())
    }

    async fn service_browser_prepare(
        &self,
        _subtype: &str,
        _domain: &str,
        _protocol: i32,
    ) -> Result<String> {
        Ok(self.next_path("browser"))
    }

    async fn service_resolver_prepare(&self, service: &ServiceFound) -> Result<String> {
        let path = self.next_path("resolver");
        let before_start = {
            let mut state = self.state.lock().unwrap();
            state.resolvers.insert(path.clone(), service.name.clone());
            state.resolve_before_start
        };
        if before_start {
            self.emit_resolver_signals(&path);
        }
        Ok(path)
    }

    async fn start(&self, path: &str) -> Result<()> {
        if path.starts_with("/browser/") {
            let (services, failure, silent) = {
                let state = self.state.lock().unwrap();
                (
                    state.services.clone(),
                    state.browse_failure.clone(),
                    state.silent,
                )
            };
            if silent {
                return Ok(());
            }
            if let Some(message) = failure {
                let _ = self.signals.send(AvahiSignal::Failure {
                    path: path.to_string(),
                    message,
                });
                return Ok(());
            }
            // traffic for other objects must be ignored by every browse
            let _ = self.signals.send(AvahiSignal::AllForNow {
                path: "/browser/someone-else".to_string(),
            });
            for service in services {
                let _ = self.signals.send(AvahiSignal::ItemNew {
                    path: path.to_string(),
                    service,
                });
            }
            let _ = self.signals.send(AvahiSignal::CacheExhausted {
                path: path.to_string(),
            });
            let _ = self.signals.send(AvahiSignal::AllForNow {
                path: path.to_string(),
            });
            return Ok(());
        }
        let (before_start, silent) = {
            let state = self.state.lock().unwrap();
            (state.resolve_before_start, state.silent)
        };
        if !before_start && !silent {
            self.emit_resolver_signals(path);
        }
        Ok(())
    }

    async fn free(&self, path: &str) -> Result<()> {
        self.state.lock().unwrap().freed.push(path.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AvahiSignal> {
        self.signals.subscribe()
    }
}

/// A daemon state wired to temp directories and the fake discovery daemon.
pub struct TestDaemon {
    pub dir: tempfile::TempDir,
    pub state: SharedState,
    pub avahi: Arc<FakeAvahi>,
    pub commands: mpsc::UnboundedReceiver<DaemonCommand>,
    pub metered: watch::Sender<bool>,
}

pub fn test_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        path: dir.path().join("data"),
        sysconfdir: dir.path().join("etc"),
        statedir: dir.path().join("state"),
        datadir: dir.path().join("share"),
        logdir: dir.path().join("log"),
        socket_path: dir.path().join("passim.sock"),
        ..DaemonConfig::default()
    };
    let avahi = Arc::new(FakeAvahi::new());
    let (command_tx, commands) = mpsc::unbounded_channel();
    let (metered, metered_rx) = watch::channel(false);
    let state = ServerState::new(config, avahi.clone(), command_tx, metered_rx);
    TestDaemon {
        dir,
        state,
        avahi,
        commands,
        metered,
    }
}

/// Store a file as if it had been published.
pub async fn publish_bytes(
    state: &ServerState,
    bytes: &[u8],
    basename: &str,
    max_age: u32,
    share_limit: u32,
    flags: u64,
) -> Sha256Hash {
    let attrs = ItemAttrs {
        basename: basename.to_string(),
        max_age,
        share_limit,
        share_count: 0,
        flags: ItemFlags(flags),
    };
    let mut store = state.store.lock().await;
    store
        .add(bytes, &attrs, Some("tester".to_string()), unix_now(), None)
        .map(|item| item.hash)
        .unwrap()
}

pub const LOOPBACK: &str = "127.0.0.1:40000";
pub const REMOTE: &str = "10.0.0.9:40000";

/// Drive one request through the router with a synthetic peer address.
pub async fn request(router: &Router, method: Method, uri: &str, peer: &str) -> Response {
    let peer: SocketAddr = peer.parse().unwrap();
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer));
    router.clone().oneshot(req).await.unwrap()
}

pub async fn body_text(response: Response) -> String {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}
