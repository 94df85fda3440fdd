//! Daemon service
//!
//! Owns all long-lived state and runs the cooperative event loop: the HTTPS
//! server, the control-plane socket, the linearized re-registration queue,
//! the hourly age sweep, the contributed-config watcher, and the
//! metered-network listener.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use notify::RecommendedWatcher;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use passim_core::{Error, Result, Status};
use passim_store::ItemStore;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditLog};
use crate::avahi::{AvahiBus, AvahiClient};
use crate::config::DaemonConfig;
use crate::control;
use crate::events::{event_channel, DaemonEvent, EventSender};
use crate::http;
use crate::metered::NetworkMonitor;
use crate::tls;

/// Debounce window for contributed-config change storms.
const RESCAN_DEBOUNCE: Duration = Duration::from_millis(500);

/// Cadence of the age sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Delay before a `--timed-exit` daemon quits, for test harnesses.
const TIMED_EXIT_DELAY: Duration = Duration::from_secs(10);

/// Work items processed one at a time by the command loop, so that
/// re-registrations are linearized rather than interleaved.
#[derive(Debug)]
pub enum DaemonCommand {
    Reregister,
    RescanContributed,
}

/// Everything long-lived, parameterized into every handler.
pub struct ServerState {
    pub config: DaemonConfig,
    pub store: Mutex<ItemStore>,
    pub avahi: AvahiClient,
    pub status: Mutex<Status>,
    pub download_saving: AtomicU64,
    pub audit: AuditLog,
    pub events: EventSender,
    pub commands: mpsc::UnboundedSender<DaemonCommand>,
    pub metered: watch::Receiver<bool>,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(
        config: DaemonConfig,
        bus: Arc<dyn AvahiBus>,
        commands: mpsc::UnboundedSender<DaemonCommand>,
        metered: watch::Receiver<bool>,
    ) -> SharedState {
        let (events, _) = event_channel(64);
        Arc::new(Self {
            store: Mutex::new(ItemStore::new(&config.path)),
            avahi: AvahiClient::new(bus, config.port, config.use_ipv6),
            status: Mutex::new(Status::Starting),
            download_saving: AtomicU64::new(0),
            audit: AuditLog::new(&config.logdir),
            events,
            commands,
            metered,
            config,
        })
    }

    pub async fn status(&self) -> Status {
        *self.status.lock().await
    }

    pub async fn set_status(&self, status: Status) {
        let mut current = self.status.lock().await;
        if *current == status {
            return;
        }
        *current = status;
        debug!("emitting status change to {}", status);
        let _ = self.events.send(DaemonEvent::StatusChanged { status });
        let _ = self.events.send(DaemonEvent::Changed);
    }

    /// Announce that the item set changed.
    pub fn notify_changed(&self) {
        let _ = self.events.send(DaemonEvent::Changed);
    }

    /// Queue a re-registration; queued requests run in order, one at a time.
    pub fn request_reregister(&self) {
        let _ = self.commands.send(DaemonCommand::Reregister);
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run the daemon until SIGINT, a fatal startup error, or the timed exit.
pub async fn run_daemon(
    config: DaemonConfig,
    bus: Arc<dyn AvahiBus>,
    timed_exit: bool,
) -> Result<()> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (network, metered_rx) = NetworkMonitor::new();
    let state = ServerState::new(config, bus, command_tx.clone(), metered_rx);

    // load everything we already hold
    let now = unix_now();
    let boot = passim_core::boot_token();
    {
        let mut store = state.store.lock().await;
        store.scan_owned(now, boot.as_deref())?;
        let contributed = state.config.contributed_paths()?;
        store.scan_contributed(&contributed, now)?;
        for item in store.sweep(now) {
            audit::append_or_warn(
                &state.audit,
                audit::EVENT_DELETE,
                &[
                    ("hash", item.hash.to_hex()),
                    ("basename", item.basename.clone()),
                ],
            );
        }
        info!("loaded {} items", store.len());
    }
    match state.audit.restore_download_saving() {
        Ok(saving) => state.download_saving.store(saving, Ordering::Relaxed),
        Err(e) => warn!("failed to read log: {}", e),
    }

    // the discovery daemon being down is survivable; registration retries
    // on the next trigger
    if let Err(e) = state.avahi.connect().await {
        warn!("failed to contact discovery daemon: {}", e);
    }

    // HTTPS server; failure to bind is fatal
    let (cert_path, key_path) = tls::load_or_generate(&state.config.statedir)?;
    let rustls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .map_err(Error::Io)?;
    let addr: SocketAddr = if state.config.use_ipv6 {
        (Ipv6Addr::UNSPECIFIED, state.config.port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, state.config.port).into()
    };
    let handle = axum_server::Handle::new();
    let router = http::router(state.clone());
    let mut server_task = tokio::spawn(
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle.clone())
            .serve(router.into_make_service_with_connect_info::<SocketAddr>()),
    );
    tokio::select! {
        listening = handle.listening() => {
            if listening.is_none() {
                return Err(Error::Io(std::io::Error::other(format!(
                    "failed to bind https port {}",
                    state.config.port
                ))));
            }
        }
        result = &mut server_task => {
            return Err(server_exit_error(result));
        }
    }
    info!("listening on {}", state.config.uri());
    state.set_status(Status::Loading).await;

    // control plane
    if let Some(parent) = state.config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&state.config.socket_path);
    let control_listener = UnixListener::bind(&state.config.socket_path)?;
    info!("control socket at {}", state.config.socket_path.display());

    // contributed-config watcher; a missing directory is not fatal
    let _debouncer = match watch_contributed_conf(
        &state.config.contributed_conf_dir(),
        command_tx.clone(),
    ) {
        Ok(debouncer) => Some(debouncer),
        Err(e) => {
            warn!(
                "not watching {}: {}",
                state.config.contributed_conf_dir().display(),
                e
            );
            None
        }
    };

    register_now(&state).await;

    let result = tokio::select! {
        result = &mut server_task => Err(server_exit_error(result)),
        _ = control::run_control_server(state.clone(), control_listener) => Ok(()),
        _ = command_loop(state.clone(), command_rx) => Ok(()),
        _ = sweep_loop(state.clone()) => Ok(()),
        _ = metered_loop(state.clone()) => Ok(()),
        _ = timed_exit_timer(timed_exit) => {
            debug!("timed exit");
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            debug!("handling SIGINT");
            signal.map_err(Error::Io)
        }
    };

    handle.shutdown();
    let _ = std::fs::remove_file(&state.config.socket_path);
    drop(network);
    result
}

fn server_exit_error(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Error {
    match result {
        Ok(Ok(())) => Error::Io(std::io::Error::other("https server terminated")),
        Ok(Err(e)) => Error::Io(e),
        Err(e) => Error::Io(std::io::Error::other(e.to_string())),
    }
}

/// Mirror the current enabled hash set into the discovery daemon. Never
/// advertises on a metered connection. Failures leave the status degraded;
/// the next trigger retries.
pub async fn register_now(state: &ServerState) {
    if state.status().await == Status::Starting {
        warn!("https server has not yet started");
        return;
    }
    if *state.metered.borrow() {
        info!("on a metered connection, unregistering");
        state.set_status(Status::DisabledMetered).await;
        if let Err(e) = state.avahi.unregister().await {
            warn!("failed to unregister: {}", e);
        }
        return;
    }
    let hashes = state.store.lock().await.enabled_hashes();
    match state.avahi.register(&hashes).await {
        Ok(()) => state.set_status(Status::Running).await,
        Err(e) => warn!("failed to register: {}", e),
    }
}

async fn command_loop(state: SharedState, mut rx: mpsc::UnboundedReceiver<DaemonCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            DaemonCommand::Reregister => register_now(&state).await,
            DaemonCommand::RescanContributed => {
                rescan_contributed(&state).await;
                register_now(&state).await;
            }
        }
    }
}

async fn rescan_contributed(state: &ServerState) {
    let paths = match state.config.contributed_paths() {
        Ok(paths) => paths,
        Err(e) => {
            warn!("failed to scan contributed config: {}", e);
            return;
        }
    };
    let mut store = state.store.lock().await;
    if let Err(e) = store.scan_contributed(&paths, unix_now()) {
        warn!("failed to scan contributed directory: {}", e);
    }
    drop(store);
    state.notify_changed();
}

async fn sweep_loop(state: SharedState) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    // the startup sweep already ran
    interval.tick().await;
    loop {
        interval.tick().await;
        let evicted = {
            let mut store = state.store.lock().await;
            store.sweep(unix_now())
        };
        if evicted.is_empty() {
            continue;
        }
        for item in &evicted {
            audit::append_or_warn(
                &state.audit,
                audit::EVENT_DELETE,
                &[
                    ("hash", item.hash.to_hex()),
                    ("basename", item.basename.clone()),
                ],
            );
        }
        state.notify_changed();
        state.request_reregister();
    }
}

async fn metered_loop(state: SharedState) {
    let mut metered = state.metered.clone();
    while metered.changed().await.is_ok() {
        state.request_reregister();
    }
}

async fn timed_exit_timer(enabled: bool) {
    if enabled {
        tokio::time::sleep(TIMED_EXIT_DELAY).await;
    } else {
        std::future::pending::<()>().await;
    }
}

/// Watch the contributed-config directory; bursts of change notifications
/// coalesce into a single rescan command.
fn watch_contributed_conf(
    dir: &Path,
    tx: mpsc::UnboundedSender<DaemonCommand>,
) -> notify::Result<Debouncer<RecommendedWatcher>> {
    let mut debouncer = new_debouncer(RESCAN_DEBOUNCE, move |result: DebounceEventResult| {
        if let Ok(events) = result {
            if !events.is_empty() {
                let _ = tx.send(DaemonCommand::RescanContributed);
            }
        }
    })?;
    debouncer
        .watcher()
        .watch(dir, notify::RecursiveMode::NonRecursive)?;
    Ok(debouncer)
}
