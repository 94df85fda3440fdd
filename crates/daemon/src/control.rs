//! Control plane
//!
//! Line-delimited JSON over a Unix socket. The caller's identity comes from
//! the socket peer credentials: publish and unpublish require uid 0, and the
//! publishing executable is recorded from the caller's /proc entry. A
//! publish request line is followed by exactly `size` raw payload bytes.
//!
//! Subscribed connections receive daemon events as `{"event": ...}` lines.

use std::path::Path;
use std::sync::atomic::Ordering;

use humansize::{format_size, DECIMAL};
use passim_core::{boot_token, Error, Item, ItemAttrs, ItemFlags, ItemRecord, Result, Status};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::audit::{self, append_or_warn};
use crate::service::{unix_now, ServerState, SharedState};

/// Identity of a control-plane caller, resolved from socket peer
/// credentials before any request is processed.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    pub uid: u32,
    /// Basename of the calling process's executable, if resolvable.
    pub cmdline: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum ControlRequest {
    GetItems,
    GetStatus,
    Publish(PublishParams),
    Unpublish { hash: String },
    Subscribe,
}

#[derive(Debug, Deserialize)]
pub struct PublishParams {
    pub filename: String,
    #[serde(rename = "max-age", default = "default_max_age")]
    pub max_age: u32,
    #[serde(rename = "share-limit", default = "default_share_limit")]
    pub share_limit: u32,
    #[serde(rename = "share-count", default)]
    pub share_count: u32,
    #[serde(default)]
    pub flags: u64,
    /// Raw payload bytes that follow the request line.
    pub size: u64,
}

fn default_max_age() -> u32 {
    24 * 60 * 60
}

fn default_share_limit() -> u32 {
    5
}

#[derive(Debug, Serialize)]
pub struct StatusReply {
    #[serde(rename = "daemon-version")]
    pub daemon_version: String,
    pub name: String,
    pub uri: String,
    pub status: Status,
    #[serde(rename = "download-saving")]
    pub download_saving: u64,
    #[serde(rename = "carbon-saving")]
    pub carbon_saving: f64,
}

/// Enumerate all items; callable by any local user.
pub async fn get_items(state: &ServerState) -> Vec<ItemRecord> {
    let store = state.store.lock().await;
    store.list().map(Item::to_record).collect()
}

pub async fn get_status(state: &ServerState) -> StatusReply {
    let download_saving = state.download_saving.load(Ordering::Relaxed);
    StatusReply {
        daemon_version: crate::daemon_version().to_string(),
        name: state.avahi.name().to_string(),
        uri: state.config.uri(),
        status: state.status().await,
        download_saving,
        carbon_saving: carbon_saving(download_saving, state.config.carbon_cost),
    }
}

/// kg CO₂e saved: bytes scaled to GB times the configured cost per GB.
pub fn carbon_saving(download_saving: u64, carbon_cost: f64) -> f64 {
    (download_saving as f64 / (1024.0 * 1024.0 * 1024.0)) * carbon_cost
}

fn require_root(caller: &CallerInfo) -> Result<()> {
    if caller.uid != 0 {
        return Err(Error::PermissionDenied(format!("UID {} != 0", caller.uid)));
    }
    Ok(())
}

/// Ingest a published file: root-only, size-capped, recorded with the
/// caller's executable for provenance. Completes before the `Changed` event
/// is observable.
pub async fn publish(
    state: &ServerState,
    caller: &CallerInfo,
    params: &PublishParams,
    bytes: Vec<u8>,
) -> Result<()> {
    require_root(caller)?;
    let cmdline = caller
        .cmdline
        .clone()
        .ok_or_else(|| Error::Validation("cannot determine caller executable".to_string()))?;
    if bytes.len() as u64 > state.config.max_item_size {
        return Err(Error::QuotaExceeded(format!(
            "failed to load file, size limit is {}",
            format_size(state.config.max_item_size, DECIMAL)
        )));
    }
    let attrs = ItemAttrs {
        basename: params.filename.clone(),
        max_age: params.max_age,
        share_limit: params.share_limit,
        share_count: params.share_count,
        flags: ItemFlags(params.flags),
    };
    debug!(
        "publish {} (flags 0x{:x}, max-age {}, share-limit {})",
        attrs.basename, params.flags, params.max_age, params.share_limit
    );

    let boot = boot_token();
    let record = {
        let mut store = state.store.lock().await;
        let item = store.add(&bytes, &attrs, Some(cmdline), unix_now(), boot.as_deref())?;
        (item.hash.to_hex(), item.basename.clone(), item.size)
    };
    append_or_warn(
        &state.audit,
        audit::EVENT_PUBLISH,
        &[
            ("hash", record.0),
            ("basename", record.1),
            ("size", record.2.to_string()),
            ("cmdline", caller.cmdline.clone().unwrap_or_default()),
        ],
    );
    state.notify_changed();
    state.request_reregister();
    Ok(())
}

/// Remove a published item by hash: root-only.
pub async fn unpublish(state: &ServerState, caller: &CallerInfo, hash: &str) -> Result<()> {
    require_root(caller)?;
    let hash = passim_core::Sha256Hash::from_hex(hash)?;
    let removed = {
        let mut store = state.store.lock().await;
        store
            .remove(&hash)
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("{} not found", hash)),
                other => other,
            })?
    };
    append_or_warn(
        &state.audit,
        audit::EVENT_DELETE,
        &[
            ("hash", removed.hash.to_hex()),
            ("basename", removed.basename.clone()),
        ],
    );
    state.notify_changed();
    state.request_reregister();
    Ok(())
}

/// Accept loop for the control socket.
pub async fn run_control_server(state: SharedState, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(state.clone(), stream));
            }
            Err(e) => warn!("failed to accept control connection: {}", e),
        }
    }
}

async fn handle_connection(state: SharedState, stream: UnixStream) {
    let caller = match caller_info(&stream) {
        Ok(caller) => caller,
        Err(e) => {
            warn!("failed to read caller credentials: {}", e);
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("control read error: {}", e);
                return;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: ControlRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                let reply = error_reply(&Error::Validation(e.to_string()));
                if write_line(&mut write_half, &reply).await.is_err() {
                    return;
                }
                continue;
            }
        };
        match request {
            ControlRequest::GetItems => {
                let items = get_items(&state).await;
                let reply = ok_reply(json!(items));
                if write_line(&mut write_half, &reply).await.is_err() {
                    return;
                }
            }
            ControlRequest::GetStatus => {
                let status = get_status(&state).await;
                let reply = ok_reply(json!(status));
                if write_line(&mut write_half, &reply).await.is_err() {
                    return;
                }
            }
            ControlRequest::Publish(params) => {
                // refuse before reading an oversized payload; the
                // connection is closed to keep the framing unambiguous
                if params.size > state.config.max_item_size {
                    let reply = error_reply(&Error::QuotaExceeded(format!(
                        "failed to load file, size limit is {}",
                        format_size(state.config.max_item_size, DECIMAL)
                    )));
                    let _ = write_line(&mut write_half, &reply).await;
                    return;
                }
                let mut bytes = vec![0u8; params.size as usize];
                if let Err(e) = reader.read_exact(&mut bytes).await {
                    debug!("failed to read publish payload: {}", e);
                    return;
                }
                let reply = match publish(&state, &caller, &params, bytes).await {
                    Ok(()) => ok_reply(serde_json::Value::Null),
                    Err(e) => error_reply(&e),
                };
                if write_line(&mut write_half, &reply).await.is_err() {
                    return;
                }
            }
            ControlRequest::Unpublish { hash } => {
                let reply = match unpublish(&state, &caller, &hash).await {
                    Ok(()) => ok_reply(serde_json::Value::Null),
                    Err(e) => error_reply(&e),
                };
                if write_line(&mut write_half, &reply).await.is_err() {
                    return;
                }
            }
            ControlRequest::Subscribe => {
                let mut events = state.events.subscribe();
                if write_line(&mut write_half, &ok_reply(serde_json::Value::Null))
                    .await
                    .is_err()
                {
                    return;
                }
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let line = json!({ "event": event }).to_string();
                            if write_line(&mut write_half, &line).await.is_err() {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }
}

fn caller_info(stream: &UnixStream) -> std::io::Result<CallerInfo> {
    let cred = stream.peer_cred()?;
    let cmdline = cred.pid().and_then(cmdline_for_pid);
    Ok(CallerInfo {
        uid: cred.uid(),
        cmdline,
    })
}

/// Basename of a process's executable, read from /proc.
fn cmdline_for_pid(pid: i32) -> Option<String> {
    let buf = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let first = buf.split(|b| *b == 0).next()?;
    let text = String::from_utf8_lossy(first);
    Path::new(text.as_ref())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn ok_reply(result: serde_json::Value) -> String {
    json!({ "result": result }).to_string()
}

fn error_reply(error: &Error) -> String {
    json!({
        "error": { "kind": error.kind(), "message": error.to_string() }
    })
    .to_string()
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await
}
