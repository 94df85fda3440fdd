//! Request engine
//!
//! Classifies every HTTPS request in order: index and static assets for
//! loopback callers, then the `sha256=` item fetch path. Anything a remote
//! peer may not do answers 403; error bodies carry the status phrase so the
//! text is part of the stable surface.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use humansize::{format_size, DECIMAL};
use passim_core::{status_phrase, Item, Sha256Hash, UNLIMITED};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::audit::{self, append_or_warn};
use crate::lookup;
use crate::service::{unix_now, ServerState, SharedState};

/// Escape set for the Content-Disposition filename: everything but
/// unreserved characters.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/favicon.ico", get(static_asset))
        .route("/style.css", get(static_asset))
        .fallback(classify)
        .method_not_allowed_fallback(method_forbidden)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTML error body with the code's phrase; `reason` overrides the body text.
pub fn html_error(status: StatusCode, reason: Option<&str>) -> Response {
    let phrase = status_phrase(status.as_u16());
    let body = format!(
        "<html><head><title>{} {}</title></head><body>{}</body></html>",
        status.as_u16(),
        phrase,
        reason.unwrap_or(phrase)
    );
    (status, [(header::CONTENT_TYPE, "text/html")], body).into_response()
}

async fn method_forbidden() -> Response {
    html_error(StatusCode::FORBIDDEN, None)
}

async fn index(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !peer.ip().is_loopback() {
        return html_error(StatusCode::FORBIDDEN, None);
    }
    render_index(&state).await
}

async fn static_asset(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
) -> Response {
    if !peer.ip().is_loopback() {
        return html_error(StatusCode::FORBIDDEN, None);
    }
    let name = uri.path().trim_start_matches('/');
    let path = state.config.datadir.join(name);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            if let Some(mime) = passim_store::detect_content_type(name) {
                if let Ok(value) = mime.parse() {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
            }
            response
        }
        Err(e) => html_error(StatusCode::INTERNAL_SERVER_ERROR, Some(&e.to_string())),
    }
}

/// Everything that is not the index or a static asset: the item fetch path.
async fn classify(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if request.method() != Method::GET {
        return html_error(StatusCode::FORBIDDEN, None);
    }
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let is_loopback = peer.ip().is_loopback();
    info!(
        "accepting GET {}?{} from {} ({})",
        path,
        query.as_deref().unwrap_or(""),
        peer,
        if is_loopback { "loopback" } else { "remote" }
    );

    // the hash argument is mandatory from here on
    let Some(query) = query else {
        return html_error(StatusCode::BAD_REQUEST, None);
    };
    let mut hash_arg: Option<String> = None;
    let mut allow_localhost = true;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "sha256" => {
                if hash_arg.is_some() {
                    return html_error(
                        StatusCode::BAD_REQUEST,
                        Some("duplicate sha256= argument"),
                    );
                }
                hash_arg = Some(value.to_string());
            }
            "localhost" => match value {
                "true" => allow_localhost = true,
                "false" => allow_localhost = false,
                _ => {
                    return html_error(
                        StatusCode::BAD_REQUEST,
                        Some("localhost option invalid, expected true|false"),
                    )
                }
            },
            _ => {}
        }
    }
    let Some(hash_text) = hash_arg else {
        return html_error(StatusCode::BAD_REQUEST, Some("sha256= argument required"));
    };
    let hash = match Sha256Hash::from_hex(&hash_text) {
        Ok(hash) => hash,
        Err(_) => {
            return html_error(StatusCode::NOT_ACCEPTABLE, Some("sha256 hash is malformed"))
        }
    };

    let local = { state.store.lock().await.get(&hash).cloned() };
    if let Some(item) = local {
        if allow_localhost {
            if !item.enabled() {
                return html_error(StatusCode::LOCKED, None);
            }
            return serve_item(&state, &item, peer).await;
        }
    }

    // only loopback may cause a LAN scan
    if !is_loopback {
        return html_error(StatusCode::FORBIDDEN, None);
    }
    let basename = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string();
    lookup::redirect_to_peer(&state, &hash, &basename).await
}

async fn serve_item(state: &ServerState, item: &Item, peer: SocketAddr) -> Response {
    let bytes = match std::fs::read(&item.path) {
        Ok(bytes) => bytes,
        Err(e) => {
            // rather drop the item than keep failing on it
            warn!("failed to read {}: {}", item.path.display(), e);
            match state.store.lock().await.remove(&item.hash) {
                Ok(_) => {
                    state.notify_changed();
                    state.request_reregister();
                }
                Err(remove_err) => warn!("failed to evict {}: {}", item.hash, remove_err),
            }
            return html_error(StatusCode::INTERNAL_SERVER_ERROR, Some(&e.to_string()));
        }
    };

    let mut evict = false;
    {
        let mut store = state.store.lock().await;
        if let Some(entry) = store.get_mut(&item.hash) {
            entry.share_count += 1;
            evict = entry.share_limit != UNLIMITED && entry.share_count >= entry.share_limit;
        }
    }
    if !peer.ip().is_loopback() {
        state.download_saving.fetch_add(item.size, Ordering::Relaxed);
    }
    append_or_warn(
        &state.audit,
        audit::EVENT_SHARE,
        &[
            ("hash", item.hash.to_hex()),
            ("basename", item.basename.clone()),
            ("size", item.size.to_string()),
            ("ipaddr", peer.ip().to_string()),
        ],
    );
    if evict {
        debug!("deleting {} as share limit reached", item.hash);
        match state.store.lock().await.remove(&item.hash) {
            Ok(removed) => {
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
            }
            Err(e) => warn!("failed to evict {}: {}", item.hash, e),
        }
    }

    let filename = utf8_percent_encode(&item.basename, FILENAME_ESCAPE).to_string();
    let mut response = Response::new(Body::from(bytes));
    if let Ok(value) = format!("attachment; filename=\"{}\"", filename).parse() {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(ref mime) = item.content_type {
        if let Ok(value) = mime.parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    response
}

async fn render_index(state: &ServerState) -> Response {
    let now = unix_now();
    let status = state.status().await;
    let name = state.avahi.name();
    let store = state.store.lock().await;

    let mut html = String::new();
    html.push_str("<html>\n<head>\n<meta charset=\"utf-8\" />\n");
    html.push_str(
        "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\" />\n",
    );
    html.push_str(&format!("<title>{}</title>\n", name));
    html.push_str("<link href=\"style.css\" rel=\"stylesheet\" />\n</head>");
    html.push_str("<body>");
    html.push_str(&format!("<h1>{}</h1>\n", name));
    html.push_str(&format!(
        "<p>A local caching server, version <code>{}</code> with status <code>{}</code>.</p>\n",
        crate::daemon_version(),
        status
    ));
    if store.is_empty() {
        html.push_str("<em>There are no shared files on this computer.</em>\n");
    } else {
        html.push_str("<h2>Shared Files:</h2>\n<table>\n<tr>\n");
        for heading in ["Filename", "Hash", "Binary", "Age", "Shared", "Size", "Flags"] {
            html.push_str(&format!("<th>{}</th>\n", heading));
        }
        html.push_str("</tr>\n");
        for item in store.list() {
            let url = format!(
                "https://localhost:{}/{}?sha256={}",
                state.config.port, item.basename, item.hash
            );
            html.push_str("<tr>\n");
            html.push_str(&format!(
                "<td><a href=\"{}\">{}</a></td>\n",
                url, item.basename
            ));
            html.push_str(&format!("<td><code>{}</code></td>\n", item.hash));
            html.push_str(&format!(
                "<td><code>{}</code></td>\n",
                item.cmdline.as_deref().unwrap_or("n/a")
            ));
            let age_hours = item.age(now) / 3600;
            if item.max_age == UNLIMITED {
                html.push_str(&format!("<td>{}/∞h</td>\n", age_hours));
            } else {
                html.push_str(&format!(
                    "<td>{}/{}h</td>\n",
                    age_hours,
                    item.max_age / 3600
                ));
            }
            if item.share_limit == UNLIMITED {
                html.push_str(&format!("<td>{}/∞</td>\n", item.share_count));
            } else {
                html.push_str(&format!(
                    "<td>{}/{}</td>\n",
                    item.share_count, item.share_limit
                ));
            }
            if item.size == 0 {
                html.push_str("<td>?</td>\n");
            } else {
                html.push_str(&format!("<td>{}</td>\n", format_size(item.size, DECIMAL)));
            }
            html.push_str(&format!("<td><code>{}</code></td>\n", item.flags));
            html.push_str("</tr>");
        }
        html.push_str("</table>\n");
    }
    html.push_str("</body>\n</html>\n");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html")],
        html,
    )
        .into_response()
}
