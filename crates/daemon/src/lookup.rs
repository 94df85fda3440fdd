//! Lookup coordinator
//!
//! Turns a loopback miss into a redirect: drive the discovery client's
//! browse→resolve pipeline, pick one candidate uniformly at random, and
//! answer 303 pointing at it.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use passim_core::Sha256Hash;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::html_error;
use crate::service::ServerState;

pub async fn redirect_to_peer(
    state: &ServerState,
    hash: &Sha256Hash,
    basename: &str,
) -> Response {
    let cancel = CancellationToken::new();
    let addresses = match state.avahi.find(hash, &cancel).await {
        Ok(addresses) => addresses,
        Err(e) => return html_error(StatusCode::NOT_FOUND, Some(&e.to_string())),
    };
    let picked = pick_candidate(&addresses);
    for address in &addresses {
        if address == picked {
            info!("chosen address: {}", address);
        } else {
            info!("ignore address: {}", address);
        }
    }
    redirect_response(picked, basename, hash)
}

/// Uniform choice over the whole candidate list; never round-robin, never
/// just the first responder.
pub fn pick_candidate(addresses: &[String]) -> &String {
    let index = rand::thread_rng().gen_range(0..addresses.len());
    &addresses[index]
}

pub fn redirect_response(address: &str, basename: &str, hash: &Sha256Hash) -> Response {
    let uri = format!("https://{}/{}?sha256={}", address, basename, hash);
    let body = format!(
        "<html><body><a href=\"{}\">Redirecting</a>...</body></html>",
        uri
    );
    (
        StatusCode::SEE_OTHER,
        [
            (header::LOCATION, uri.as_str()),
            (header::CONTENT_TYPE, "text/html"),
            (header::CONNECTION, "close"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_candidate_covers_whole_list() {
        let addresses: Vec<String> = (0..4).map(|i| format!("10.0.0.{}:27500", i)).collect();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pick_candidate(&addresses).clone());
        }
        // uniform choice over 4 entries makes missing one after 200 draws
        // vanishingly unlikely
        assert_eq!(seen.len(), addresses.len());
    }

    #[test]
    fn test_redirect_response_shape() {
        let hash = Sha256Hash::from_bytes(b"redirect");
        let response = redirect_response("10.0.0.2:27500", "file.bin", &hash);
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers().get(header::LOCATION).unwrap();
        assert_eq!(
            location.to_str().unwrap(),
            format!("https://10.0.0.2:27500/file.bin?sha256={}", hash)
        );
    }
}
