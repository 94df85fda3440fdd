//! Service browsing
//!
//! One browse collects every peer advertising a subtype: records accumulate
//! from `ItemNew` signals until the daemon's `AllForNow` terminator, then
//! the remote browser object is freed.

use passim_core::{Error, Result, SERVICE_DOMAIN};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::avahi::{with_timeout, AvahiBus, AvahiSignal, ServiceFound, LOOKUP_RESULT_LOCAL};

/// Browse a subtype to completion. Records flagged LOCAL are dropped — this
/// host must never be offered as a peer for its own lookup.
pub async fn browse(
    bus: &dyn AvahiBus,
    subtype: &str,
    protocol: i32,
    cancel: &CancellationToken,
) -> Result<Vec<ServiceFound>> {
    let mut signals = bus.subscribe();
    let path = with_timeout(bus.service_browser_prepare(subtype, SERVICE_DOMAIN, protocol)).await?;
    debug!("connecting to {}", path);
    if let Err(e) = with_timeout(bus.start(&path)).await {
        let _ = with_timeout(bus.free(&path)).await;
        return Err(e);
    }

    let mut found: Vec<ServiceFound> = Vec::new();
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = with_timeout(bus.free(&path)).await;
                return Err(Error::Upstream("lookup cancelled".to_string()));
            }
            signal = signals.recv() => signal,
        };
        match signal {
            Err(RecvError::Lagged(n)) => {
                warn!("missed {} discovery signals", n);
                continue;
            }
            Err(RecvError::Closed) => {
                return Err(Error::Upstream("discovery signal stream closed".to_string()));
            }
            Ok(AvahiSignal::ItemNew {
                path: signal_path,
                service,
            }) if signal_path == path => {
                if service.flags & LOOKUP_RESULT_LOCAL != 0 {
                    debug!("ignoring local result on interface {}", service.interface);
                    continue;
                }
                found.push(service);
            }
            Ok(AvahiSignal::CacheExhausted { path: signal_path }) if signal_path == path => {}
            Ok(AvahiSignal::AllForNow { path: signal_path }) if signal_path == path => {
                with_timeout(bus.free(&path)).await?;
                if found.is_empty() {
                    return Err(Error::Upstream(format!("failed to find {}", subtype)));
                }
                return Ok(found);
            }
            Ok(AvahiSignal::Failure {
                path: signal_path,
                message,
            }) if signal_path == path => {
                let _ = with_timeout(bus.free(&path)).await;
                return Err(Error::Upstream(message));
            }
            // other objects' traffic
            Ok(_) => {}
        }
    }
}
