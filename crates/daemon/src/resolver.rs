//! Service resolving
//!
//! Turns one browsed service record into a concrete `host:port` string.
//!
//! Ordering quirk: older discovery daemons can deliver `Found` or `Failure`
//! before the `Start` reply arrives, so the signal stream must be subscribed
//! before `Start` is issued; the channel holds whatever lands in that window
//! and it is consumed afterwards.

use passim_core::{Error, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::avahi::{with_timeout, AvahiBus, AvahiSignal, ServiceFound};

pub async fn resolve(
    bus: &dyn AvahiBus,
    service: &ServiceFound,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut signals = bus.subscribe();
    debug!(
        "resolving {{ iface:{}, proto:{}, name:{}, type:{}, domain:{}, flags:{} }}",
        service.interface, service.protocol, service.name, service.kind, service.domain,
        service.flags
    );
    let path = with_timeout(bus.service_resolver_prepare(service)).await?;
    debug!("connecting to {}", path);
    if let Err(e) = with_timeout(bus.start(&path)).await {
        let _ = with_timeout(bus.free(&path)).await;
        return Err(e);
    }

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
            Ok(AvahiSignal::Found {
                path: signal_path,
                host,
                port,
            }) if signal_path == path => {
                with_timeout(bus.free(&path)).await?;
                return Ok(format_address(&host, port));
            }
            Ok(AvahiSignal::Failure {
                path: signal_path,
                message,
            }) if signal_path == path => {
                let _ = with_timeout(bus.free(&path)).await;
                return Err(Error::Upstream(message));
            }
            Ok(_) => {}
        }
    }
}

/// IPv6 hosts need brackets to survive the `host:port` form.
pub fn format_address(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
