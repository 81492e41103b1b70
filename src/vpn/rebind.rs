//! Network Rebind Manager
//!
//! After the tunnel stops (or connectivity drops) the process may still
//! be bound to the dead tunnel network. This manager unbinds the default
//! network, walks a DNS fallback chain, and asks the OS for a fresh
//! network across the known transports. OS connectivity callbacks arrive
//! asynchronously — possibly after the controller is already Idle — and
//! are checked against the session generation so a stale rebind never
//! clobbers a newer tunnel session.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dns::FallbackDns;

use super::{TunnelError, TunnelResult};

/// Opaque handle for an OS network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Wifi,
    Cellular,
}

/// OS connectivity transition, delivered as a message rather than a raw
/// callback so all binding mutation happens on one task.
#[derive(Debug, Clone, Copy)]
pub enum ConnectivityEvent {
    Available(NetworkHandle),
    Lost(NetworkHandle),
}

/// Seam over the host OS's connectivity surface.
pub trait ConnectivityOs: Send + Sync {
    /// Bind (or with `None`, unbind) the process's default network.
    fn bind_process_to_network(&self, network: Option<NetworkHandle>) -> TunnelResult<()>;

    /// Point OS-level DNS at a single resolver. Best-effort.
    fn reset_dns(&self, resolver: IpAddr) -> TunnelResult<()>;

    /// Issue a fresh network request across the given transports; the OS
    /// reports transitions on the returned channel, asynchronously.
    fn request_network(
        &self,
        transports: &[Transport],
    ) -> TunnelResult<mpsc::UnboundedReceiver<ConnectivityEvent>>;

    /// Tell the OS the network is usable. May be denied by policy.
    fn report_connectivity(&self, network: NetworkHandle) -> TunnelResult<()>;
}

/// Default rebind DNS fallback chain: local/test resolver first, then a
/// public one.
pub const DNS_FALLBACKS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

/// Host resolved after a successful rebind to confirm the fallback chain
/// actually answers
const DNS_PROBE_HOST: &str = "dns.google";

/// Owns the process-wide network binding state.
pub struct RebindManager {
    os: Arc<dyn ConnectivityOs>,
    dns: Arc<FallbackDns>,
    dns_fallbacks: Vec<IpAddr>,
    bound: Arc<parking_lot::Mutex<Option<NetworkHandle>>>,
    /// Tunnel session generation, shared with the controller; bumped on
    /// every successful start
    session: Arc<AtomicU64>,
    listener: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RebindManager {
    pub fn new(os: Arc<dyn ConnectivityOs>, session: Arc<AtomicU64>) -> Self {
        Self {
            os,
            dns: FallbackDns::shared(),
            dns_fallbacks: DNS_FALLBACKS.to_vec(),
            bound: Arc::new(parking_lot::Mutex::new(None)),
            session,
            listener: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_dns_fallbacks(mut self, fallbacks: Vec<IpAddr>) -> Self {
        self.dns_fallbacks = fallbacks;
        self
    }

    pub fn bound_network(&self) -> Option<NetworkHandle> {
        *self.bound.lock()
    }

    /// Teardown sequence run at the end of every `stop()`: unbind the
    /// default network, reset DNS to the fallback chain, and request a
    /// fresh network over Wi-Fi and cellular.
    ///
    /// A [`TunnelError::RebindDenied`] from the unbind is surfaced to the
    /// caller as a non-fatal warning; it never reopens the tunnel.
    pub fn reset_and_rebind(&self) -> TunnelResult<()> {
        *self.bound.lock() = None;
        self.os.bind_process_to_network(None)?;
        log::info!("Process network unbound");

        for &resolver in &self.dns_fallbacks {
            if let Err(e) = self.os.reset_dns(resolver) {
                log::warn!("DNS reset to {} failed: {}", resolver, e);
            } else {
                log::info!("DNS reset to {} attempted", resolver);
            }
        }
        self.dns.reset_to(&self.dns_fallbacks);

        let rx = self
            .os
            .request_network(&[Transport::Wifi, Transport::Cellular])?;
        self.spawn_listener(rx);
        Ok(())
    }

    /// Consume connectivity events on a dedicated task. Only one listener
    /// is live at a time; a newer reset replaces the previous one.
    fn spawn_listener(&self, mut rx: mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let os = Arc::clone(&self.os);
        let bound = Arc::clone(&self.bound);
        let dns = Arc::clone(&self.dns);
        let session = Arc::clone(&self.session);
        let session_at_reset = session.load(Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ConnectivityEvent::Available(network) => {
                        // A newer tunnel session owns the binding now
                        if session.load(Ordering::SeqCst) != session_at_reset {
                            log::debug!("Ignoring stale network-available callback for {:?}", network);
                            continue;
                        }
                        if let Err(e) = os.bind_process_to_network(Some(network)) {
                            log::warn!("Failed to bind process to {:?}: {}", network, e);
                            continue;
                        }
                        *bound.lock() = Some(network);
                        log::info!("Process bound to network {:?}", network);
                        if let Err(e) = os.report_connectivity(network) {
                            log::warn!("Failed to report network connectivity: {}", e);
                        }
                        // Probe the fallback resolver chain off this task;
                        // a failed probe is diagnostic only
                        let probe = Arc::clone(&dns);
                        tokio::spawn(async move {
                            match probe.resolve_host(DNS_PROBE_HOST, 443).await {
                                Ok(addrs) => log::debug!(
                                    "DNS probe for {} resolved {} addresses",
                                    DNS_PROBE_HOST,
                                    addrs.len()
                                ),
                                Err(e) => log::warn!("DNS probe after rebind failed: {}", e),
                            }
                        });
                    }
                    ConnectivityEvent::Lost(network) => {
                        let was_bound = {
                            let mut guard = bound.lock();
                            if *guard == Some(network) {
                                *guard = None;
                                true
                            } else {
                                false
                            }
                        };
                        if was_bound {
                            log::info!("Bound network {:?} lost, unbinding", network);
                            if let Err(e) = os.bind_process_to_network(None) {
                                log::warn!("Failed to unbind after network loss: {}", e);
                            }
                        }
                    }
                }
            }
            log::debug!("Connectivity listener exited (channel closed)");
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for RebindManager {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

/// Best-effort host implementation. Desktop Linux has no per-process
/// network binding, so bind/report are accepted and recorded; DNS reset
/// happens through [`FallbackDns`]; the network request resolves
/// immediately with the current default network.
pub struct SystemConnectivity;

impl ConnectivityOs for SystemConnectivity {
    fn bind_process_to_network(&self, network: Option<NetworkHandle>) -> TunnelResult<()> {
        log::debug!("Process network binding set to {:?}", network);
        Ok(())
    }

    fn reset_dns(&self, resolver: IpAddr) -> TunnelResult<()> {
        log::debug!("OS DNS reset to {} delegated to in-process resolver", resolver);
        Ok(())
    }

    fn request_network(
        &self,
        transports: &[Transport],
    ) -> TunnelResult<mpsc::UnboundedReceiver<ConnectivityEvent>> {
        log::debug!("Requesting network over {:?}", transports);
        let (tx, rx) = mpsc::unbounded_channel();
        // The default network is already there; report it available
        let _ = tx.send(ConnectivityEvent::Available(NetworkHandle(1)));
        Ok(rx)
    }

    fn report_connectivity(&self, network: NetworkHandle) -> TunnelResult<()> {
        log::debug!("Reported connectivity usable on {:?}", network);
        Ok(())
    }
}
