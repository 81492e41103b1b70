//! In-process fallback DNS resolver
//!
//! After tunnel teardown the system resolver may still point at the dead
//! tunnel. This resolver bypasses system DNS entirely and can be reset to
//! the rebind manager's fallback chain, so the app's own lookups keep
//! working while the OS sorts itself out.

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Resolvers used until the first reset
const DEFAULT_SERVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
];

/// Resolver pinned to an explicit server list instead of system DNS.
pub struct FallbackDns {
    resolver: RwLock<TokioAsyncResolver>,
}

impl FallbackDns {
    fn new(servers: &[IpAddr]) -> Self {
        Self {
            resolver: RwLock::new(Self::build(servers)),
        }
    }

    fn build(servers: &[IpAddr]) -> TokioAsyncResolver {
        let mut config = ResolverConfig::new();
        for &server in servers {
            // UDP with TCP fallback per server
            config.add_name_server(NameServerConfig::new(
                SocketAddr::new(server, 53),
                Protocol::Udp,
            ));
            config.add_name_server(NameServerConfig::new(
                SocketAddr::new(server, 53),
                Protocol::Tcp,
            ));
        }
        TokioAsyncResolver::tokio(config, ResolverOpts::default())
    }

    /// Shared process-wide instance
    pub fn shared() -> Arc<Self> {
        static INSTANCE: std::sync::OnceLock<Arc<FallbackDns>> = std::sync::OnceLock::new();
        INSTANCE
            .get_or_init(|| Arc::new(Self::new(&DEFAULT_SERVERS)))
            .clone()
    }

    /// Point the resolver at a new server list. Used by the rebind
    /// manager to walk its fallback chain after tunnel teardown.
    pub fn reset_to(&self, servers: &[IpAddr]) {
        log::info!("Resetting in-process DNS to {:?}", servers);
        *self.resolver.write() = Self::build(servers);
    }

    /// Resolve a hostname to socket addresses.
    pub async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
        let resolver = self.resolver.read().clone();
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| format!("DNS resolution failed for '{}': {}", host, e))?;

        let addrs: Vec<SocketAddr> = lookup
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();

        if addrs.is_empty() {
            return Err(format!("DNS resolution returned no addresses for '{}'", host));
        }

        Ok(addrs)
    }
}
