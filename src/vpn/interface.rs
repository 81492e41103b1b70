//! Network Interface Manager
//!
//! Creates and tears down the virtual tunnel interface: a single local
//! address in a private /28 block, default IPv4 and IPv6 routes into the
//! tunnel, two DNS resolvers, and the hosting application's own traffic
//! excluded from capture so the engine's upstream connections do not loop
//! back into the tunnel.
//!
//! The real provider is TUN-backed and Linux-only; the controller talks to
//! the [`InterfaceProvider`] trait so tests can run without privileges.

use std::net::{IpAddr, Ipv4Addr};

use super::{TunnelError, TunnelResult};

/// Parameters for the virtual tunnel interface.
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    /// Interface / session name
    pub session_name: String,
    /// Local address inside the tunnel's private block
    pub address: Ipv4Addr,
    /// Prefix length of the private block
    pub prefix_len: u8,
    pub mtu: u16,
    /// Resolvers pushed to the tunnel
    pub dns_servers: Vec<IpAddr>,
    /// Route all IPv4 into the tunnel
    pub route_ipv4_default: bool,
    /// Route all IPv6 into the tunnel
    pub route_ipv6_default: bool,
    /// Applications whose traffic must bypass the tunnel (the hosting app
    /// itself, so the engine's egress is not self-captured)
    pub excluded_apps: Vec<String>,
    /// Blocking-mode reads on the device
    pub blocking: bool,
}

impl Default for InterfaceSpec {
    fn default() -> Self {
        Self {
            session_name: "veilway0".to_string(),
            address: Ipv4Addr::new(172, 19, 0, 1),
            prefix_len: 28,
            mtu: 1500,
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            route_ipv4_default: true,
            route_ipv6_default: true,
            excluded_apps: vec![],
            blocking: true,
        }
    }
}

impl InterfaceSpec {
    /// Netmask form of `prefix_len`
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        };
        Ipv4Addr::from(bits)
    }
}

/// An open tunnel interface as seen by the controller.
pub trait TunnelInterface: Send {
    fn name(&self) -> &str;
    fn close(&mut self) -> std::io::Result<()>;
}

/// Owning handle for the virtual interface. Exists iff the tunnel is
/// Running or Stopping.
pub struct InterfaceHandle {
    inner: Box<dyn TunnelInterface>,
}

impl InterfaceHandle {
    pub fn new(inner: Box<dyn TunnelInterface>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Best-effort close. Failures are logged, never escalated — the
    /// controller must still proceed with the rest of its teardown.
    pub fn close(mut self) {
        let name = self.inner.name().to_string();
        if let Err(e) = self.inner.close() {
            log::warn!("Failed to close tunnel interface {}: {}", name, e);
        } else {
            log::info!("Tunnel interface {} closed", name);
        }
    }
}

/// Seam between the controller and the host OS.
pub trait InterfaceProvider: Send + Sync {
    /// Request a virtual interface per `spec`. Fails with
    /// [`TunnelError::InterfaceDenied`] when the OS refuses (permission
    /// revoked, another tunnel already bound).
    fn create(&self, spec: &InterfaceSpec) -> TunnelResult<InterfaceHandle>;
}

/// Socket protection via SO_MARK: marked sockets are excluded from the
/// tunnel's routing rules by a policy-routing rule installed alongside the
/// interface.
#[cfg(target_os = "linux")]
pub struct FwmarkProtect {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl FwmarkProtect {
    /// Default fwmark used for engine egress sockets
    pub const DEFAULT_MARK: u32 = 0x76_65_69;

    pub fn new(mark: u32) -> Self {
        Self { mark }
    }
}

#[cfg(target_os = "linux")]
impl Default for FwmarkProtect {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MARK)
    }
}

#[cfg(target_os = "linux")]
impl super::engine::SocketProtect for FwmarkProtect {
    fn protect(&self, socket: i64) -> bool {
        let fd = socket as libc::c_int;
        let mark = self.mark;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        rc == 0
    }
}

/// TUN-backed interface provider.
#[cfg(target_os = "linux")]
pub struct TunInterfaceManager {
    /// fwmark excluded from tunnel routing; pairs with [`FwmarkProtect`]
    protect_mark: u32,
}

#[cfg(target_os = "linux")]
impl TunInterfaceManager {
    pub fn new() -> Self {
        Self {
            protect_mark: FwmarkProtect::DEFAULT_MARK,
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for TunInterfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
struct TunDevice {
    name: String,
    device: Option<tun::platform::Device>,
}

#[cfg(target_os = "linux")]
impl TunnelInterface for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> std::io::Result<()> {
        // Routes through the device die with it
        self.device.take();
        Ok(())
    }
}

/// Run an OS network command, logging failures. Route, rule and DNS
/// installation is best-effort: the device itself was granted, and
/// partial configuration is recoverable by the engine's own retries.
#[cfg(target_os = "linux")]
fn run_cmd(program: &str, args: &[&str]) {
    match std::process::Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            log::warn!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => log::warn!("Failed to run {} {}: {}", program, args.join(" "), e),
    }
}

#[cfg(target_os = "linux")]
fn run_ip(args: &[&str]) {
    run_cmd("ip", args);
}

/// `resolvectl dns <iface> <server...>` argument list pushing `spec`'s
/// resolvers onto the tunnel interface.
#[cfg(target_os = "linux")]
fn resolvectl_dns_args(iface: &str, servers: &[IpAddr]) -> Vec<String> {
    let mut args = vec!["dns".to_string(), iface.to_string()];
    args.extend(servers.iter().map(IpAddr::to_string));
    args
}

#[cfg(target_os = "linux")]
impl InterfaceProvider for TunInterfaceManager {
    fn create(&self, spec: &InterfaceSpec) -> TunnelResult<InterfaceHandle> {
        log::info!(
            "Creating tunnel interface {} ({}/{})",
            spec.session_name,
            spec.address,
            spec.prefix_len
        );

        let mut config = tun::Configuration::default();
        config
            .name(&spec.session_name)
            .address(spec.address)
            .netmask(spec.netmask())
            .mtu(spec.mtu as i32)
            .up();

        let device = tun::create(&config).map_err(|e| {
            TunnelError::InterfaceDenied(format!(
                "OS refused interface {}: {}",
                spec.session_name, e
            ))
        })?;

        // The device opens in blocking mode; only deviations need a call
        if !spec.blocking {
            if let Err(e) = device.set_nonblock() {
                log::warn!(
                    "Failed to set non-blocking reads on {}: {}",
                    spec.session_name,
                    e
                );
            }
        }

        if spec.route_ipv4_default {
            run_ip(&["route", "replace", "default", "dev", &spec.session_name]);
        }
        if spec.route_ipv6_default {
            run_ip(&["-6", "route", "replace", "default", "dev", &spec.session_name]);
        }

        // Marked sockets (engine egress, excluded apps) keep using the main
        // routing table instead of the tunnel default
        let mark = format!("{:#x}", self.protect_mark);
        run_ip(&["rule", "add", "fwmark", &mark, "lookup", "main", "pref", "100"]);

        if !spec.dns_servers.is_empty() {
            let dns_args = resolvectl_dns_args(&spec.session_name, &spec.dns_servers);
            let dns_args: Vec<&str> = dns_args.iter().map(String::as_str).collect();
            run_cmd("resolvectl", &dns_args);
        }

        if !spec.excluded_apps.is_empty() {
            log::debug!(
                "App exclusion delegated to socket protection: {:?}",
                spec.excluded_apps
            );
        }

        log::info!("Tunnel interface {} created", spec.session_name);
        Ok(InterfaceHandle::new(Box::new(TunDevice {
            name: spec.session_name.clone(),
            device: Some(device),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_matches_tunnel_block() {
        let spec = InterfaceSpec::default();
        assert_eq!(spec.address, Ipv4Addr::new(172, 19, 0, 1));
        assert_eq!(spec.prefix_len, 28);
        assert_eq!(spec.mtu, 1500);
        assert_eq!(spec.dns_servers.len(), 2);
        assert!(spec.route_ipv4_default);
        assert!(spec.route_ipv6_default);
        assert!(spec.blocking);
    }

    #[test]
    fn netmask_for_slash_28() {
        let spec = InterfaceSpec::default();
        assert_eq!(spec.netmask(), Ipv4Addr::new(255, 255, 255, 240));
    }

    #[test]
    fn netmask_edge_cases() {
        let mut spec = InterfaceSpec::default();
        spec.prefix_len = 0;
        assert_eq!(spec.netmask(), Ipv4Addr::new(0, 0, 0, 0));
        spec.prefix_len = 32;
        assert_eq!(spec.netmask(), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn handle_close_reports_failure_without_panicking() {
        struct FailingClose;
        impl TunnelInterface for FailingClose {
            fn name(&self) -> &str {
                "failing0"
            }
            fn close(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "busy"))
            }
        }

        // Must not panic or escalate
        InterfaceHandle::new(Box::new(FailingClose)).close();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolvectl_args_carry_every_resolver() {
        let spec = InterfaceSpec::default();
        let args = resolvectl_dns_args(&spec.session_name, &spec.dns_servers);
        assert_eq!(args, ["dns", "veilway0", "8.8.8.8", "8.8.4.4"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolvectl_args_for_custom_resolver_set() {
        let args = resolvectl_dns_args(
            "veilwaytest0",
            &[IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3))],
        );
        assert_eq!(args, ["dns", "veilwaytest0", "10.0.2.3"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[ignore] // Requires root and TUN support
    fn create_real_tun_interface() {
        let manager = TunInterfaceManager::new();
        let mut spec = InterfaceSpec::default();
        spec.session_name = "veilwaytest0".to_string();
        spec.route_ipv4_default = false;
        spec.route_ipv6_default = false;
        spec.blocking = false;
        let handle = manager.create(&spec).unwrap();
        assert_eq!(handle.name(), "veilwaytest0");
        handle.close();
    }
}
