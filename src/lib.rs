//! Veilway — local proxy tunnel orchestrator
//!
//! Coordinates the lifecycle of a local network tunnel whose traffic is
//! routed through an embedded proxy engine. The engine is treated as an
//! opaque capability exposing start/stop entry points and a
//! socket-protection callback; everything else here is orchestration:
//! provisioning a validated engine config, creating the virtual tunnel
//! interface, arming a subscription watchdog while the tunnel runs, and
//! re-binding the process network after teardown.
//!
//! Architecture:
//! - vpn/: tunnel state machine, engine adapter, interface manager,
//!   watchdog and rebind manager
//! - dns.rs: in-process fallback resolver used during network rebind
//! - notification.rs: persistent status-indicator seam
//! - settings.rs: persisted "tunnel enabled" flag

pub mod dns;
pub mod notification;
pub mod settings;
pub mod vpn;

// Re-export commonly used items
pub use vpn::connection::{Command, TunnelController, TunnelDeps, TunnelState};
pub use vpn::{TunnelError, TunnelResult};
