//! Tunnel orchestration module
//!
//! This module owns the hard part of the application: coordinating the
//! OS-level tunnel interface, the embedded proxy engine's asynchronous
//! lifecycle, the subscription watchdog, and network-rebind races.
//!
//! Architecture:
//! - provision.rs: engine config provisioning (remote, fallback, assets)
//! - engine.rs: proxy engine adapter (envelope codec, socket protection)
//! - interface.rs: virtual tunnel interface management
//! - watchdog.rs: periodic subscription entitlement checks
//! - rebind.rs: process network re-binding after teardown
//! - connection.rs: tunnel state machine and lifecycle controller

pub mod connection;
pub mod engine;
pub mod interface;
pub mod provision;
pub mod rebind;
pub mod watchdog;

pub use connection::{Command, TunnelController, TunnelDeps, TunnelState};
pub use engine::{ConfigEnvelope, EngineAdapter, EngineEnvelope, ProxyEngine, SocketProtect};
pub use interface::{InterfaceHandle, InterfaceProvider, InterfaceSpec, TunnelInterface};
pub use provision::{ConfigProvisioner, FallbackConfig, TunnelConfig};
pub use rebind::{ConnectivityEvent, ConnectivityOs, NetworkHandle, RebindManager, Transport};
pub use watchdog::{StatusSource, SubscriptionStatus, SubscriptionWatchdog};

/// Tunnel-related errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to fetch engine config: {0}")]
    ConfigFetch(String),

    #[error("Malformed config blob: {0}")]
    ConfigDecode(String),

    #[error("Engine config unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("OS denied tunnel interface creation: {0}")]
    InterfaceDenied(String),

    #[error("Engine rejected start: {0}")]
    EngineRejected(String),

    #[error("Engine call failed: {0}")]
    EngineUnreachable(String),

    #[error("Subscription status check failed: {0}")]
    StatusCheck(String),

    #[error("OS denied network rebind: {0}")]
    RebindDenied(String),

    #[error("Subscription is not active")]
    SubscriptionInactive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
