//! Proxy Engine Adapter
//!
//! Wraps the embedded proxy engine behind a narrow interface: building the
//! base64 config envelope the engine expects, registering the
//! socket-protection callback, issuing start/stop, and decoding the
//! engine's response envelope. The engine itself is opaque — it runs its
//! own worker threads and calls back into [`SocketProtect`] while
//! establishing upstream connections.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::{TunnelError, TunnelResult};

/// Config envelope handed to the engine's start entry point.
///
/// Field names are fixed by the engine's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEnvelope {
    /// Path to the engine-specific configuration file
    #[serde(rename = "ConfigPath")]
    pub config_path: String,
    /// Path to the directory holding static routing-data assets
    #[serde(rename = "DatDir")]
    pub dat_dir: String,
}

/// Decoded response from the engine's start call. Consumed once per
/// start attempt.
#[derive(Debug, Deserialize)]
pub struct EngineEnvelope {
    #[serde(default)]
    pub success: bool,
    /// Whatever else the engine reports; kept opaque
    #[serde(flatten)]
    pub detail: serde_json::Value,
}

/// OS socket-protection primitive.
///
/// Marks a socket as exempt from the tunnel's routing rules so the
/// engine's own egress traffic does not loop back into the tunnel it
/// serves. Implementations must be reentrant and non-blocking — the
/// engine calls this from its own worker threads, possibly concurrently.
pub trait SocketProtect: Send + Sync {
    fn protect(&self, socket: i64) -> bool;
}

/// The embedded proxy engine's entry points.
///
/// `run` and `stop` map to the engine's start/stop protocol; errors are
/// reported as opaque strings because the engine's failure modes are not
/// part of its contract.
pub trait ProxyEngine: Send + Sync {
    /// Start the engine with a base64 config envelope. Returns the
    /// engine's base64 response envelope.
    fn run(&self, envelope: &str) -> Result<String, String>;

    /// Stop the engine.
    fn stop(&self) -> Result<(), String>;

    /// Register the socket-protection callback. Called once, before the
    /// first `run`.
    fn register_protector(&self, protector: Arc<dyn SocketProtect>);
}

/// Serialize the two paths into the engine's expected envelope and apply
/// its textual encoding. Pure function.
pub fn build_envelope(config_path: &Path, dat_dir: &Path) -> TunnelResult<String> {
    let envelope = ConfigEnvelope {
        config_path: config_path.to_string_lossy().into_owned(),
        dat_dir: dat_dir.to_string_lossy().into_owned(),
    };
    let json = serde_json::to_string(&envelope)
        .map_err(|e| TunnelError::ConfigDecode(format!("Failed to encode envelope: {}", e)))?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Decode a base64 config envelope back into its two paths.
pub fn decode_envelope(raw: &str) -> TunnelResult<ConfigEnvelope> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| TunnelError::ConfigDecode(format!("Invalid base64: {}", e)))?;
    let json = String::from_utf8(bytes)
        .map_err(|e| TunnelError::ConfigDecode(format!("Envelope is not UTF-8: {}", e)))?;
    serde_json::from_str(&json)
        .map_err(|e| TunnelError::ConfigDecode(format!("Invalid envelope JSON: {}", e)))
}

fn decode_response(raw: &str) -> TunnelResult<EngineEnvelope> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| TunnelError::EngineUnreachable(format!("Malformed engine response: {}", e)))?;
    let json = String::from_utf8(bytes)
        .map_err(|e| TunnelError::EngineUnreachable(format!("Engine response is not UTF-8: {}", e)))?;
    serde_json::from_str(&json)
        .map_err(|e| TunnelError::EngineUnreachable(format!("Invalid engine response JSON: {}", e)))
}

/// Wrapper that keeps the engine boundary safe: failures in the OS
/// primitive are logged and reported as `false`, and panics never cross
/// into the engine's threads.
struct GuardedProtector {
    inner: Arc<dyn SocketProtect>,
}

impl SocketProtect for GuardedProtector {
    fn protect(&self, socket: i64) -> bool {
        let inner = Arc::clone(&self.inner);
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            inner.protect(socket)
        })) {
            Ok(true) => true,
            Ok(false) => {
                // Only failures are logged; success would spam on every upstream dial.
                log::error!("Failed to protect socket {}", socket);
                false
            }
            Err(_) => {
                log::error!("Socket protection panicked for socket {}", socket);
                false
            }
        }
    }
}

/// Adapter owning the start/stop protocol against the embedded engine.
pub struct EngineAdapter {
    engine: Arc<dyn ProxyEngine>,
    protector: Arc<dyn SocketProtect>,
    protector_registered: AtomicBool,
    /// Time to let the engine come up after a successful start call
    settle: Duration,
    /// Engine error-log file surfaced after start, when present
    error_log: Option<std::path::PathBuf>,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn ProxyEngine>, protector: Arc<dyn SocketProtect>) -> Self {
        Self {
            engine,
            protector,
            protector_registered: AtomicBool::new(false),
            settle: Duration::from_secs(1),
            error_log: None,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_error_log(mut self, path: std::path::PathBuf) -> Self {
        self.error_log = Some(path);
        self
    }

    fn ensure_protector_registered(&self) {
        if self
            .protector_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let guarded = Arc::new(GuardedProtector {
                inner: Arc::clone(&self.protector),
            });
            self.engine.register_protector(guarded);
            log::debug!("Socket protector registered with engine");
        }
    }

    /// Start the engine with a transport-ready envelope blob.
    ///
    /// Validates that the referenced config file exists and is readable,
    /// registers the socket protector before the first start, then calls
    /// the engine and decodes its response envelope.
    pub async fn start(&self, raw_envelope: &str) -> TunnelResult<()> {
        let envelope = decode_envelope(raw_envelope)?;

        let config_path = Path::new(&envelope.config_path);
        if std::fs::File::open(config_path).is_err() {
            return Err(TunnelError::ConfigUnavailable(format!(
                "Config file not found or unreadable: {}",
                envelope.config_path
            )));
        }

        self.ensure_protector_registered();

        let raw_response = self
            .engine
            .run(raw_envelope)
            .map_err(TunnelError::EngineUnreachable)?;
        let response = decode_response(&raw_response)?;
        if !response.success {
            return Err(TunnelError::EngineRejected(response.detail.to_string()));
        }

        // Give the engine time to bring its inbounds up
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        self.surface_error_log();
        log::info!("Engine started successfully");
        Ok(())
    }

    /// Stop the engine. Best-effort for the caller: the controller logs a
    /// failure here and proceeds with interface teardown regardless.
    pub fn stop(&self) -> TunnelResult<()> {
        self.engine.stop().map_err(TunnelError::EngineUnreachable)?;
        log::debug!("Engine stop called");
        Ok(())
    }

    fn surface_error_log(&self) {
        let Some(ref path) = self.error_log else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(contents) if !contents.trim().is_empty() => {
                log::error!("Engine error log: {}", contents.trim());
            }
            _ => {}
        }
    }
}
