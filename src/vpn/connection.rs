//! Tunnel Lifecycle Controller
//!
//! Top-level state machine composing provisioning, interface creation,
//! engine start/stop, the subscription watchdog and the rebind manager.
//! This is the only component that accepts `start`/`stop` commands.
//!
//! All state transitions are serialized through one operation guard: a
//! `start` while Establishing or Running and a `stop` while Idle are
//! no-ops; any failure mid-start rolls back fully (interface closed,
//! engine stopped if it was started, network binding reset) before the
//! state settles on Idle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::notification::{LogNotifier, StatusNotifier};

use super::engine::{self, ConfigEnvelope, EngineAdapter, ProxyEngine, SocketProtect};
use super::interface::{InterfaceHandle, InterfaceProvider, InterfaceSpec};
use super::provision::{ConfigProvisioner, TunnelConfig};
use super::rebind::{ConnectivityOs, RebindManager};
use super::watchdog::{self, StatusSource, SubscriptionWatchdog};
use super::TunnelResult;

/// Tunnel state. Single instance per controller; every transition is
/// observable through [`TunnelController::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    Idle,
    Establishing,
    Running,
    Stopping,
    Failed(String),
}

impl TunnelState {
    pub fn is_idle(&self) -> bool {
        matches!(self, TunnelState::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            TunnelState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            TunnelState::Idle => "Idle",
            TunnelState::Establishing => "Establishing tunnel...",
            TunnelState::Running => "Running",
            TunnelState::Stopping => "Stopping...",
            TunnelState::Failed(_) => "Failed",
        }
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        TunnelState::Idle
    }
}

/// Commands accepted by the controller.
#[derive(Debug, Clone)]
pub enum Command {
    /// Start the tunnel from a base64 config envelope
    Start { config: String },
    Stop,
}

/// Collaborators and knobs for a [`TunnelController`].
pub struct TunnelDeps {
    pub engine: Arc<dyn ProxyEngine>,
    pub protect: Arc<dyn SocketProtect>,
    pub provisioner: ConfigProvisioner,
    pub interfaces: Arc<dyn InterfaceProvider>,
    pub status_source: Arc<dyn StatusSource>,
    pub connectivity: Arc<dyn ConnectivityOs>,
    pub notifier: Arc<dyn StatusNotifier>,
    /// Session credential handed to the watchdog's status checks
    pub credential: String,
    pub interface_spec: InterfaceSpec,
    pub check_interval: Duration,
    pub engine_settle: Duration,
    pub engine_error_log: Option<PathBuf>,
}

impl TunnelDeps {
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        protect: Arc<dyn SocketProtect>,
        provisioner: ConfigProvisioner,
        interfaces: Arc<dyn InterfaceProvider>,
        status_source: Arc<dyn StatusSource>,
        connectivity: Arc<dyn ConnectivityOs>,
    ) -> Self {
        Self {
            engine,
            protect,
            provisioner,
            interfaces,
            status_source,
            connectivity,
            notifier: Arc::new(LogNotifier),
            credential: String::new(),
            interface_spec: InterfaceSpec::default(),
            check_interval: watchdog::CHECK_INTERVAL,
            engine_settle: Duration::from_secs(1),
            engine_error_log: None,
        }
    }

    pub fn with_credential(mut self, credential: String) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_interface_spec(mut self, spec: InterfaceSpec) -> Self {
        self.interface_spec = spec;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_engine_settle(mut self, settle: Duration) -> Self {
        self.engine_settle = settle;
        self
    }

    pub fn with_engine_error_log(mut self, path: PathBuf) -> Self {
        self.engine_error_log = Some(path);
        self
    }
}

/// Per-session resources, owned under the operation guard. The config
/// handle exists exactly while the state is Establishing/Running/Stopping;
/// the interface handle exists iff Running or Stopping.
#[derive(Default)]
struct SessionSlot {
    config: Option<TunnelConfig>,
    interface: Option<InterfaceHandle>,
    /// The engine's start entry point was invoked for this session
    engine_started: bool,
}

struct ControllerInner {
    state: watch::Sender<TunnelState>,
    /// Serializes start/stop and owns the session resources
    op_guard: Mutex<SessionSlot>,
    /// Bumped on every successful start; late callbacks compare against it
    generation: Arc<AtomicU64>,
    adapter: EngineAdapter,
    provisioner: ConfigProvisioner,
    interfaces: Arc<dyn InterfaceProvider>,
    interface_spec: InterfaceSpec,
    watchdog: SubscriptionWatchdog,
    rebind: RebindManager,
    notifier: Arc<dyn StatusNotifier>,
    credential: String,
}

/// Cheaply cloneable handle to the one tunnel controller of the process.
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<ControllerInner>,
}

impl TunnelController {
    pub fn new(deps: TunnelDeps) -> Self {
        let generation = Arc::new(AtomicU64::new(0));

        let mut adapter =
            EngineAdapter::new(deps.engine, deps.protect).with_settle(deps.engine_settle);
        if let Some(path) = deps.engine_error_log {
            adapter = adapter.with_error_log(path);
        }

        let watchdog = SubscriptionWatchdog::with_interval(deps.status_source, deps.check_interval);
        let rebind = RebindManager::new(deps.connectivity, Arc::clone(&generation));
        let (state, _) = watch::channel(TunnelState::Idle);

        Self {
            inner: Arc::new(ControllerInner {
                state,
                op_guard: Mutex::new(SessionSlot::default()),
                generation,
                adapter,
                provisioner: deps.provisioner,
                interfaces: deps.interfaces,
                interface_spec: deps.interface_spec,
                watchdog,
                rebind,
                notifier: deps.notifier,
                credential: deps.credential,
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state.borrow().clone()
    }

    /// Observe every state transition. The controller only emits; it does
    /// not own any downstream state (persisted flags, UI indicators).
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Current session generation; bumped on every successful start.
    pub fn session_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub async fn handle_command(&self, command: Command) -> TunnelResult<TunnelState> {
        match command {
            Command::Start { config } => self.start(&config).await,
            Command::Stop => {
                self.stop().await?;
                Ok(self.state())
            }
        }
    }

    /// Start the tunnel from a base64 config envelope.
    ///
    /// Already Establishing or Running: no-op, returns the current state.
    /// Any failure mid-start rolls back fully and surfaces one error;
    /// the state settles on Idle.
    pub async fn start(&self, raw_config: &str) -> TunnelResult<TunnelState> {
        // An undecodable blob is rejected before any state is touched
        let request = engine::decode_envelope(raw_config)?;

        let mut slot = self.inner.op_guard.lock().await;
        let current = self.state();
        if matches!(current, TunnelState::Establishing | TunnelState::Running) {
            log::info!("Start ignored: tunnel already {:?}", current);
            return Ok(current);
        }

        log::info!("Starting tunnel");
        self.set_state(TunnelState::Establishing);

        match self.establish(&request, &mut slot).await {
            Ok(()) => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                self.set_state(TunnelState::Running);
                self.inner
                    .notifier
                    .show_active("Tunnel active", "Traffic routed through proxy engine");

                let controller = self.clone();
                self.inner
                    .watchdog
                    .arm(self.inner.credential.clone(), move || async move {
                        if let Err(e) = controller.stop().await {
                            log::warn!("Watchdog-initiated stop failed: {}", e);
                        }
                    });

                log::info!("Tunnel started successfully");
                Ok(TunnelState::Running)
            }
            Err(e) => {
                log::error!("Tunnel start failed: {}", e);
                self.rollback(&mut slot);
                self.set_state(TunnelState::Failed(e.to_string()));
                self.set_state(TunnelState::Idle);
                Err(e)
            }
        }
    }

    /// Stop the tunnel. Idempotent: returns immediately while Idle.
    ///
    /// Individual cleanup failures (engine stop, interface close, rebind)
    /// are logged and swallowed — the state always reaches Idle.
    pub async fn stop(&self) -> TunnelResult<()> {
        let mut slot = self.inner.op_guard.lock().await;
        if self.state().is_idle() {
            log::debug!("Stop ignored: tunnel already idle");
            return Ok(());
        }

        log::info!("Stopping tunnel");
        self.set_state(TunnelState::Stopping);
        self.inner.watchdog.disarm();

        if slot.engine_started {
            if let Err(e) = self.inner.adapter.stop() {
                log::warn!("Engine stop failed (continuing cleanup): {}", e);
            }
            slot.engine_started = false;
        }
        if let Some(interface) = slot.interface.take() {
            interface.close();
        }
        if let Err(e) = self.inner.rebind.reset_and_rebind() {
            log::warn!("Network rebind failed (non-fatal): {}", e);
        }
        slot.config = None;

        self.inner.notifier.clear();
        self.set_state(TunnelState::Idle);
        log::info!("Tunnel stopped");
        Ok(())
    }

    async fn establish(
        &self,
        request: &ConfigEnvelope,
        slot: &mut SessionSlot,
    ) -> TunnelResult<()> {
        let config = self.inner.provisioner.validate(request)?;
        let envelope =
            engine::build_envelope(&config.engine_config_path, &config.asset_dir_path)?;
        slot.config = Some(config);

        let interface = self.inner.interfaces.create(&self.inner.interface_spec)?;
        log::info!("Tunnel interface {} ready", interface.name());
        slot.interface = Some(interface);

        slot.engine_started = true;
        self.inner.adapter.start(&envelope).await?;
        Ok(())
    }

    /// Undo a partial start: stop the engine if it was started, close the
    /// interface if it was opened, reset the network binding. Leaves no
    /// armed watchdog behind (it is only armed after full success).
    fn rollback(&self, slot: &mut SessionSlot) {
        if slot.engine_started {
            if let Err(e) = self.inner.adapter.stop() {
                log::warn!("Engine stop during rollback failed: {}", e);
            }
            slot.engine_started = false;
        }
        if let Some(interface) = slot.interface.take() {
            interface.close();
        }
        if let Err(e) = self.inner.rebind.reset_and_rebind() {
            log::warn!("Network rebind during rollback failed: {}", e);
        }
        slot.config = None;
    }

    fn set_state(&self, state: TunnelState) {
        log::info!("Tunnel state: {:?}", state);
        self.inner.state.send_replace(state);
    }
}
