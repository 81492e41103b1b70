//! Subscription Watchdog
//!
//! While armed, periodically asks an external status source whether the
//! current session is still entitled to run, and signals the controller
//! to stop when it is not. Transient check failures never stop the
//! tunnel — they are logged and the watchdog reschedules.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;

use super::{TunnelError, TunnelResult};

/// How often the entitlement check fires
pub const CHECK_INTERVAL: Duration = Duration::from_secs(900);

/// Result of one entitlement check. Fetched on demand, never cached
/// beyond one tick.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionStatus {
    pub active: bool,
}

/// External status source consumed by the watchdog.
pub trait StatusSource: Send + Sync {
    fn check_status<'a>(&'a self, token: &'a str) -> BoxFuture<'a, TunnelResult<SubscriptionStatus>>;
}

/// HTTP-backed status source.
pub struct ApiStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl ApiStatusSource {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

impl StatusSource for ApiStatusSource {
    fn check_status<'a>(&'a self, token: &'a str) -> BoxFuture<'a, TunnelResult<SubscriptionStatus>> {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct StatusResponse {
                #[serde(rename = "subscriptionIsActive", default)]
                subscription_is_active: bool,
            }

            let url = format!("{}/vpn/status", self.base_url.trim_end_matches('/'));
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "token": token }))
                .send()
                .await
                .map_err(|e| TunnelError::StatusCheck(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TunnelError::StatusCheck(format!("HTTP {}", status)));
            }

            let body: StatusResponse = response
                .json()
                .await
                .map_err(|e| TunnelError::StatusCheck(format!("Bad response: {}", e)))?;
            Ok(SubscriptionStatus {
                active: body.subscription_is_active,
            })
        })
    }
}

/// Periodic entitlement watchdog. Armed only while the tunnel is
/// Running; disarming guarantees no further checks fire and an in-flight
/// check's result is discarded.
pub struct SubscriptionWatchdog {
    source: Arc<dyn StatusSource>,
    interval: Duration,
    armed: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubscriptionWatchdog {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self::with_interval(source, CHECK_INTERVAL)
    }

    pub fn with_interval(source: Arc<dyn StatusSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            armed: Arc::new(AtomicBool::new(false)),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Arm the watchdog for the current session's credential.
    ///
    /// `on_inactive` is invoked (on its own task, so a controller `stop`
    /// inside it can safely disarm this watchdog) when a check reports
    /// the subscription inactive.
    pub fn arm<F, Fut>(&self, token: String, on_inactive: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.armed.store(true, Ordering::SeqCst);

        let armed = Arc::clone(&self.armed);
        let source = Arc::clone(&self.source);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !armed.load(Ordering::SeqCst) {
                    break;
                }

                match source.check_status(&token).await {
                    Ok(status) => {
                        // A check in flight when disarm landed is discarded
                        if !armed.load(Ordering::SeqCst) {
                            break;
                        }
                        if !status.active {
                            log::info!("Subscription no longer active, stopping tunnel");
                            armed.store(false, Ordering::SeqCst);
                            tokio::spawn(on_inactive());
                            break;
                        }
                        log::debug!("Subscription check passed");
                    }
                    Err(e) => {
                        log::warn!("Subscription check failed (will retry): {}", e);
                    }
                }
            }
            log::debug!("Subscription watchdog timer exited");
        });

        *self.task.lock() = Some(handle);
        log::info!("Subscription watchdog armed (interval: {:?})", self.interval);
    }

    /// Disarm. No further checks fire after this returns; the timer task
    /// is aborted even mid-check.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            log::info!("Subscription watchdog disarmed");
        }
    }
}

impl Drop for SubscriptionWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedSource {
        active: AtomicBool,
        checks: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(active: bool) -> Self {
            Self {
                active: AtomicBool::new(active),
                checks: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(active: bool, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(active)
            }
        }
    }

    impl StatusSource for ScriptedSource {
        fn check_status<'a>(
            &'a self,
            _token: &'a str,
        ) -> BoxFuture<'a, TunnelResult<SubscriptionStatus>> {
            Box::pin(async move {
                self.checks.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(SubscriptionStatus {
                    active: self.active.load(Ordering::SeqCst),
                })
            })
        }
    }

    struct FailingSource {
        checks: AtomicUsize,
    }

    impl StatusSource for FailingSource {
        fn check_status<'a>(
            &'a self,
            _token: &'a str,
        ) -> BoxFuture<'a, TunnelResult<SubscriptionStatus>> {
            Box::pin(async move {
                self.checks.fetch_add(1, Ordering::SeqCst);
                Err(TunnelError::StatusCheck("connection reset".to_string()))
            })
        }
    }

    #[tokio::test]
    async fn inactive_status_fires_callback_once() {
        let source = Arc::new(ScriptedSource::new(false));
        let watchdog = SubscriptionWatchdog::with_interval(source.clone(), Duration::from_millis(10));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        watchdog.arm("token".to_string(), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());
        // Timer stopped after firing
        assert_eq!(source.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn active_status_keeps_rescheduling() {
        let source = Arc::new(ScriptedSource::new(true));
        let watchdog = SubscriptionWatchdog::with_interval(source.clone(), Duration::from_millis(5));

        watchdog.arm("token".to_string(), || async {});
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(watchdog.is_armed());
        assert!(source.checks.load(Ordering::SeqCst) >= 2);
        watchdog.disarm();
    }

    #[tokio::test]
    async fn transient_failure_does_not_stop_tunnel() {
        let source = Arc::new(FailingSource {
            checks: AtomicUsize::new(0),
        });
        let watchdog = SubscriptionWatchdog::with_interval(source.clone(), Duration::from_millis(5));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        watchdog.arm("token".to_string(), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Failures logged and rescheduled, never escalated
        assert!(source.checks.load(Ordering::SeqCst) >= 2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_armed());
        watchdog.disarm();
    }

    #[tokio::test]
    async fn disarm_discards_in_flight_check() {
        // Check result arrives well after disarm
        let source = Arc::new(ScriptedSource::slow(false, Duration::from_millis(50)));
        let watchdog = SubscriptionWatchdog::with_interval(source.clone(), Duration::from_millis(5));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        watchdog.arm("token".to_string(), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Let the first check get in flight, then disarm
        tokio::time::sleep(Duration::from_millis(15)).await;
        watchdog.disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!watchdog.is_armed());
    }

    #[tokio::test]
    async fn disarm_without_arm_is_harmless() {
        let watchdog =
            SubscriptionWatchdog::with_interval(Arc::new(ScriptedSource::new(true)), CHECK_INTERVAL);
        watchdog.disarm();
        watchdog.disarm();
        assert!(!watchdog.is_armed());
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let source = Arc::new(ScriptedSource::new(true));
        let watchdog = SubscriptionWatchdog::with_interval(source.clone(), Duration::from_millis(5));

        watchdog.arm("first".to_string(), || async {});
        watchdog.arm("second".to_string(), || async {});
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(watchdog.is_armed());
        watchdog.disarm();
        assert!(!watchdog.is_armed());
    }
}
