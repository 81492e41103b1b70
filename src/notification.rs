//! Tunnel status indicator
//!
//! The host OS requires a persistent, low-priority status indicator for
//! the whole time the tunnel is up to keep the process alive in the
//! background. The controller drives this seam on every start/stop; the
//! actual chrome (notification area, tray, toast) lives outside this
//! crate.

/// Persistent status indicator shown while the tunnel is up.
pub trait StatusNotifier: Send + Sync {
    /// Show (or refresh) the indicator. Stays visible until [`clear`].
    ///
    /// [`clear`]: StatusNotifier::clear
    fn show_active(&self, title: &str, message: &str);

    /// Remove the indicator after teardown.
    fn clear(&self);
}

/// Log-only indicator, used when no display chrome is wired in.
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn show_active(&self, title: &str, message: &str) {
        log::info!("Status indicator shown: {} - {}", title, message);
    }

    fn clear(&self) {
        log::info!("Status indicator cleared");
    }
}
