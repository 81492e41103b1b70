//! Settings persistence
//!
//! Saves and loads the user-intended tunnel state to/from disk. The
//! controller does not own this flag — it only emits state transitions;
//! [`sync_enabled_flag`] subscribes and keeps the persisted flag in step.

use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::vpn::connection::TunnelState;

const SETTINGS_FILE: &str = "settings.json";

/// Persisted app settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Whether the user last left the tunnel enabled
    #[serde(default)]
    pub tunnel_enabled: bool,
    /// Last selected country for remote provisioning
    #[serde(default)]
    pub country: Option<String>,
}

impl Settings {
    /// Load settings from `dir`, falling back to defaults on any error.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(SETTINGS_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    error!("Failed to parse settings, using defaults: {}", e);
                    Self::default()
                }
            },
            Err(_) => {
                debug!("No settings file at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SETTINGS_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)?;
        debug!("Settings saved to {}", path.display());
        Ok(())
    }
}

/// Keep the persisted enabled flag in step with tunnel transitions:
/// Running sets it, Idle clears it, transient states are ignored.
pub fn sync_enabled_flag(
    dir: PathBuf,
    mut transitions: tokio::sync::watch::Receiver<TunnelState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while transitions.changed().await.is_ok() {
            let enabled = match &*transitions.borrow_and_update() {
                TunnelState::Running => true,
                TunnelState::Idle => false,
                _ => continue,
            };
            let mut settings = Settings::load(&dir);
            if settings.tunnel_enabled != enabled {
                settings.tunnel_enabled = enabled;
                if let Err(e) = settings.save(&dir) {
                    error!("Failed to persist tunnel_enabled={}: {}", enabled, e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("veilway_settings_{}", name));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let settings = Settings::load(&scratch_dir("missing"));
        assert!(!settings.tunnel_enabled);
        assert!(settings.country.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = scratch_dir("roundtrip");
        let settings = Settings {
            tunnel_enabled: true,
            country: Some("nl".to_string()),
        };
        settings.save(&dir).unwrap();

        let loaded = Settings::load(&dir);
        assert!(loaded.tunnel_enabled);
        assert_eq!(loaded.country.as_deref(), Some("nl"));
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = scratch_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SETTINGS_FILE), "{{{not json").unwrap();
        let settings = Settings::load(&dir);
        assert!(!settings.tunnel_enabled);
    }

    #[tokio::test]
    async fn enabled_flag_follows_transitions() {
        let dir = scratch_dir("sync");
        let (tx, rx) = tokio::sync::watch::channel(TunnelState::Idle);
        let handle = sync_enabled_flag(dir.clone(), rx);

        tx.send(TunnelState::Establishing).unwrap();
        tx.send(TunnelState::Running).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(Settings::load(&dir).tunnel_enabled);

        tx.send(TunnelState::Stopping).unwrap();
        tx.send(TunnelState::Idle).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!Settings::load(&dir).tunnel_enabled);

        drop(tx);
        let _ = handle.await;
    }
}
