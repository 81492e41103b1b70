//! Config Provisioner
//!
//! Turns a remote or fallback engine configuration into a validated
//! on-disk artifact plus an asset directory. Two named routing-data
//! assets must be present in the asset directory before engine start; if
//! absent they are copied from a bundled location. Asset copy failure is
//! reported but never aborts provisioning.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::engine::ConfigEnvelope;
use super::{TunnelError, TunnelResult};

/// File name of the provisioned engine config
const CONFIG_FILE: &str = "vpn_config.json";
/// Directory holding static routing-data assets
const ASSET_DIR: &str = "dat_files";
/// Assets the engine expects before start
const ASSET_FILES: [&str; 2] = ["geoip.dat", "geosite.dat"];

/// Paths to a provisioned engine configuration. Immutable once
/// constructed; owned by the engine adapter for one tunnel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub engine_config_path: PathBuf,
    pub asset_dir_path: PathBuf,
}

/// Remote provisioning response. Only the fields consumed here are
/// modeled; the service's contract is otherwise out of scope.
#[derive(Debug, Deserialize)]
pub struct RemoteConfigResponse {
    #[serde(rename = "subscriptionIsActive", default)]
    pub subscription_is_active: bool,
    #[serde(default)]
    pub config: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConfigRequest<'a> {
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
}

/// Degraded-mode engine configuration used when remote provisioning
/// fails: a fixed local SOCKS inbound routed wholesale to a fixed
/// upstream proxy outbound. The upstream endpoint is a configuration
/// value, not a design requirement — swap it per deployment.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub socks_port: u16,
    pub upstream_address: String,
    pub upstream_port: u16,
    pub upstream_user_id: String,
    pub dns_servers: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            socks_port: 10808,
            upstream_address: "95.216.125.17".to_string(),
            upstream_port: 443,
            upstream_user_id: "b37458f5-8efa-418c-9f9f-0cfbbf41e5fe".to_string(),
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
        }
    }
}

impl FallbackConfig {
    /// Render the fallback as an engine config document.
    pub fn render(&self) -> String {
        serde_json::json!({
            "log": { "loglevel": "warning" },
            "dns": { "servers": self.dns_servers },
            "inbounds": [
                {
                    "port": self.socks_port,
                    "protocol": "socks",
                    "settings": { "auth": "noauth", "udp": true, "ip": "127.0.0.1" },
                    "tag": "socks-in"
                }
            ],
            "outbounds": [
                {
                    "protocol": "vless",
                    "settings": {
                        "vnext": [
                            {
                                "address": self.upstream_address,
                                "port": self.upstream_port,
                                "users": [
                                    { "id": self.upstream_user_id, "encryption": "none" }
                                ]
                            }
                        ]
                    },
                    "tag": "proxy"
                }
            ],
            "routing": {
                "domainStrategy": "IPIfNonMatch",
                "rules": [
                    { "type": "field", "inboundTag": ["socks-in"], "outboundTag": "proxy" }
                ]
            }
        })
        .to_string()
    }
}

/// Fetch an engine config from the remote service.
///
/// An inactive subscription is a hard refusal — no fallback. Any other
/// failure degrades to the fallback config so the tunnel can still
/// establish.
pub async fn fetch_engine_config(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    country: Option<&str>,
    fallback: &FallbackConfig,
) -> TunnelResult<String> {
    match fetch_remote(client, base_url, token, country).await {
        Ok(response) => {
            if !response.subscription_is_active {
                return Err(TunnelError::SubscriptionInactive);
            }
            response.config.ok_or_else(|| {
                TunnelError::ConfigFetch("Remote response carried no config".to_string())
            })
        }
        Err(e) => {
            log::warn!("Remote provisioning failed, using fallback config: {}", e);
            Ok(fallback.render())
        }
    }
}

async fn fetch_remote(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    country: Option<&str>,
) -> TunnelResult<RemoteConfigResponse> {
    let url = format!("{}/vpn/config", base_url.trim_end_matches('/'));
    log::info!("Fetching engine config (country: {:?})", country);

    let response = client
        .post(&url)
        .json(&ConfigRequest { token, country })
        .send()
        .await
        .map_err(|e| TunnelError::ConfigFetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TunnelError::ConfigFetch(format!("HTTP {}: {}", status, body)));
    }

    response
        .json()
        .await
        .map_err(|e| TunnelError::ConfigFetch(format!("Failed to parse response: {}", e)))
}

/// Writes and validates engine configs under the app data directory.
pub struct ConfigProvisioner {
    data_dir: PathBuf,
    bundled_asset_dir: Option<PathBuf>,
}

impl ConfigProvisioner {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            bundled_asset_dir: None,
        }
    }

    /// Provisioner rooted at the platform data directory.
    pub fn from_platform_dirs(app_name: &str) -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(app_name))
    }

    /// Well-known location the bundled assets ship in.
    pub fn with_bundled_assets(mut self, dir: PathBuf) -> Self {
        self.bundled_asset_dir = Some(dir);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Persist an engine config document and prepare the asset directory.
    ///
    /// The document must be valid JSON; anything else is a
    /// [`TunnelError::ConfigDecode`].
    pub fn provision(&self, engine_config: &str) -> TunnelResult<TunnelConfig> {
        serde_json::from_str::<serde_json::Value>(engine_config)
            .map_err(|e| TunnelError::ConfigDecode(format!("Engine config is not valid JSON: {}", e)))?;

        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE);
        fs::write(&config_path, engine_config)?;
        log::info!("Engine config written to {}", config_path.display());

        let asset_dir = self.ensure_asset_dir()?;
        Ok(TunnelConfig {
            engine_config_path: config_path,
            asset_dir_path: asset_dir,
        })
    }

    /// Validate a provisioning request referencing an already-written
    /// config: the file must exist, be readable, and hold valid JSON.
    pub fn validate(&self, request: &ConfigEnvelope) -> TunnelResult<TunnelConfig> {
        let config_path = PathBuf::from(&request.config_path);
        let contents = fs::read_to_string(&config_path).map_err(|e| {
            TunnelError::ConfigUnavailable(format!(
                "Config file not found or unreadable: {}: {}",
                config_path.display(),
                e
            ))
        })?;
        serde_json::from_str::<serde_json::Value>(&contents)
            .map_err(|e| TunnelError::ConfigDecode(format!("Engine config is not valid JSON: {}", e)))?;

        let asset_dir = PathBuf::from(&request.dat_dir);
        fs::create_dir_all(&asset_dir)?;
        self.copy_assets(&asset_dir);

        Ok(TunnelConfig {
            engine_config_path: config_path,
            asset_dir_path: asset_dir,
        })
    }

    fn ensure_asset_dir(&self) -> TunnelResult<PathBuf> {
        let asset_dir = self.data_dir.join(ASSET_DIR);
        fs::create_dir_all(&asset_dir)?;
        self.copy_assets(&asset_dir);
        Ok(asset_dir)
    }

    /// Copy the named assets from the bundled location when absent. Copy
    /// failure is reported but does not abort provisioning.
    fn copy_assets(&self, asset_dir: &Path) {
        for name in ASSET_FILES {
            let target = asset_dir.join(name);
            if target.exists() {
                continue;
            }
            let Some(ref bundled) = self.bundled_asset_dir else {
                log::debug!("No bundled asset location for {}", name);
                continue;
            };
            let source = bundled.join(name);
            match fs::copy(&source, &target) {
                Ok(_) => log::info!("Copied asset {} into {}", name, asset_dir.display()),
                Err(e) => log::warn!("Failed to copy {}: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("veilway_provision_{}", name));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn provision_writes_config_and_assets_dir() {
        let provisioner = ConfigProvisioner::new(scratch_dir("write"));
        let config = provisioner.provision(r#"{"inbounds":[]}"#).unwrap();

        assert!(config.engine_config_path.exists());
        assert!(config.asset_dir_path.is_dir());
        assert!(config.engine_config_path.ends_with(CONFIG_FILE));
    }

    #[test]
    fn provision_rejects_invalid_json() {
        let provisioner = ConfigProvisioner::new(scratch_dir("invalid"));
        let err = provisioner.provision("not json at all").unwrap_err();
        assert!(matches!(err, TunnelError::ConfigDecode(_)));
    }

    #[test]
    fn validate_fails_for_missing_file() {
        let provisioner = ConfigProvisioner::new(scratch_dir("missing"));
        let request = ConfigEnvelope {
            config_path: "/nonexistent/veilway_nope.json".to_string(),
            dat_dir: std::env::temp_dir()
                .join("veilway_assets_missing")
                .to_string_lossy()
                .into_owned(),
        };
        let err = provisioner.validate(&request).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigUnavailable(_)));
    }

    #[test]
    fn validate_accepts_provisioned_config() {
        let provisioner = ConfigProvisioner::new(scratch_dir("roundtrip"));
        let config = provisioner.provision("{}").unwrap();
        let request = ConfigEnvelope {
            config_path: config.engine_config_path.to_string_lossy().into_owned(),
            dat_dir: config.asset_dir_path.to_string_lossy().into_owned(),
        };
        let validated = provisioner.validate(&request).unwrap();
        assert_eq!(validated, config);
    }

    #[test]
    fn assets_copied_from_bundled_location() {
        let bundled = scratch_dir("bundled_src");
        fs::create_dir_all(&bundled).unwrap();
        for name in ASSET_FILES {
            fs::write(bundled.join(name), b"data").unwrap();
        }

        let provisioner =
            ConfigProvisioner::new(scratch_dir("bundled")).with_bundled_assets(bundled);
        let config = provisioner.provision("{}").unwrap();

        for name in ASSET_FILES {
            assert!(config.asset_dir_path.join(name).exists(), "missing {}", name);
        }
    }

    #[test]
    fn missing_bundled_assets_do_not_abort_provisioning() {
        let provisioner = ConfigProvisioner::new(scratch_dir("no_bundle"))
            .with_bundled_assets(PathBuf::from("/nonexistent/bundle"));
        // Copy fails for both assets, provisioning still succeeds
        assert!(provisioner.provision("{}").is_ok());
    }

    #[test]
    fn fallback_config_is_valid_engine_json() {
        let rendered = FallbackConfig::default().render();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["inbounds"][0]["port"], 10808);
        assert_eq!(value["inbounds"][0]["protocol"], "socks");
        assert_eq!(value["routing"]["rules"][0]["outboundTag"], "proxy");
    }

    #[test]
    fn fallback_endpoint_is_configurable() {
        let mut fallback = FallbackConfig::default();
        fallback.upstream_address = "203.0.113.9".to_string();
        fallback.socks_port = 1080;
        let value: serde_json::Value = serde_json::from_str(&fallback.render()).unwrap();
        assert_eq!(
            value["outbounds"][0]["settings"]["vnext"][0]["address"],
            "203.0.113.9"
        );
        assert_eq!(value["inbounds"][0]["port"], 1080);
    }
}
