//! Configuration storage

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::call::CallConfig;
use crate::platform::{IceServer, TransportConfig};

const ENV_SIGNALING_URL: &str = "DUOCALL_SIGNALING_URL";
const ENV_HANDLE: &str = "DUOCALL_HANDLE";
const ENV_TURN_URL: &str = "DUOCALL_TURN_URL";
const ENV_TURN_USERNAME: &str = "DUOCALL_TURN_USERNAME";
const ENV_TURN_PASSWORD: &str = "DUOCALL_TURN_PASSWORD";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display handle announced to the signaling server
    pub handle: Option<String>,
    /// Signaling gateway (ws:// or wss://)
    pub signaling_url: Option<String>,
    /// STUN/TURN servers handed to the peer transport
    pub ice_servers: Vec<IceServer>,
    /// Seconds an unanswered call keeps ringing
    pub ring_timeout_secs: u64,
    /// Camera to use when a call starts
    pub preferred_camera: Option<String>,
    /// Keep capture running between calls
    pub keep_preview_between_calls: bool,
    /// Virtual camera labels for the synthetic capture provider
    pub synthetic_cameras: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handle: None,
            signaling_url: None,
            ice_servers: IceServer::default_stun(),
            ring_timeout_secs: 45,
            preferred_camera: None,
            keep_preview_between_calls: false,
            synthetic_cameras: vec!["Front Camera".into(), "Back Camera".into()],
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "duocall", "duocall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    /// Load from disk, then apply environment overrides
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // May hold TURN credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Overlay `DUOCALL_*` variables, read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_SIGNALING_URL) {
            self.signaling_url = Some(url);
        }
        if let Some(handle) = non_empty(ENV_HANDLE) {
            self.handle = Some(handle);
        }
        if let Some(turn) = non_empty(ENV_TURN_URL) {
            self.ice_servers.push(IceServer {
                urls: vec![turn],
                username: non_empty(ENV_TURN_USERNAME),
                credential: non_empty(ENV_TURN_PASSWORD),
            });
        }
    }

    /// The configured signaling URL, validated.
    pub fn signaling_url(&self) -> Result<Url> {
        let raw = self
            .signaling_url
            .as_deref()
            .context("No signaling server configured (use --server or DUOCALL_SIGNALING_URL)")?;
        parse_signaling_url(raw)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            transport: self.transport_config(),
            ring_timeout: Duration::from_secs(self.ring_timeout_secs.max(1)),
        }
    }
}

/// Accept only WebSocket URLs.
pub fn parse_signaling_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid signaling URL: {}", raw))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("Signaling URL must use ws:// or wss://, got {}://", other),
    }
    if url.host_str().is_none() {
        bail!("Signaling URL has no host: {}", raw);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ring_timeout_secs, 45);
        assert!(!config.keep_preview_between_calls);
        assert_eq!(config.ice_servers, IceServer::default_stun());
        assert_eq!(config.call_config().ring_timeout, Duration::from_secs(45));
        assert!(config.signaling_url().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
handle = "alice"
signaling_url = "wss://signal.example.com/ws"
ring_timeout_secs = 20
"#,
        )
        .unwrap();
        assert_eq!(config.handle.as_deref(), Some("alice"));
        assert_eq!(config.ring_timeout_secs, 20);
        assert_eq!(config.synthetic_cameras.len(), 2);
        assert_eq!(
            config.signaling_url().unwrap().as_str(),
            "wss://signal.example.com/ws"
        );
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.preferred_camera = Some("cam-back-camera".into());
        config.ice_servers.push(IceServer {
            urls: vec!["turn:turn.example.com:3478".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SIGNALING_URL, "ws://localhost:3000"),
            (ENV_HANDLE, "bob"),
            (ENV_TURN_URL, "turn:turn.example.com:3478"),
            (ENV_TURN_USERNAME, "user"),
            (ENV_TURN_PASSWORD, "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.handle.as_deref(), Some("bob"));
        assert_eq!(config.signaling_url.as_deref(), Some("ws://localhost:3000"));
        let turn = config.ice_servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(turn.credential.as_deref(), Some("secret"));
        assert_eq!(config.transport_config().ice_servers.len(), 2);
    }

    #[test]
    fn test_empty_env_is_ignored() {
        let mut config = Config {
            handle: Some("alice".into()),
            ..Config::default()
        };
        config.apply_env(|k| (k == ENV_HANDLE).then(|| "  ".to_string()));
        assert_eq!(config.handle.as_deref(), Some("alice"));
    }

    #[test]
    fn test_signaling_url_validation() {
        assert!(parse_signaling_url("wss://example.com/socket").is_ok());
        assert!(parse_signaling_url("ws://127.0.0.1:8080").is_ok());
        assert!(parse_signaling_url("https://example.com").is_err());
        assert!(parse_signaling_url("not a url").is_err());
    }
}
