use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::db::{DbCampaign, OutreachDb};
use crate::error::EngineError;
use crate::follow_up::{self, Activation};
use crate::platform::PlatformClient;
use crate::send_window::SendWindow;
use crate::types::Config;

/// Shared by the Dispatcher and the Acceptance Poller.
pub struct EngineState {
    pub config: Config,
    /// Never held across an `.await`.
    pub db: Mutex<OutreachDb>,
    pub platform: Arc<dyn PlatformClient>,
    pub send_window: Option<SendWindow>,
    /// Wakes the Dispatcher before its next tick (e.g. after activation).
    pub dispatcher_wake: Notify,
    pub poller_wake: Notify,
}

impl EngineState {
    pub fn new(
        config: Config,
        db: OutreachDb,
        platform: Arc<dyn PlatformClient>,
    ) -> Result<Self, EngineError> {
        let send_window = config
            .send_window
            .as_ref()
            .map(SendWindow::from_config)
            .transpose()?;
        Ok(Self {
            config,
            db: Mutex::new(db),
            platform,
            send_window,
            dispatcher_wake: Notify::new(),
            poller_wake: Notify::new(),
        })
    }

    /// Activate a campaign with the configured invite spacing and wake the
    /// Dispatcher so due invites go out without waiting for the next tick.
    pub fn activate_campaign(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Activation, EngineError> {
        let minutes = self.config.activation.invite_spacing_minutes;
        let spacing = chrono::Duration::try_minutes(minutes)
            .filter(|d| *d >= chrono::Duration::zero())
            .ok_or_else(|| EngineError::Config(format!("Invalid invite spacing: {} minutes", minutes)))?;
        let activation = follow_up::activate_campaign(&self.db.lock(), campaign_id, now, spacing)?;
        self.dispatcher_wake.notify_one();
        Ok(activation)
    }

    pub fn pause_campaign(&self, campaign_id: &str) -> Result<DbCampaign, EngineError> {
        Ok(follow_up::pause_campaign(&self.db.lock(), campaign_id)?)
    }
}

/// Config file location: `$OUTREACH_CONFIG`, else `~/.outreach-engine/config.json`.
pub fn config_path() -> Result<PathBuf, EngineError> {
    if let Ok(path) = std::env::var("OUTREACH_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".outreach-engine").join("config.json"))
}

/// Load configuration and apply secrets from the environment.
pub fn load_config() -> Result<Config, EngineError> {
    let mut config = load_config_from(&config_path()?)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Parse a config file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, EngineError> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read config: {}", e)))?;
    serde_json::from_str(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
}

/// `OUTREACH_PLATFORM_API_KEY` and `OUTREACH_PROXY_PASSWORD` win over the file.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup("OUTREACH_PLATFORM_API_KEY").filter(|v| !v.is_empty()) {
        config.platform.api_key = Some(key);
    }
    if let Some(password) = lookup("OUTREACH_PROXY_PASSWORD").filter(|v| !v.is_empty()) {
        match config.proxy.as_mut() {
            Some(proxy) => proxy.password = password,
            None => log::warn!("OUTREACH_PROXY_PASSWORD is set but no proxy is configured"),
        }
    }
}
