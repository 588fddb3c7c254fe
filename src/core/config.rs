use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::error::ConfigError;

/// Default negotiation backend
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Bearer key for the negotiation backend
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub negotiation: NegotiationConfig,

    #[serde(default)]
    pub debug: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            data_dir: default_data_dir(),
            api_key: None,
            base_url: default_base_url(),
            negotiation: NegotiationConfig::default(),
            debug: false,
        }
    }
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_data_dir() -> String {
    ".negotiator".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Price floor; offers below it are clamped up
    #[serde(default = "default_min_price_cents")]
    pub min_price_cents: u64,

    /// Number of distinct offers after which the trial fallback fires
    #[serde(default = "default_max_offers")]
    pub max_offers: usize,

    /// Quiescence window for background sync
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,

    /// An owner silent for longer than this may be displaced by a new claim
    #[serde(default = "default_owner_timeout_secs")]
    pub owner_timeout_secs: u64,

    /// How often the store is re-read for writes made by other processes
    #[serde(default = "default_store_poll_ms")]
    pub store_poll_ms: u64,

    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_min_price_cents() -> u64 {
    100
}

fn default_max_offers() -> usize {
    6
}

fn default_sync_debounce_ms() -> u64 {
    1_500
}

fn default_owner_timeout_secs() -> u64 {
    1_800
}

fn default_store_poll_ms() -> u64 {
    500
}

fn default_storage_key() -> String {
    "negotiation_session".into()
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            min_price_cents: default_min_price_cents(),
            max_offers: default_max_offers(),
            sync_debounce_ms: default_sync_debounce_ms(),
            owner_timeout_secs: default_owner_timeout_secs(),
            store_poll_ms: default_store_poll_ms(),
            storage_key: default_storage_key(),
        }
    }
}

pub fn load_config(working_dir: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let wd = working_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let mut config = AppConfig {
        working_dir: wd.clone(),
        ..AppConfig::default()
    };

    // Global config
    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("negotiator").join("config.json");
        if global_path.exists() {
            merge_config(&mut config, read_config_file(&global_path)?);
        }
    }

    // Local project config
    let local_path = wd.join("negotiator.json");
    if local_path.exists() {
        merge_config(&mut config, read_config_file(&local_path)?);
    }

    detect_env(&mut config);
    validate(&config)?;

    Ok(config)
}

fn read_config_file(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))
}

pub(crate) fn merge_config(base: &mut AppConfig, overlay: AppConfig) {
    if overlay.api_key.is_some() {
        base.api_key = overlay.api_key;
    }
    if overlay.base_url != default_base_url() {
        base.base_url = overlay.base_url;
    }
    if overlay.data_dir != default_data_dir() {
        base.data_dir = overlay.data_dir;
    }
    if overlay.debug {
        base.debug = true;
    }

    let (b, o) = (&mut base.negotiation, overlay.negotiation);
    if o.min_price_cents != default_min_price_cents() {
        b.min_price_cents = o.min_price_cents;
    }
    if o.max_offers != default_max_offers() {
        b.max_offers = o.max_offers;
    }
    if o.sync_debounce_ms != default_sync_debounce_ms() {
        b.sync_debounce_ms = o.sync_debounce_ms;
    }
    if o.owner_timeout_secs != default_owner_timeout_secs() {
        b.owner_timeout_secs = o.owner_timeout_secs;
    }
    if o.store_poll_ms != default_store_poll_ms() {
        b.store_poll_ms = o.store_poll_ms;
    }
    if o.storage_key != default_storage_key() {
        b.storage_key = o.storage_key;
    }
}

fn detect_env(config: &mut AppConfig) {
    if config.api_key.is_none() {
        if let Ok(key) = std::env::var("NEGOTIATOR_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
    }
    if let Ok(url) = std::env::var("NEGOTIATOR_BASE_URL") {
        if !url.is_empty() {
            config.base_url = url;
        }
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.negotiation.min_price_cents == 0 {
        return Err(ConfigError::Invalid("min_price_cents must be positive".into()));
    }
    if config.negotiation.max_offers == 0 {
        return Err(ConfigError::Invalid("max_offers must be positive".into()));
    }
    if config.negotiation.store_poll_ms == 0 {
        return Err(ConfigError::Invalid("store_poll_ms must be positive".into()));
    }
    if config.negotiation.storage_key.trim().is_empty() {
        return Err(ConfigError::Invalid("storage_key must not be empty".into()));
    }
    Ok(())
}

impl AppConfig {
    pub fn data_path(&self) -> PathBuf {
        self.working_dir.join(&self.data_dir)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }
}
