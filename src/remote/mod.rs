mod http;

pub use http::HttpNegotiationService;

use crate::core::config::AppConfig;
use crate::core::error::ConfigError;
use crate::core::remote::NegotiationService;
use std::sync::Arc;

/// Build the backend client from config.
pub fn create_service(config: &AppConfig) -> Result<Arc<dyn NegotiationService>, ConfigError> {
    let url = config.base_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Invalid(format!(
            "base_url must be an http(s) URL, got '{url}'"
        )));
    }
    if !config.has_api_key() {
        tracing::warn!("NEGOTIATOR_API_KEY not set, requests are sent without authorization");
    }
    Ok(Arc::new(HttpNegotiationService::new(
        url,
        config.api_key.clone(),
    )))
}
