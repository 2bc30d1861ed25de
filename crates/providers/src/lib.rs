//! Upstream model providers for Loopwire.
//!
//! All providers implement the `loopwire_core::Provider` trait. The provider
//! is built once per process from configuration and injected into the agent
//! loop; `retry` supervises each upstream call.

pub mod anthropic;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use loopwire_core::error::ProviderError;
use loopwire_core::provider::Provider;

pub use anthropic::AnthropicProvider;
pub use retry::{RetryPolicy, with_retry};

/// Build the upstream provider from configuration.
pub fn build_from_config(
    config: &loopwire_config::AppConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| ProviderError::NotConfigured("no API key configured".into()))?;

    let provider = AnthropicProvider::new(
        api_key,
        Duration::from_secs(config.provider.timeout_secs),
    )?
    .with_base_url(&config.provider.base_url);

    Ok(Arc::new(provider))
}
