use std::sync::Arc;
use std::time::Duration;

use deckhand_core::config::LlmConfig;
use deckhand_core::domain::organization::ProviderId;

use super::{AnthropicProvider, BedrockProvider, LlmProvider};

/// Builds provider handles. Construction never fails; a backend without
/// credentials reports `is_available() == false` instead.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, provider_id: ProviderId) -> Arc<dyn LlmProvider>;
}

pub struct ConfiguredProviderFactory {
    config: LlmConfig,
    client: reqwest::Client,
}

impl ConfiguredProviderFactory {
    pub fn new(config: LlmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }
}

impl ProviderFactory for ConfiguredProviderFactory {
    fn create(&self, provider_id: ProviderId) -> Arc<dyn LlmProvider> {
        match provider_id {
            ProviderId::Anthropic => {
                Arc::new(AnthropicProvider::new(self.config.anthropic.clone(), self.client.clone()))
            }
            ProviderId::Bedrock => {
                Arc::new(BedrockProvider::new(
                    self.config.bedrock.clone(),
                    Duration::from_secs(self.config.timeout_secs),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use deckhand_core::config::AppConfig;
    use deckhand_core::domain::organization::ProviderId;

    use super::{ConfiguredProviderFactory, ProviderFactory};

    #[test]
    fn creates_handles_for_each_backend() {
        let config = AppConfig::default();
        let factory = ConfiguredProviderFactory::new(config.llm).expect("client");

        let default = factory.create(ProviderId::Anthropic);
        assert_eq!(default.id(), ProviderId::Anthropic);
        assert!(!default.is_available());

        let premium = factory.create(ProviderId::Bedrock);
        assert_eq!(premium.id(), ProviderId::Bedrock);
        assert_eq!(premium.metadata().model, "anthropic.claude-3-5-sonnet-20241022-v2:0");
    }
}
