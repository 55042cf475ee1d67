//! Per-organization provider selection and caching.
//!
//! An organization runs on the premium runtime only when it asked for it,
//! its plan tier qualifies, and the runtime has credentials. Every other
//! case degrades to the default provider with a logged reason; selection
//! itself never fails unless lookup errors are configured to fail closed.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use deckhand_core::config::LlmConfig;
use deckhand_core::domain::organization::{Organization, OrganizationId, PlanTier, ProviderId};
use deckhand_db::repositories::OrganizationRepository;
use deckhand_db::RepositoryError;

use crate::llm::{LlmProvider, ProviderFactory};

pub const DEFAULT_PROVIDER: ProviderId = ProviderId::Anthropic;
pub const PREMIUM_PROVIDER: ProviderId = ProviderId::Bedrock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    PreferenceAbsent,
    TierInsufficient,
    PremiumUnavailable,
    OrganizationNotFound,
    LookupFailed,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreferenceAbsent => "preference_absent",
            Self::TierInsufficient => "tier_insufficient",
            Self::PremiumUnavailable => "premium_unavailable",
            Self::OrganizationNotFound => "organization_not_found",
            Self::LookupFailed => "lookup_failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProviderDecision {
    pub provider_id: ProviderId,
    pub fallback: Option<FallbackReason>,
}

/// Pure selection rule. `premium_available` is only consulted once the
/// preference and tier checks pass.
pub fn decide(
    organization: &Organization,
    premium_min_tier: PlanTier,
    premium_available: impl FnOnce() -> bool,
) -> ProviderDecision {
    let fallback = |reason| ProviderDecision { provider_id: DEFAULT_PROVIDER, fallback: Some(reason) };

    match organization.provider_preference {
        None => fallback(FallbackReason::PreferenceAbsent),
        Some(preference) if !preference.is_premium() => {
            ProviderDecision { provider_id: preference, fallback: None }
        }
        Some(_) if !organization.plan_tier.meets(premium_min_tier) => {
            fallback(FallbackReason::TierInsufficient)
        }
        Some(_) if !premium_available() => fallback(FallbackReason::PremiumUnavailable),
        Some(preference) => ProviderDecision { provider_id: preference, fallback: None },
    }
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("organization {organization_id} could not be loaded: {source}")]
    Lookup {
        organization_id: OrganizationId,
        #[source]
        source: RepositoryError,
    },
}

pub struct ProviderSelector {
    organizations: Arc<dyn OrganizationRepository>,
    factory: Arc<dyn ProviderFactory>,
    premium_min_tier: PlanTier,
    fail_open_on_lookup_error: bool,
    cache: RwLock<HashMap<OrganizationId, Arc<dyn LlmProvider>>>,
}

impl ProviderSelector {
    pub fn new(
        organizations: Arc<dyn OrganizationRepository>,
        factory: Arc<dyn ProviderFactory>,
        config: &LlmConfig,
    ) -> Self {
        Self {
            organizations,
            factory,
            premium_min_tier: config.premium_min_tier,
            fail_open_on_lookup_error: config.fail_open_on_lookup_error,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn select(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Arc<dyn LlmProvider>, SelectionError> {
        if let Some(provider) = self.cache.read().await.get(organization_id) {
            return Ok(Arc::clone(provider));
        }

        let organization = match self.organizations.find_by_id(organization_id).await {
            Ok(Some(organization)) => organization,
            Ok(None) => {
                self.log_fallback(organization_id, FallbackReason::OrganizationNotFound);
                return Ok(self.factory.create(DEFAULT_PROVIDER));
            }
            Err(source) if self.fail_open_on_lookup_error => {
                warn!(
                    event_name = "provider.selection.lookup_failed",
                    organization_id = %organization_id,
                    error = %source,
                    "organization lookup failed, using default provider"
                );
                self.log_fallback(organization_id, FallbackReason::LookupFailed);
                return Ok(self.factory.create(DEFAULT_PROVIDER));
            }
            Err(source) => {
                return Err(SelectionError::Lookup { organization_id: organization_id.clone(), source })
            }
        };

        let mut premium = None;
        let decision = decide(&organization, self.premium_min_tier, || {
            let candidate = self.factory.create(PREMIUM_PROVIDER);
            let available = candidate.is_available();
            premium = Some(candidate);
            available
        });

        let provider = match (decision.provider_id, premium) {
            (id, Some(candidate)) if id == PREMIUM_PROVIDER => candidate,
            (id, _) => self.factory.create(id),
        };
        match decision.fallback {
            Some(reason) => self.log_fallback(organization_id, reason),
            None => info!(
                event_name = "provider.selected",
                organization_id = %organization_id,
                provider = %provider.id(),
                "provider selected"
            ),
        }

        let mut cache = self.cache.write().await;
        let cached = cache.entry(organization_id.clone()).or_insert(provider);
        Ok(Arc::clone(cached))
    }

    /// Drops the cached handle so the next selection re-reads settings.
    pub async fn invalidate(&self, organization_id: &OrganizationId) -> bool {
        let removed = self.cache.write().await.remove(organization_id).is_some();
        info!(
            event_name = "provider.cache.invalidated",
            organization_id = %organization_id,
            removed,
            "provider cache entry invalidated"
        );
        removed
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    fn log_fallback(&self, organization_id: &OrganizationId, reason: FallbackReason) {
        info!(
            event_name = "provider.selection.fallback",
            organization_id = %organization_id,
            provider = %DEFAULT_PROVIDER,
            reason = reason.as_str(),
            "using default provider"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use deckhand_core::config::AppConfig;
    use deckhand_core::domain::organization::{
        Organization, OrganizationId, PlanTier, ProviderId,
    };
    use deckhand_db::repositories::{InMemoryOrganizationRepository, OrganizationRepository};
    use deckhand_db::RepositoryError;

    use super::{decide, FallbackReason, ProviderSelector, SelectionError};
    use crate::llm::{LlmProvider, ProviderFactory, ScriptedProvider};

    struct CountingFactory {
        default: Arc<ScriptedProvider>,
        premium: Arc<ScriptedProvider>,
        created: AtomicUsize,
    }

    impl CountingFactory {
        fn new(premium_available: bool) -> Self {
            let premium = ScriptedProvider::new(ProviderId::Bedrock);
            premium.set_available(premium_available);
            Self {
                default: Arc::new(ScriptedProvider::new(ProviderId::Anthropic)),
                premium: Arc::new(premium),
                created: AtomicUsize::new(0),
            }
        }
    }

    impl ProviderFactory for CountingFactory {
        fn create(&self, provider_id: ProviderId) -> Arc<dyn LlmProvider> {
            self.created.fetch_add(1, Ordering::SeqCst);
            match provider_id {
                ProviderId::Anthropic => self.default.clone(),
                ProviderId::Bedrock => self.premium.clone(),
            }
        }
    }

    struct BrokenOrganizations;

    #[async_trait]
    impl OrganizationRepository for BrokenOrganizations {
        async fn find_by_id(
            &self,
            _id: &OrganizationId,
        ) -> Result<Option<Organization>, RepositoryError> {
            Err(RepositoryError::Decode("connection reset".to_string()))
        }

        async fn save(&self, _organization: Organization) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    fn organization(id: &str, tier: PlanTier, preference: Option<ProviderId>) -> Organization {
        Organization {
            id: OrganizationId(id.to_string()),
            name: format!("{id} Inc"),
            plan_tier: tier,
            provider_preference: preference,
        }
    }

    async fn selector_with(
        organizations: Vec<Organization>,
        factory: Arc<CountingFactory>,
    ) -> ProviderSelector {
        let repo = InMemoryOrganizationRepository::default();
        for organization in organizations {
            repo.save(organization).await.expect("save organization");
        }
        ProviderSelector::new(Arc::new(repo), factory, &AppConfig::default().llm)
    }

    #[test]
    fn below_tier_never_gets_premium_regardless_of_preference() {
        for tier in [PlanTier::Free, PlanTier::Starter, PlanTier::Professional] {
            let org = organization("org", tier, Some(ProviderId::Bedrock));
            let decision = decide(&org, PlanTier::Enterprise, || true);
            assert_eq!(decision.provider_id, ProviderId::Anthropic);
            assert_eq!(decision.fallback, Some(FallbackReason::TierInsufficient));
        }
    }

    #[test]
    fn premium_requires_preference_tier_and_credentials() {
        let org = organization("org", PlanTier::Enterprise, Some(ProviderId::Bedrock));
        assert_eq!(decide(&org, PlanTier::Enterprise, || true).provider_id, ProviderId::Bedrock);
        assert_eq!(
            decide(&org, PlanTier::Enterprise, || false).fallback,
            Some(FallbackReason::PremiumUnavailable)
        );

        let no_preference = organization("org", PlanTier::Enterprise, None);
        assert_eq!(
            decide(&no_preference, PlanTier::Enterprise, || true).fallback,
            Some(FallbackReason::PreferenceAbsent)
        );

        let explicit_default = organization("org", PlanTier::Enterprise, Some(ProviderId::Anthropic));
        let decision = decide(&explicit_default, PlanTier::Enterprise, || panic!("not consulted"));
        assert_eq!(decision.provider_id, ProviderId::Anthropic);
        assert_eq!(decision.fallback, None);
    }

    #[tokio::test]
    async fn selection_is_cached_until_invalidated() {
        let factory = Arc::new(CountingFactory::new(true));
        let selector = selector_with(
            vec![organization("org-ent", PlanTier::Enterprise, Some(ProviderId::Bedrock))],
            factory.clone(),
        )
        .await;
        let org_id = OrganizationId("org-ent".to_string());

        let first = selector.select(&org_id).await.expect("select");
        assert_eq!(first.id(), ProviderId::Bedrock);
        let created = factory.created.load(Ordering::SeqCst);

        let second = selector.select(&org_id).await.expect("select");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created.load(Ordering::SeqCst), created);

        // premium credentials removed; cache still holds the old handle
        factory.premium.set_available(false);
        assert_eq!(selector.select(&org_id).await.expect("select").id(), ProviderId::Bedrock);

        assert!(selector.invalidate(&org_id).await);
        assert_eq!(selector.select(&org_id).await.expect("select").id(), ProviderId::Anthropic);
        assert!(!selector.invalidate(&OrganizationId("unknown".to_string())).await);
    }

    #[tokio::test]
    async fn unknown_organization_gets_default_without_caching() {
        let factory = Arc::new(CountingFactory::new(true));
        let selector = selector_with(Vec::new(), factory).await;

        let provider = selector.select(&OrganizationId("missing".to_string())).await.expect("select");
        assert_eq!(provider.id(), ProviderId::Anthropic);
        assert_eq!(selector.cached_len().await, 0);
    }

    #[tokio::test]
    async fn lookup_failure_follows_fail_open_setting() {
        let factory = Arc::new(CountingFactory::new(true));
        let mut config = AppConfig::default().llm;

        let open = ProviderSelector::new(Arc::new(BrokenOrganizations), factory.clone(), &config);
        let provider = open.select(&OrganizationId("org".to_string())).await.expect("fail open");
        assert_eq!(provider.id(), ProviderId::Anthropic);
        assert_eq!(open.cached_len().await, 0);

        config.fail_open_on_lookup_error = false;
        let closed = ProviderSelector::new(Arc::new(BrokenOrganizations), factory, &config);
        let error = closed.select(&OrganizationId("org".to_string())).await.err().expect("fail closed");
        assert!(matches!(error, SelectionError::Lookup { .. }));
    }
}
