//! Provider registry and selection.
//!
//! The registry is an explicitly constructed value: the server builds one
//! from configuration and hands it to the orchestrator, tests build their
//! own with mock connectors.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::policy::{RateLimitAwarePolicy, ReconnectPolicy, StandardPolicy};
use crate::transport::TransportConnector;
use errors::SelectionError;
use relay_core::{
    AudioEncoding, CostTier, ProviderCapabilities, ProviderId, ProviderKind, SessionConfig
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One configured provider and its shared breaker.
pub struct ProviderEntry {
    pub id: ProviderId,
    pub endpoint: String,
    pub model: String,
    pub capabilities: ProviderCapabilities,
    pub rate_limit_aware: bool,
    pub enabled: bool,
    pub breaker: Arc<CircuitBreaker>,
    pub connector: Arc<dyn TransportConnector>
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("capabilities", &self.capabilities)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    pub fn new(
        id: impl Into<ProviderId>,
        model: impl Into<String>,
        capabilities: ProviderCapabilities,
        connector: Arc<dyn TransportConnector>,
        breaker_config: CircuitBreakerConfig
    ) -> Self {
        let id = id.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(id.as_str(), breaker_config)),
            id,
            endpoint: String::new(),
            model: model.into(),
            capabilities,
            rate_limit_aware: false,
            enabled: true,
            connector
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_rate_limit_aware(mut self, aware: bool) -> Self {
        self.rate_limit_aware = aware;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The per-call session pointed at this provider and its model.
    pub fn session_for(&self, base: &SessionConfig) -> SessionConfig {
        base.for_provider(self.id.clone(), self.model.clone())
    }

    /// Replay buffer size for connections to this provider, if any.
    pub fn replay_capacity(&self, configured: usize) -> Option<usize> {
        self.capabilities
            .needs_replay_buffer()
            .then_some(configured)
    }
}

/// What a session needs from its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequirements {
    pub cost_tier: CostTier,
    pub kind: Option<ProviderKind>,
    pub multimodal: bool,
    pub function_calling: bool,
    pub encoding: Option<AudioEncoding>,
    /// Providers already tried for this call
    pub exclude: HashSet<ProviderId>
}

impl Default for ProviderRequirements {
    fn default() -> Self {
        Self::new(CostTier::Standard)
    }
}

impl ProviderRequirements {
    pub fn new(cost_tier: CostTier) -> Self {
        Self {
            cost_tier,
            kind: None,
            multimodal: false,
            function_calling: false,
            encoding: None,
            exclude: HashSet::new()
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn require_multimodal(mut self) -> Self {
        self.multimodal = true;
        self
    }

    pub fn require_function_calling(mut self) -> Self {
        self.function_calling = true;
        self
    }

    pub fn with_encoding(mut self, encoding: AudioEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn excluding(mut self, provider: ProviderId) -> Self {
        self.exclude.insert(provider);
        self
    }

    pub fn is_satisfied_by(&self, capabilities: &ProviderCapabilities) -> bool {
        self.kind.is_none_or(|kind| capabilities.kind == kind)
            && (!self.multimodal || capabilities.multimodal)
            && (!self.function_calling || capabilities.function_calling)
            && self
                .encoding
                .is_none_or(|encoding| capabilities.supports_encoding(encoding))
    }

    /// Lower is better.
    fn preference(&self, capabilities: &ProviderCapabilities) -> u32 {
        let cost = cost_rank(capabilities.cost_tier);
        match self.cost_tier {
            CostTier::Premium => {
                let realtime = if capabilities.kind == ProviderKind::Realtime { 2 } else { 0 };
                let multimodal = u32::from(capabilities.multimodal);
                3 - (realtime + multimodal)
            }
            CostTier::Economy => cost,
            CostTier::Standard => cost.abs_diff(cost_rank(CostTier::Standard))
        }
    }
}

impl std::fmt::Display for ProviderRequirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier={}", self.cost_tier)?;
        if let Some(kind) = self.kind {
            write!(f, " kind={kind}")?;
        }
        if self.multimodal {
            f.write_str(" multimodal")?;
        }
        if self.function_calling {
            f.write_str(" function_calling")?;
        }
        if let Some(encoding) = self.encoding {
            write!(f, " encoding={encoding}")?;
        }
        if !self.exclude.is_empty() {
            let mut excluded: Vec<&str> = self.exclude.iter().map(ProviderId::as_str).collect();
            excluded.sort_unstable();
            write!(f, " excluding=[{}]", excluded.join(","))?;
        }
        Ok(())
    }
}

fn cost_rank(tier: CostTier) -> u32 {
    match tier {
        CostTier::Economy => 0,
        CostTier::Standard => 1,
        CostTier::Premium => 2
    }
}

pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    rate_limit_wait: Duration
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ProviderRegistry {
    /// `rate_limit_wait` caps the extra wait of rate-limit-aware providers.
    pub fn new(rate_limit_wait: Duration) -> Self {
        Self {
            entries: Vec::new(),
            rate_limit_wait
        }
    }

    /// Build from configuration. `connector_for` supplies the transport
    /// connector of each declared provider.
    pub fn from_config<F>(
        registry: &config::RegistryConfig,
        breaker: &config::BreakerConfig,
        reconnect: &config::ReconnectConfig,
        mut connector_for: F
    ) -> Result<Self, SelectionError>
    where
        F: FnMut(&config::ProviderEntryConfig) -> Arc<dyn TransportConnector>
    {
        let breaker_config = CircuitBreakerConfig::from(breaker);
        let mut providers = Self::new(reconnect.rate_limit_wait());

        for declared in &registry.providers {
            let entry = ProviderEntry::new(
                declared.provider_id(),
                declared.model.clone(),
                declared.capabilities(),
                connector_for(declared),
                breaker_config
            )
            .with_endpoint(declared.endpoint.clone())
            .with_rate_limit_aware(declared.rate_limit_aware)
            .with_enabled(declared.enabled);
            providers.register(entry)?;
        }
        Ok(providers)
    }

    /// Add a provider. Declaration order is the final tie-breaker.
    pub fn register(&mut self, entry: ProviderEntry) -> Result<Arc<ProviderEntry>, SelectionError> {
        if self.entries.iter().any(|e| e.id == entry.id) {
            return Err(SelectionError::DuplicateProvider {
                id: entry.id.to_string()
            });
        }
        let entry = Arc::new(entry);
        self.entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries
            .iter()
            .find(|e| e.id.as_str() == id)
            .cloned()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.get(name).map(|e| Arc::clone(&e.breaker))
    }

    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.entries
            .iter()
            .map(|e| Arc::clone(&e.breaker))
            .collect()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enabled, capable, not excluded and not behind an open breaker, best
    /// first.
    pub fn candidates(&self, requirements: &ProviderRequirements) -> Vec<Arc<ProviderEntry>> {
        let mut ranked: Vec<(u32, u32, usize, &Arc<ProviderEntry>)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.enabled)
            .filter(|(_, e)| !requirements.exclude.contains(&e.id))
            .filter(|(_, e)| requirements.is_satisfied_by(&e.capabilities))
            .filter(|(_, e)| {
                let accepting = e.breaker.is_accepting();
                if !accepting {
                    debug!(provider = %e.id, "Skipping provider with open breaker");
                }
                accepting
            })
            .map(|(index, e)| {
                (
                    requirements.preference(&e.capabilities),
                    e.capabilities.priority,
                    index,
                    e
                )
            })
            .collect();

        ranked.sort_by_key(|&(preference, priority, index, _)| (preference, priority, index));
        ranked
            .into_iter()
            .map(|(_, _, _, e)| Arc::clone(e))
            .collect()
    }

    pub fn select_best_provider(
        &self,
        requirements: &ProviderRequirements
    ) -> Result<Arc<ProviderEntry>, SelectionError> {
        match self.candidates(requirements).into_iter().next() {
            Some(entry) => {
                debug!(provider = %entry.id, requirements = %requirements, "Provider selected");
                Ok(entry)
            }
            None => {
                warn!(requirements = %requirements, "No capable provider available");
                Err(SelectionError::NoCapableProvider {
                    requirements: requirements.to_string()
                })
            }
        }
    }

    pub fn policy_for(&self, entry: &ProviderEntry) -> Arc<dyn ReconnectPolicy> {
        if entry.rate_limit_aware {
            Arc::new(RateLimitAwarePolicy::new(self.rate_limit_wait))
        } else {
            Arc::new(StandardPolicy)
        }
    }
}
