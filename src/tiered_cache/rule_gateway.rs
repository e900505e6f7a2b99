//! Rule Store Gateway: read-through L1 wrapper over the persistent rule
//! collection. Degrades gracefully — a store failure is cached as an empty
//! rule set for the L1 TTL rather than retried on every request, the same
//! "cache the miss" trick that prevents a failing backend from being hammered.

use crate::collaborators::RuleStore;
use crate::keygen;
use crate::lru::ConcurrentLruTtl;
use crate::models::ProviderRules;
use std::sync::Arc;
use tracing::error;

pub struct RuleStoreGateway {
    store: Arc<dyn RuleStore>,
    l1: ConcurrentLruTtl<ProviderRules>,
}

impl RuleStoreGateway {
    #[must_use]
    pub fn new(store: Arc<dyn RuleStore>, l1: ConcurrentLruTtl<ProviderRules>) -> Self {
        Self { store, l1 }
    }

    /// Returns the provider's rule set, consulting L1 first. On a store
    /// failure, an empty rule set is cached and returned so repeated requests
    /// during an outage don't retry the store every time.
    pub async fn get_provider_rules(&self, provider: &str) -> ProviderRules {
        let key = keygen::rules_key(provider);
        if let Some(cached) = self.l1.get(&key) {
            return cached;
        }

        match self.store.find_by_data_source(provider).await {
            Ok(Some(rules)) => {
                self.l1.insert_default_ttl(key, rules.clone());
                rules
            }
            Ok(None) => {
                let empty = ProviderRules::empty(provider);
                self.l1.insert_default_ttl(key, empty.clone());
                empty
            }
            Err(err) => {
                error!(provider = %provider, error = %err, "rule store query failed, caching empty rule set");
                let empty = ProviderRules::empty(provider);
                self.l1.insert_default_ttl(key, empty.clone());
                empty
            }
        }
    }
}
