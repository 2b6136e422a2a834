//! Application state.

use std::sync::Arc;
use std::time::Duration;

use sprout_billing_store::Store;

use crate::config::ServiceConfig;
use crate::dodo::{DodoClient, SignatureFailureMonitor, WebhookVerifier};
use crate::ledger::Ledger;
use crate::provider::PaymentProvider;
use crate::reconciler::{PaymentReconciler, ReconcilerSettings};

/// Application state shared across handlers.
pub struct AppState {
    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit ledger.
    pub ledger: Ledger,

    /// Payment lifecycle.
    pub reconciler: Arc<PaymentReconciler>,

    /// Webhook verifier; webhooks are rejected when absent.
    pub webhook_verifier: Option<WebhookVerifier>,

    /// Counts webhook signature failures.
    pub signature_failures: SignatureFailureMonitor,
}

impl AppState {
    /// Create application state, building the Dodo client when configured.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let provider = config.dodo_api_key.as_ref().and_then(|key| {
            match DodoClient::new(&config.dodo_api_url, key, config.dodo_product_id.clone()) {
                Ok(client) => {
                    tracing::info!(
                        dodo_url = %config.dodo_api_url,
                        "Dodo Payments integration enabled"
                    );
                    Some(Arc::new(client) as Arc<dyn PaymentProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build Dodo client");
                    None
                }
            }
        });

        if provider.is_none() {
            tracing::warn!("Dodo not configured - payments will not be available");
        }
        if config.dodo_product_id.is_none() && provider.is_some() {
            tracing::warn!("DODO_PRODUCT_ID not set - checkouts will be rejected");
        }

        Self::with_provider(store, config, provider)
    }

    /// Create application state with an explicit payment provider.
    #[must_use]
    pub fn with_provider(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        provider: Option<Arc<dyn PaymentProvider>>,
    ) -> Self {
        let webhook_verifier = config.dodo_webhook_secret.as_deref().map(|secret| {
            WebhookVerifier::new(secret, Duration::from_secs(config.webhook_tolerance_seconds))
        });
        if webhook_verifier.is_none() {
            tracing::warn!("Dodo webhook secret not configured - webhooks will be rejected");
        }
        if config.auth_jwt_secret.is_none() {
            tracing::warn!("AUTH_JWT_SECRET not configured - user requests will be rejected");
        }

        let ledger = Ledger::new(Arc::clone(&store), config.welcome_bonus_credits);
        let reconciler = Arc::new(PaymentReconciler::new(
            store,
            ledger.clone(),
            provider,
            ReconcilerSettings::from_config(&config),
        ));

        Self {
            config,
            ledger,
            reconciler,
            webhook_verifier,
            signature_failures: SignatureFailureMonitor::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sprout_billing_core::UserId;
    use sprout_billing_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn ledger_writes_reach_the_shared_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = AppState::with_provider(Arc::clone(&store), ServiceConfig::default(), None);
        assert!(!state.reconciler.has_provider());

        let user_id = UserId::generate();
        state.ledger.open_account(&user_id).await.unwrap();
        let balance = store.get_balance(&user_id).await.unwrap().unwrap();
        assert_eq!(balance.available, state.config.welcome_bonus_credits);

        drop(state);
        assert_eq!(Arc::strong_count(&store), 1);
    }
}
