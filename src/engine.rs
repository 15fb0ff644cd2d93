// =============================================================================
// ENGINE
// =============================================================================
// Shared handle passed to every engine operation: storage, vault, security
// sink and the delivery policy. Cheap to clone.
// =============================================================================

use std::sync::Arc;

use chrono::Duration;

use crate::audit::{SecurityEvent, SecuritySink};
use crate::config::Config;
use crate::error::AppResult;
use crate::store::{Store, StoreTx};
use crate::vault::Vault;

/// Time limits and reveal budget applied to new reservations and tokens.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub reservation_ttl: Duration,
    pub token_ttl: Duration,
    pub max_reveals: i32,
}

impl DeliveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reservation_ttl: config.reservation_ttl,
            token_ttl: config.delivery_token_ttl,
            max_reveals: config.delivery_max_reveals,
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(15),
            token_ttl: Duration::hours(48),
            max_reveals: 1,
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub vault: Arc<Vault>,
    pub security: Arc<dyn SecuritySink>,
    pub policy: DeliveryPolicy,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        security: Arc<dyn SecuritySink>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            store,
            vault,
            security,
            policy,
        }
    }

    pub async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        self.store.begin().await
    }

    pub fn record(&self, event: SecurityEvent) {
        self.security.record(event);
    }
}

// =============================================================================
// TEST HARNESS
// =============================================================================
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::audit::testing::RecordingSink;
    use crate::checkout;
    use crate::memory::MemoryStore;
    use crate::models::{CheckoutRequest, Order, Product, ProductStatus};
    use crate::payments::{self, ManualTransferAdapter, PaymentAdapters, PaymentMethod, ProviderAdapter};
    use crate::vault::fixtures::test_vault;

    pub const BUYER: &str = "buyer@example.com";

    /// An engine over a fresh `MemoryStore`, with handles on the pieces
    /// tests want to inspect.
    pub struct TestEngine {
        pub engine: Engine,
        pub store: MemoryStore,
        pub security: Arc<RecordingSink>,
        pub adapters: PaymentAdapters,
    }

    impl TestEngine {
        pub fn new() -> Self {
            Self::with_policy(DeliveryPolicy::default())
        }

        pub fn with_policy(policy: DeliveryPolicy) -> Self {
            let store = MemoryStore::new();
            let security = Arc::new(RecordingSink::default());
            let engine = Engine::new(
                Arc::new(store.clone()),
                Arc::new(test_vault()),
                security.clone(),
                policy,
            );
            Self {
                engine,
                store,
                security,
                adapters: PaymentAdapters::new(
                    ManualTransferAdapter::new(None),
                    ProviderAdapter::new(Some("whsec_test".to_string())),
                ),
            }
        }

        /// An active product with `units` credentials named `<name>-cred-<i>`.
        pub async fn stock(&self, name: &str, price: i64, units: usize) -> Product {
            let product = self.store.add_product(name, price, ProductStatus::Active).await;
            let credentials = (0..units).map(|i| format!("{name}-cred-{i}")).collect();
            crate::inventory::import(&self.engine, product.id, credentials)
                .await
                .expect("import fixture credentials");
            product
        }

        pub async fn place_order(&self, product: &Product, quantity: i32) -> Order {
            self.place_order_with(product, quantity, PaymentMethod::ManualTransfer)
                .await
        }

        pub async fn place_order_with(
            &self,
            product: &Product,
            quantity: i32,
            payment_method: PaymentMethod,
        ) -> Order {
            checkout::checkout(
                &self.engine,
                &self.adapters,
                CheckoutRequest {
                    email: BUYER.to_string(),
                    email_confirm: BUYER.to_string(),
                    product_id: product.id,
                    quantity,
                    payment_method,
                },
                Some("198.51.100.7"),
            )
            .await
            .expect("checkout")
            .order
        }

        /// Checkout followed by an operator payment confirmation.
        pub async fn paid_order(&self, product: &Product, quantity: i32) -> Order {
            let order = self.place_order(product, quantity).await;
            payments::mark_paid(&self.engine, order.id)
                .await
                .expect("mark paid");
            order
        }
    }
}
