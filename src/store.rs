// =============================================================================
// STORE MODULE
// =============================================================================
// The storage seam of the service. Components never build SQL themselves;
// they open a transaction with `Store::begin` and call the primitives below.
//
// LEARNING NOTES:
// - Every primitive that changes inventory or delivery rows is a single
//   claim-by-predicate statement: the WHERE clause re-checks the state it
//   expects, so a row that changed underneath us simply isn't matched
// - Dropping a transaction without calling `commit` rolls it back. All
//   "abort on error" paths rely on this: return the error with `?` and the
//   transaction is discarded
// - `db::Database` is the PostgreSQL implementation; tests use
//   `memory::MemoryStore`, which applies the same predicates in memory
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    DeliveryEvent, DeliveryLookup, InventoryItem, InventoryStats, NewDeliveryEvent, NewOrder,
    NewOrderItem, NewPayment, Order, OrderItem, OrderStatus, Payment, Product,
};
use crate::vault::EncryptedPayload;

/// A handle that can open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>>;

    /// Cheap connectivity probe for readiness checks.
    async fn health_check(&self) -> bool;
}

/// One open transaction. Not committed unless `commit` is called.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // PRODUCTS
    // -------------------------------------------------------------------------
    async fn product(&mut self, product_id: Uuid) -> AppResult<Option<Product>>;

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------
    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order>;

    async fn insert_order_item(&mut self, item: NewOrderItem) -> AppResult<OrderItem>;

    /// Reads the order and holds an exclusive row lock until commit, so
    /// fulfillment, refund and payment confirmation on one order serialize.
    async fn lock_order(&mut self, order_id: Uuid) -> AppResult<Option<Order>>;

    async fn find_order_by_code(&mut self, order_code: &str) -> AppResult<Option<Order>>;

    async fn order_items(&mut self, order_id: Uuid) -> AppResult<Vec<OrderItem>>;

    /// Sets the order status; `fulfilled_at` is stamped when given.
    async fn set_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        fulfilled_at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------
    async fn insert_inventory_item(
        &mut self,
        product_id: Uuid,
        payload: &EncryptedPayload,
    ) -> AppResult<Uuid>;

    async fn inventory_item(&mut self, item_id: Uuid) -> AppResult<Option<InventoryItem>>;

    /// Claims up to `limit` available units of a product, oldest first, skipping
    /// rows locked by other transactions, and marks them reserved for
    /// `order_item_id` until `expires_at`. Returns the ids actually claimed.
    async fn claim_available(
        &mut self,
        product_id: Uuid,
        limit: i64,
        order_item_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>>;

    /// Claims one unit already reserved for `order_item_id` whose reservation
    /// is still valid at `now`, oldest first, skipping locked rows.
    async fn claim_reserved(
        &mut self,
        order_item_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Uuid>>;

    /// `reserved -> sold` for a unit claimed in this transaction.
    async fn mark_sold(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<()>;

    /// `reserved -> available` for every unit reserved for the order item.
    /// With `expired_before`, only reservations that lapsed before that instant.
    async fn release_reserved(
        &mut self,
        order_item_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> AppResult<u64>;

    /// `reserved|sold -> available` for every unit bound to any item of the order.
    async fn release_order_inventory(&mut self, order_id: Uuid) -> AppResult<u64>;

    /// `reserved -> available` for every reservation that lapsed before `now`.
    async fn release_expired(&mut self, now: DateTime<Utc>) -> AppResult<u64>;

    /// `available|reserved -> revoked`. Returns false when the unit is in any
    /// other state (or absent).
    async fn revoke_item(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    async fn payload(&mut self, item_id: Uuid) -> AppResult<Option<EncryptedPayload>>;

    /// Locks and returns every payload sealed under `key_id`.
    async fn lock_payloads_by_key(
        &mut self,
        key_id: &str,
    ) -> AppResult<Vec<(Uuid, EncryptedPayload)>>;

    async fn update_payload(&mut self, item_id: Uuid, payload: &EncryptedPayload)
        -> AppResult<()>;

    async fn inventory_stats(&mut self, product_id: Uuid) -> AppResult<InventoryStats>;

    // -------------------------------------------------------------------------
    // DELIVERY EVENTS
    // -------------------------------------------------------------------------
    async fn insert_delivery_event(&mut self, event: NewDeliveryEvent)
        -> AppResult<DeliveryEvent>;

    async fn delivery_by_token(&mut self, token: &str) -> AppResult<Option<DeliveryLookup>>;

    /// The single conditional reveal update:
    /// `reveal_count += 1` where `reveal_count < max_reveals` and the token is
    /// unexpired at `now`, stamping `revealed_at`/`revealed_ip` in the same
    /// statement. Returns the bound inventory item id, or None if the
    /// predicate no longer holds (another reveal won).
    async fn claim_reveal(
        &mut self,
        event_id: Uuid,
        now: DateTime<Utc>,
        ip: Option<&str>,
    ) -> AppResult<Option<Uuid>>;

    /// `max_reveals = 0` for one token. Returns false if the token is unknown.
    async fn revoke_token(&mut self, token: &str) -> AppResult<bool>;

    async fn revoke_order_tokens(&mut self, order_id: Uuid) -> AppResult<u64>;

    /// `max_reveals = 0` for unrevealed tokens that expired before `now`.
    async fn expire_stale_tokens(&mut self, now: DateTime<Utc>) -> AppResult<u64>;

    async fn deliveries_for_order(&mut self, order_id: Uuid) -> AppResult<Vec<DeliveryEvent>>;

    // -------------------------------------------------------------------------
    // PAYMENTS
    // -------------------------------------------------------------------------
    async fn insert_payment(&mut self, payment: NewPayment) -> AppResult<Payment>;

    async fn payment_by_provider_tx(&mut self, provider_tx_id: &str)
        -> AppResult<Option<Payment>>;

    async fn pending_payment(&mut self, order_id: Uuid) -> AppResult<Option<Payment>>;

    async fn confirm_payment(
        &mut self,
        payment_id: Uuid,
        provider_tx_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn refund_payments(&mut self, order_id: Uuid) -> AppResult<u64>;
}
