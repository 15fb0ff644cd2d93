// =============================================================================
// IN-MEMORY STORE (tests only)
// =============================================================================
// A `Store` over plain collections, used by the unit tests of every engine
// component.
//
// LEARNING NOTES:
// - `begin` takes an owned lock on the whole state and hands the transaction a
//   working copy. `commit` writes the copy back; dropping the transaction
//   throws it away. Transactions are therefore fully serialized, which is a
//   stronger guarantee than PostgreSQL gives, but every primitive still checks
//   the same predicates as its SQL counterpart
// - Vec order stands in for `ORDER BY created_at`
// - Since nothing can interleave on its own, `before_next_claim_reveal` lets a
//   test commit a competing reveal between a reveal's read and its
//   conditional update
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as HookSlot;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    DeliveryEvent, DeliveryLookup, InventoryItem, InventoryStats, InventoryStatus,
    NewDeliveryEvent, NewOrder, NewOrderItem, NewPayment, Order, OrderItem, OrderStatus, Payment,
    PaymentStatus, Product, ProductStatus,
};
use crate::store::{Store, StoreTx};
use crate::vault::EncryptedPayload;

#[derive(Clone)]
struct Unit {
    item: InventoryItem,
    payload: EncryptedPayload,
}

#[derive(Clone, Default)]
struct State {
    products: HashMap<Uuid, Product>,
    orders: HashMap<Uuid, Order>,
    order_items: Vec<OrderItem>,
    units: Vec<Unit>,
    deliveries: Vec<DeliveryEvent>,
    payments: Vec<Payment>,
}

impl State {
    fn order_item_ids(&self, order_id: Uuid) -> Vec<Uuid> {
        self.order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .map(|i| i.id)
            .collect()
    }
}

fn release(item: &mut InventoryItem, now: DateTime<Utc>) {
    item.status = InventoryStatus::Available;
    item.order_item_id = None;
    item.reserved_at = None;
    item.reservation_expires_at = None;
    item.sold_at = None;
    item.updated_at = now;
}

fn reservation_lapsed(item: &InventoryItem, at: DateTime<Utc>) -> bool {
    item.reservation_expires_at.map_or(true, |expires| expires <= at)
}

type RevealHook = Box<dyn FnOnce(&mut DeliveryEvent) + Send>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    fail_commits: Arc<AtomicBool>,
    before_claim_reveal: Arc<HookSlot<Option<RevealHook>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // FIXTURE HELPERS
    // -------------------------------------------------------------------------

    pub async fn add_product(&self, name: &str, price: i64, status: ProductStatus) -> Product {
        let product = Product {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price,
            currency: "USD".to_string(),
            status,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .await
            .products
            .insert(product.id, product.clone());
        product
    }

    /// Makes every later `commit` fail until switched off again.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Runs `hook` once, inside the next `claim_reveal`, on the committed
    /// delivery row before the predicate is checked. The change is kept even
    /// if the revealing transaction rolls back.
    pub fn before_next_claim_reveal(&self, hook: impl FnOnce(&mut DeliveryEvent) + Send + 'static) {
        *self.before_claim_reveal.lock() = Some(Box::new(hook));
    }

    pub async fn order(&self, order_id: Uuid) -> Option<Order> {
        self.state.lock().await.orders.get(&order_id).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn order_items_of(&self, order_id: Uuid) -> Vec<OrderItem> {
        self.state
            .lock()
            .await
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn units(&self, product_id: Uuid) -> Vec<InventoryItem> {
        self.state
            .lock()
            .await
            .units
            .iter()
            .filter(|u| u.item.product_id == product_id)
            .map(|u| u.item.clone())
            .collect()
    }

    pub async fn unit_payload(&self, item_id: Uuid) -> Option<EncryptedPayload> {
        self.state
            .lock()
            .await
            .units
            .iter()
            .find(|u| u.item.id == item_id)
            .map(|u| u.payload.clone())
    }

    pub async fn stats(&self, product_id: Uuid) -> InventoryStats {
        let state = self.state.lock().await;
        let mut stats = InventoryStats {
            product_id,
            ..Default::default()
        };
        for unit in state.units.iter().filter(|u| u.item.product_id == product_id) {
            stats.add(unit.item.status, 1);
        }
        stats
    }

    pub async fn deliveries(&self) -> Vec<DeliveryEvent> {
        self.state.lock().await.deliveries.clone()
    }

    pub async fn payments_of(&self, order_id: Uuid) -> Vec<Payment> {
        self.state
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Moves every reservation deadline `by` into the past.
    pub async fn age_reservations(&self, by: Duration) {
        let mut state = self.state.lock().await;
        for unit in state.units.iter_mut() {
            if let Some(expires) = unit.item.reservation_expires_at.as_mut() {
                *expires -= by;
            }
        }
    }

    /// Moves the deadline of one token `by` into the past.
    pub async fn age_token(&self, token: &str, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(event) = state
            .deliveries
            .iter_mut()
            .find(|d| d.delivery_token == token)
        {
            event.token_expires_at -= by;
        }
    }

    /// Flips a ciphertext byte so the payload no longer authenticates.
    pub async fn corrupt_payload(&self, item_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(unit) = state.units.iter_mut().find(|u| u.item.id == item_id) {
            if let Some(byte) = unit.payload.ciphertext.first_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
            before_claim_reveal: self.before_claim_reveal.clone(),
        }))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    fail_commit: bool,
    before_claim_reveal: Arc<HookSlot<Option<RevealHook>>>,
}

impl MemoryTx {
    fn unit_mut(&mut self, item_id: Uuid) -> Option<&mut Unit> {
        self.working.units.iter_mut().find(|u| u.item.id == item_id)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTx {
            mut guard,
            working,
            fail_commit,
            ..
        } = *self;
        if fail_commit {
            return Err(AppError::Internal("injected commit failure".to_string()));
        }
        *guard = working;
        Ok(())
    }

    async fn product(&mut self, product_id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.working.products.get(&product_id).cloned())
    }

    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order> {
        if self
            .working
            .orders
            .values()
            .any(|o| o.order_code == order.order_code)
        {
            return Err(AppError::Internal("duplicate order code".to_string()));
        }
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            order_code: order.order_code,
            customer_email: order.customer_email,
            status: OrderStatus::Pending,
            subtotal: order.subtotal,
            total: order.total,
            currency: order.currency,
            ip_address: order.ip_address,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.working.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> AppResult<OrderItem> {
        let item = OrderItem {
            id: Uuid::new_v4(),
            order_id: item.order_id,
            product_id: item.product_id,
            product_name: item.product_name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price: item.total_price,
        };
        self.working.order_items.push(item.clone());
        Ok(item)
    }

    async fn lock_order(&mut self, order_id: Uuid) -> AppResult<Option<Order>> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn find_order_by_code(&mut self, order_code: &str) -> AppResult<Option<Order>> {
        Ok(self
            .working
            .orders
            .values()
            .find(|o| o.order_code == order_code)
            .cloned())
    }

    async fn order_items(&mut self, order_id: Uuid) -> AppResult<Vec<OrderItem>> {
        Ok(self
            .working
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn set_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        fulfilled_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let order = self
            .working
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound("order".to_string()))?;
        order.status = status;
        if fulfilled_at.is_some() {
            order.fulfilled_at = fulfilled_at;
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_inventory_item(
        &mut self,
        product_id: Uuid,
        payload: &EncryptedPayload,
    ) -> AppResult<Uuid> {
        let now = Utc::now();
        let item = InventoryItem {
            id: Uuid::new_v4(),
            product_id,
            encryption_key_id: payload.key_id.clone(),
            status: InventoryStatus::Available,
            order_item_id: None,
            reserved_at: None,
            reservation_expires_at: None,
            sold_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = item.id;
        self.working.units.push(Unit {
            item,
            payload: payload.clone(),
        });
        Ok(id)
    }

    async fn inventory_item(&mut self, item_id: Uuid) -> AppResult<Option<InventoryItem>> {
        Ok(self.unit_mut(item_id).map(|u| u.item.clone()))
    }

    async fn claim_available(
        &mut self,
        product_id: Uuid,
        limit: i64,
        order_item_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut claimed = Vec::with_capacity(limit);
        for unit in self.working.units.iter_mut().filter(|u| {
            u.item.product_id == product_id && u.item.status == InventoryStatus::Available
        }) {
            if claimed.len() == limit {
                break;
            }
            unit.item.status = InventoryStatus::Reserved;
            unit.item.order_item_id = Some(order_item_id);
            unit.item.reserved_at = Some(now);
            unit.item.reservation_expires_at = Some(expires_at);
            unit.item.updated_at = now;
            claimed.push(unit.item.id);
        }
        Ok(claimed)
    }

    async fn claim_reserved(
        &mut self,
        order_item_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Uuid>> {
        Ok(self
            .working
            .units
            .iter()
            .find(|u| {
                u.item.status == InventoryStatus::Reserved
                    && u.item.order_item_id == Some(order_item_id)
                    && !reservation_lapsed(&u.item, now)
            })
            .map(|u| u.item.id))
    }

    async fn mark_sold(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        let unit = self
            .unit_mut(item_id)
            .filter(|u| u.item.status == InventoryStatus::Reserved)
            .ok_or(AppError::InvalidInventoryState)?;
        unit.item.status = InventoryStatus::Sold;
        unit.item.sold_at = Some(now);
        unit.item.reservation_expires_at = None;
        unit.item.updated_at = now;
        Ok(())
    }

    async fn release_reserved(
        &mut self,
        order_item_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> AppResult<u64> {
        let now = Utc::now();
        let mut released = 0;
        for unit in self.working.units.iter_mut() {
            let item = &mut unit.item;
            if item.status != InventoryStatus::Reserved
                || item.order_item_id != Some(order_item_id)
            {
                continue;
            }
            if let Some(cutoff) = expired_before {
                if !reservation_lapsed(item, cutoff) {
                    continue;
                }
            }
            release(item, now);
            released += 1;
        }
        Ok(released)
    }

    async fn release_order_inventory(&mut self, order_id: Uuid) -> AppResult<u64> {
        let now = Utc::now();
        let item_ids = self.working.order_item_ids(order_id);
        let mut released = 0;
        for unit in self.working.units.iter_mut() {
            let item = &mut unit.item;
            let bound = item.order_item_id.map_or(false, |id| item_ids.contains(&id));
            if bound && matches!(item.status, InventoryStatus::Reserved | InventoryStatus::Sold) {
                release(item, now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_expired(&mut self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut released = 0;
        for unit in self.working.units.iter_mut() {
            if unit.item.status == InventoryStatus::Reserved && reservation_lapsed(&unit.item, now) {
                release(&mut unit.item, now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn revoke_item(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        match self.unit_mut(item_id) {
            Some(unit) if unit.item.status.is_revocable() => {
                unit.item.status = InventoryStatus::Revoked;
                unit.item.order_item_id = None;
                unit.item.reserved_at = None;
                unit.item.reservation_expires_at = None;
                unit.item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn payload(&mut self, item_id: Uuid) -> AppResult<Option<EncryptedPayload>> {
        Ok(self.unit_mut(item_id).map(|u| u.payload.clone()))
    }

    async fn lock_payloads_by_key(
        &mut self,
        key_id: &str,
    ) -> AppResult<Vec<(Uuid, EncryptedPayload)>> {
        Ok(self
            .working
            .units
            .iter()
            .filter(|u| u.payload.key_id == key_id)
            .map(|u| (u.item.id, u.payload.clone()))
            .collect())
    }

    async fn update_payload(
        &mut self,
        item_id: Uuid,
        payload: &EncryptedPayload,
    ) -> AppResult<()> {
        let unit = self
            .unit_mut(item_id)
            .ok_or_else(|| AppError::NotFound("inventory item".to_string()))?;
        unit.item.encryption_key_id = payload.key_id.clone();
        unit.item.updated_at = Utc::now();
        unit.payload = payload.clone();
        Ok(())
    }

    async fn inventory_stats(&mut self, product_id: Uuid) -> AppResult<InventoryStats> {
        let mut stats = InventoryStats {
            product_id,
            ..Default::default()
        };
        for unit in self.working.units.iter().filter(|u| u.item.product_id == product_id) {
            stats.add(unit.item.status, 1);
        }
        Ok(stats)
    }

    async fn insert_delivery_event(
        &mut self,
        event: NewDeliveryEvent,
    ) -> AppResult<DeliveryEvent> {
        let duplicate = self.working.deliveries.iter().any(|d| {
            d.delivery_token == event.delivery_token
                || (d.inventory_item_id == event.inventory_item_id && d.max_reveals > 0)
        });
        if duplicate {
            return Err(AppError::Internal(
                "unique violation on delivery_events".to_string(),
            ));
        }
        let event = DeliveryEvent {
            id: Uuid::new_v4(),
            order_id: event.order_id,
            inventory_item_id: event.inventory_item_id,
            delivery_token: event.delivery_token,
            token_expires_at: event.token_expires_at,
            reveal_count: 0,
            max_reveals: event.max_reveals,
            revealed_at: None,
            revealed_ip: None,
            created_at: Utc::now(),
        };
        self.working.deliveries.push(event.clone());
        Ok(event)
    }

    async fn delivery_by_token(&mut self, token: &str) -> AppResult<Option<DeliveryLookup>> {
        let Some(event) = self
            .working
            .deliveries
            .iter()
            .find(|d| d.delivery_token == token)
            .cloned()
        else {
            return Ok(None);
        };
        let product_name = self
            .working
            .units
            .iter()
            .find(|u| u.item.id == event.inventory_item_id)
            .and_then(|u| self.working.products.get(&u.item.product_id))
            .map(|p| p.name.clone())
            .unwrap_or_default();
        Ok(Some(DeliveryLookup {
            event,
            product_name,
        }))
    }

    async fn claim_reveal(
        &mut self,
        event_id: Uuid,
        now: DateTime<Utc>,
        ip: Option<&str>,
    ) -> AppResult<Option<Uuid>> {
        let hook = self.before_claim_reveal.lock().take();
        if let Some(hook) = hook {
            if let Some(committed) = self.guard.deliveries.iter_mut().find(|d| d.id == event_id) {
                hook(committed);
                let competing = committed.clone();
                if let Some(working) = self.working.deliveries.iter_mut().find(|d| d.id == event_id) {
                    *working = competing;
                }
            }
        }

        let Some(event) = self.working.deliveries.iter_mut().find(|d| {
            d.id == event_id && d.reveal_count < d.max_reveals && d.token_expires_at >= now
        }) else {
            return Ok(None);
        };
        event.reveal_count += 1;
        event.revealed_at = Some(now);
        event.revealed_ip = ip.map(str::to_string);
        Ok(Some(event.inventory_item_id))
    }

    async fn revoke_token(&mut self, token: &str) -> AppResult<bool> {
        match self
            .working
            .deliveries
            .iter_mut()
            .find(|d| d.delivery_token == token)
        {
            Some(event) => {
                event.max_reveals = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_order_tokens(&mut self, order_id: Uuid) -> AppResult<u64> {
        let mut revoked = 0;
        for event in self
            .working
            .deliveries
            .iter_mut()
            .filter(|d| d.order_id == order_id && d.max_reveals > 0)
        {
            event.max_reveals = 0;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn expire_stale_tokens(&mut self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut expired = 0;
        for event in self.working.deliveries.iter_mut().filter(|d| {
            d.reveal_count == 0 && d.max_reveals > 0 && d.token_expires_at < now
        }) {
            event.max_reveals = 0;
            expired += 1;
        }
        Ok(expired)
    }

    async fn deliveries_for_order(&mut self, order_id: Uuid) -> AppResult<Vec<DeliveryEvent>> {
        Ok(self
            .working
            .deliveries
            .iter()
            .filter(|d| d.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> AppResult<Payment> {
        if let Some(tx_id) = payment.provider_tx_id.as_deref() {
            if self
                .working
                .payments
                .iter()
                .any(|p| p.provider_tx_id.as_deref() == Some(tx_id))
            {
                return Err(AppError::Internal(
                    "unique violation on payments.provider_tx_id".to_string(),
                ));
            }
        }
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: payment.order_id,
            payment_method: payment.payment_method.as_str().to_string(),
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            provider_tx_id: payment.provider_tx_id,
            confirmed_at: payment.confirmed_at,
            created_at: Utc::now(),
        };
        self.working.payments.push(payment.clone());
        Ok(payment)
    }

    async fn payment_by_provider_tx(
        &mut self,
        provider_tx_id: &str,
    ) -> AppResult<Option<Payment>> {
        Ok(self
            .working
            .payments
            .iter()
            .find(|p| p.provider_tx_id.as_deref() == Some(provider_tx_id))
            .cloned())
    }

    async fn pending_payment(&mut self, order_id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self
            .working
            .payments
            .iter()
            .rev()
            .find(|p| p.order_id == order_id && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn confirm_payment(
        &mut self,
        payment_id: Uuid,
        provider_tx_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let payment = self
            .working
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| AppError::NotFound("payment".to_string()))?;
        payment.status = PaymentStatus::Confirmed;
        payment.confirmed_at = Some(now);
        if let Some(tx_id) = provider_tx_id {
            payment.provider_tx_id = Some(tx_id.to_string());
        }
        Ok(())
    }

    async fn refund_payments(&mut self, order_id: Uuid) -> AppResult<u64> {
        let mut refunded = 0;
        for payment in self
            .working
            .payments
            .iter_mut()
            .filter(|p| p.order_id == order_id && p.status != PaymentStatus::Refunded)
        {
            payment.status = PaymentStatus::Refunded;
            refunded += 1;
        }
        Ok(refunded)
    }
}
