// =============================================================================
// DATABASE MODULE
// =============================================================================
// This module handles all PostgreSQL database operations.
//
// LEARNING NOTES:
// - Every state change runs inside an explicit transaction (`PgStoreTx`)
// - Contended inventory rows are claimed with `FOR UPDATE SKIP LOCKED`:
//   concurrent checkouts each take *different* rows instead of queueing
//   behind the same one
// - Reveals use a single conditional UPDATE; whoever's predicate still holds
//   wins, everyone else affects zero rows
// =============================================================================

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::SecurityEvent;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    DeliveryEvent, DeliveryLookup, InventoryItem, InventoryStats, InventoryStatus,
    NewDeliveryEvent, NewOrder, NewOrderItem, NewPayment, Order, OrderItem, OrderStatus, Payment,
    PaymentStatus, Product,
};
use crate::store::{Store, StoreTx};
use crate::vault::EncryptedPayload;

// Column lists shared by the queries below.
const ORDER_COLUMNS: &str = "id, order_code, customer_email, status, subtotal, total, currency, \
     ip_address, fulfilled_at, created_at, updated_at";
const ITEM_COLUMNS: &str = "id, product_id, encryption_key_id, status, order_item_id, \
     reserved_at, reservation_expires_at, sold_at, created_at, updated_at";
const DELIVERY_COLUMNS: &str = "id, order_id, inventory_item_id, delivery_token, \
     token_expires_at, reveal_count, max_reveals, revealed_at, revealed_ip, created_at";
const PAYMENT_COLUMNS: &str = "id, order_id, payment_method, status, amount, currency, \
     provider_tx_id, confirmed_at, created_at";

// -----------------------------------------------------------------------------
// SCHEMA
// -----------------------------------------------------------------------------
// Idempotent statements, run in order at startup.
const SCHEMA: &[(&str, &str)] = &[
    (
        "products table",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name VARCHAR(255) NOT NULL,
            price BIGINT NOT NULL,
            currency VARCHAR(3) NOT NULL DEFAULT 'USD',
            status VARCHAR(20) NOT NULL DEFAULT 'draft',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT products_price_non_negative CHECK (price >= 0),
            CONSTRAINT products_status_valid CHECK (status IN ('draft', 'active', 'archived'))
        )
        "#,
    ),
    (
        "orders table",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            order_code VARCHAR(20) NOT NULL UNIQUE,
            customer_email VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'pending',
            subtotal BIGINT NOT NULL,
            total BIGINT NOT NULL,
            currency VARCHAR(3) NOT NULL,
            ip_address TEXT,
            fulfilled_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT orders_status_valid CHECK (
                status IN ('pending', 'paid', 'fulfilled', 'refunded', 'cancelled')
            )
        )
        "#,
    ),
    (
        "order_items table",
        r#"
        CREATE TABLE IF NOT EXISTS order_items (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            product_id UUID NOT NULL REFERENCES products(id),
            product_name VARCHAR(255) NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price BIGINT NOT NULL,
            total_price BIGINT NOT NULL,

            CONSTRAINT order_items_quantity_positive CHECK (quantity > 0)
        )
        "#,
    ),
    (
        "inventory_items table",
        r#"
        CREATE TABLE IF NOT EXISTS inventory_items (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            product_id UUID NOT NULL REFERENCES products(id),
            encrypted_payload BYTEA NOT NULL,
            encryption_iv BYTEA NOT NULL,
            encryption_tag BYTEA NOT NULL,
            encryption_key_id VARCHAR(50) NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'available',
            order_item_id UUID REFERENCES order_items(id),
            reserved_at TIMESTAMPTZ,
            reservation_expires_at TIMESTAMPTZ,
            sold_at TIMESTAMPTZ,
            -- clock_timestamp: units of one import batch keep insertion order
            created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT inventory_status_valid CHECK (
                status IN ('available', 'reserved', 'sold', 'revoked')
            ),
            -- reserved and sold units always belong to an order item
            CONSTRAINT inventory_binding_consistent CHECK (
                status NOT IN ('reserved', 'sold') OR order_item_id IS NOT NULL
            )
        )
        "#,
    ),
    (
        "inventory created_at default",
        "ALTER TABLE inventory_items ALTER COLUMN created_at SET DEFAULT clock_timestamp()",
    ),
    (
        "inventory claim index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_product_status \
         ON inventory_items(product_id, status, created_at)",
    ),
    (
        "inventory order item index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_order_item ON inventory_items(order_item_id)",
    ),
    (
        "inventory expiry index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_reservation_expiry \
         ON inventory_items(reservation_expires_at) WHERE status = 'reserved'",
    ),
    (
        "inventory key index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_key ON inventory_items(encryption_key_id)",
    ),
    (
        "payments table",
        r#"
        CREATE TABLE IF NOT EXISTS payments (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            payment_method VARCHAR(30) NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'pending',
            amount BIGINT NOT NULL,
            currency VARCHAR(3) NOT NULL,
            provider_tx_id VARCHAR(255) UNIQUE,
            confirmed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT payments_status_valid CHECK (status IN ('pending', 'confirmed', 'refunded'))
        )
        "#,
    ),
    (
        "payments order index",
        "CREATE INDEX IF NOT EXISTS idx_payments_order ON payments(order_id)",
    ),
    (
        "delivery_events table",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_events (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            inventory_item_id UUID NOT NULL REFERENCES inventory_items(id),
            delivery_token VARCHAR(64) NOT NULL UNIQUE,
            token_expires_at TIMESTAMPTZ NOT NULL,
            reveal_count INTEGER NOT NULL DEFAULT 0,
            max_reveals INTEGER NOT NULL DEFAULT 1,
            revealed_at TIMESTAMPTZ,
            revealed_ip TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),

            CONSTRAINT delivery_reveal_count_non_negative CHECK (reveal_count >= 0),
            CONSTRAINT delivery_max_reveals_non_negative CHECK (max_reveals >= 0)
        )
        "#,
    ),
    (
        "delivery created_at default",
        "ALTER TABLE delivery_events ALTER COLUMN created_at SET DEFAULT clock_timestamp()",
    ),
    (
        "live delivery per unit index",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_live_unit \
         ON delivery_events(inventory_item_id) WHERE max_reveals > 0",
    ),
    (
        "delivery order index",
        "CREATE INDEX IF NOT EXISTS idx_delivery_order ON delivery_events(order_id)",
    ),
    (
        "security_events table",
        r#"
        CREATE TABLE IF NOT EXISTS security_events (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            event_type VARCHAR(100) NOT NULL,
            severity VARCHAR(20) NOT NULL,
            ip_address TEXT,
            details JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT security_severity_valid CHECK (severity IN ('info', 'warn', 'critical'))
        )
        "#,
    ),
    (
        "security events index",
        "CREATE INDEX IF NOT EXISTS idx_security_events_type \
         ON security_events(event_type, created_at)",
    ),
];

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
// This struct wraps the SQLx connection pool. All domain queries go through
// `Store::begin`, so every one of them runs inside a transaction.
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            // Each request holds at most one connection for one transaction
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables, constraints and indexes if they don't exist yet.
    pub async fn run_migrations(&self) -> Result<()> {
        for (name, statement) in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {name}"))?;
        }
        tracing::debug!(statements = SCHEMA.len(), "Schema is up to date");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SECURITY EVENTS
    // -------------------------------------------------------------------------
    pub async fn insert_security_event(&self, event: &SecurityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_events (event_type, severity, ip_address, details)
            VALUES ($1, $2, $3, $4::jsonb)
            "#,
        )
        .bind(event.event_type)
        .bind(event.severity.as_str())
        .bind(event.ip_address.as_deref())
        .bind(event.details.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert security event")?;
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx {
            tx,
            started: Instant::now(),
        }))
    }

    /// Check if database connection is healthy
    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// -----------------------------------------------------------------------------
// TRANSACTION
// -----------------------------------------------------------------------------
// sqlx rolls a `Transaction` back when it is dropped uncommitted, which is
// exactly the `StoreTx` contract.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
    started: Instant,
}

#[derive(FromRow)]
struct PayloadRow {
    id: Uuid,
    encrypted_payload: Vec<u8>,
    encryption_iv: Vec<u8>,
    encryption_tag: Vec<u8>,
    encryption_key_id: String,
}

impl From<PayloadRow> for EncryptedPayload {
    fn from(row: PayloadRow) -> Self {
        EncryptedPayload {
            ciphertext: row.encrypted_payload,
            iv: row.encryption_iv,
            tag: row.encryption_tag,
            key_id: row.encryption_key_id,
        }
    }
}

#[derive(FromRow)]
struct DeliveryLookupRow {
    #[sqlx(flatten)]
    event: DeliveryEvent,
    product_name: String,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let PgStoreTx { tx, started } = *self;
        tx.commit().await?;
        metrics::record_db_query("transaction", started.elapsed().as_secs_f64());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PRODUCTS
    // -------------------------------------------------------------------------
    async fn product(&mut self, product_id: Uuid) -> AppResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            "SELECT id, name, price, currency, status, created_at FROM products WHERE id = $1",
        )
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(product)
    }

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------
    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (order_code, customer_email, status, subtotal, total, currency, ip_address)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&order.order_code)
        .bind(&order.customer_email)
        .bind(order.subtotal)
        .bind(order.total)
        .bind(&order.currency)
        .bind(order.ip_address.as_deref())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(order)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> AppResult<OrderItem> {
        let item = sqlx::query_as::<_, OrderItem>(
            r#"
            INSERT INTO order_items (order_id, product_id, product_name, quantity, unit_price, total_price)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, order_id, product_id, product_name, quantity, unit_price, total_price
            "#,
        )
        .bind(item.order_id)
        .bind(item.product_id)
        .bind(&item.product_name)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total_price)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(item)
    }

    async fn lock_order(&mut self, order_id: Uuid) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(order)
    }

    async fn find_order_by_code(&mut self, order_code: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_code = $1"
        ))
        .bind(order_code)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(order)
    }

    async fn order_items(&mut self, order_id: Uuid) -> AppResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, product_name, quantity, unit_price, total_price
            FROM order_items
            WHERE order_id = $1
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(items)
    }

    async fn set_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        fulfilled_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, fulfilled_at = COALESCE($3, fulfilled_at), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(fulfilled_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("order".to_string()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------
    async fn insert_inventory_item(
        &mut self,
        product_id: Uuid,
        payload: &EncryptedPayload,
    ) -> AppResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO inventory_items
                (product_id, encrypted_payload, encryption_iv, encryption_tag, encryption_key_id, status)
            VALUES ($1, $2, $3, $4, $5, 'available')
            RETURNING id
            "#,
        )
        .bind(product_id)
        .bind(&payload.ciphertext)
        .bind(&payload.iv)
        .bind(&payload.tag)
        .bind(&payload.key_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn inventory_item(&mut self, item_id: Uuid) -> AppResult<Option<InventoryItem>> {
        let item = sqlx::query_as::<_, InventoryItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE id = $1"
        ))
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(item)
    }

    async fn claim_available(
        &mut self,
        product_id: Uuid,
        limit: i64,
        order_item_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        // Rows locked by another in-flight checkout are skipped, not waited on.
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE inventory_items
            SET status = 'reserved',
                order_item_id = $3,
                reserved_at = $4,
                reservation_expires_at = $5,
                updated_at = $4
            WHERE id IN (
                SELECT id FROM inventory_items
                WHERE product_id = $1 AND status = 'available'
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(product_id)
        .bind(limit)
        .bind(order_item_id)
        .bind(now)
        .bind(expires_at)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_reserved(
        &mut self,
        order_item_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Uuid>> {
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM inventory_items
            WHERE order_item_id = $1
              AND status = 'reserved'
              AND reservation_expires_at > $2
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(order_item_id)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id.map(|(id,)| id))
    }

    async fn mark_sold(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET status = 'sold', sold_at = $2, reservation_expires_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(item_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidInventoryState);
        }
        Ok(())
    }

    async fn release_reserved(
        &mut self,
        order_item_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET status = 'available',
                order_item_id = NULL,
                reserved_at = NULL,
                reservation_expires_at = NULL,
                updated_at = NOW()
            WHERE order_item_id = $1
              AND status = 'reserved'
              AND ($2::timestamptz IS NULL OR reservation_expires_at <= $2)
            "#,
        )
        .bind(order_item_id)
        .bind(expired_before)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_order_inventory(&mut self, order_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET status = 'available',
                order_item_id = NULL,
                reserved_at = NULL,
                reservation_expires_at = NULL,
                sold_at = NULL,
                updated_at = NOW()
            WHERE status IN ('reserved', 'sold')
              AND order_item_id IN (SELECT id FROM order_items WHERE order_id = $1)
            "#,
        )
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_expired(&mut self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET status = 'available',
                order_item_id = NULL,
                reserved_at = NULL,
                reservation_expires_at = NULL,
                updated_at = $1
            WHERE status = 'reserved' AND reservation_expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_item(&mut self, item_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET status = 'revoked',
                order_item_id = NULL,
                reserved_at = NULL,
                reservation_expires_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status IN ('available', 'reserved')
            "#,
        )
        .bind(item_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn payload(&mut self, item_id: Uuid) -> AppResult<Option<EncryptedPayload>> {
        let row = sqlx::query_as::<_, PayloadRow>(
            r#"
            SELECT id, encrypted_payload, encryption_iv, encryption_tag, encryption_key_id
            FROM inventory_items
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(EncryptedPayload::from))
    }

    async fn lock_payloads_by_key(
        &mut self,
        key_id: &str,
    ) -> AppResult<Vec<(Uuid, EncryptedPayload)>> {
        let rows = sqlx::query_as::<_, PayloadRow>(
            r#"
            SELECT id, encrypted_payload, encryption_iv, encryption_tag, encryption_key_id
            FROM inventory_items
            WHERE encryption_key_id = $1
            ORDER BY created_at, id
            FOR UPDATE
            "#,
        )
        .bind(key_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|row| (row.id, row.into())).collect())
    }

    async fn update_payload(
        &mut self,
        item_id: Uuid,
        payload: &EncryptedPayload,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE inventory_items
            SET encrypted_payload = $2,
                encryption_iv = $3,
                encryption_tag = $4,
                encryption_key_id = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(&payload.ciphertext)
        .bind(&payload.iv)
        .bind(&payload.tag)
        .bind(&payload.key_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn inventory_stats(&mut self, product_id: Uuid) -> AppResult<InventoryStats> {
        let rows: Vec<(InventoryStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM inventory_items
            WHERE product_id = $1
            GROUP BY status
            "#,
        )
        .bind(product_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut stats = InventoryStats {
            product_id,
            ..Default::default()
        };
        for (status, count) in rows {
            stats.add(status, count);
        }
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // DELIVERY EVENTS
    // -------------------------------------------------------------------------
    async fn insert_delivery_event(
        &mut self,
        event: NewDeliveryEvent,
    ) -> AppResult<DeliveryEvent> {
        let event = sqlx::query_as::<_, DeliveryEvent>(&format!(
            r#"
            INSERT INTO delivery_events
                (order_id, inventory_item_id, delivery_token, token_expires_at, max_reveals)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(event.order_id)
        .bind(event.inventory_item_id)
        .bind(&event.delivery_token)
        .bind(event.token_expires_at)
        .bind(event.max_reveals)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(event)
    }

    async fn delivery_by_token(&mut self, token: &str) -> AppResult<Option<DeliveryLookup>> {
        let row = sqlx::query_as::<_, DeliveryLookupRow>(
            r#"
            SELECT d.id, d.order_id, d.inventory_item_id, d.delivery_token,
                   d.token_expires_at, d.reveal_count, d.max_reveals,
                   d.revealed_at, d.revealed_ip, d.created_at,
                   p.name AS product_name
            FROM delivery_events d
            JOIN inventory_items i ON i.id = d.inventory_item_id
            JOIN products p ON p.id = i.product_id
            WHERE d.delivery_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|row| DeliveryLookup {
            event: row.event,
            product_name: row.product_name,
        }))
    }

    async fn claim_reveal(
        &mut self,
        event_id: Uuid,
        now: DateTime<Utc>,
        ip: Option<&str>,
    ) -> AppResult<Option<Uuid>> {
        // The only statement that moves reveal_count. Concurrent reveals of
        // one token serialize on the row; the losers no longer match.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE delivery_events
            SET reveal_count = reveal_count + 1,
                revealed_at = $2,
                revealed_ip = $3
            WHERE id = $1
              AND reveal_count < max_reveals
              AND token_expires_at >= $2
            RETURNING inventory_item_id
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(ip)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(claimed.map(|(id,)| id))
    }

    async fn revoke_token(&mut self, token: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE delivery_events SET max_reveals = 0 WHERE delivery_token = $1")
            .bind(token)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_order_tokens(&mut self, order_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE delivery_events SET max_reveals = 0 WHERE order_id = $1 AND max_reveals > 0",
        )
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expire_stale_tokens(&mut self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_events
            SET max_reveals = 0
            WHERE reveal_count = 0 AND max_reveals > 0 AND token_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deliveries_for_order(&mut self, order_id: Uuid) -> AppResult<Vec<DeliveryEvent>> {
        let events = sqlx::query_as::<_, DeliveryEvent>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM delivery_events WHERE order_id = $1 ORDER BY created_at, id"
        ))
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(events)
    }

    // -------------------------------------------------------------------------
    // PAYMENTS
    // -------------------------------------------------------------------------
    async fn insert_payment(&mut self, payment: NewPayment) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments
                (order_id, payment_method, status, amount, currency, provider_tx_id, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.order_id)
        .bind(payment.payment_method.as_str())
        .bind(payment.status)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.provider_tx_id.as_deref())
        .bind(payment.confirmed_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn payment_by_provider_tx(
        &mut self,
        provider_tx_id: &str,
    ) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_tx_id = $1"
        ))
        .bind(provider_tx_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn pending_payment(&mut self, order_id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE order_id = $1 AND status = $2
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(order_id)
        .bind(PaymentStatus::Pending)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn confirm_payment(
        &mut self,
        payment_id: Uuid,
        provider_tx_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'confirmed',
                provider_tx_id = COALESCE($2, provider_tx_id),
                confirmed_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(provider_tx_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn refund_payments(&mut self, order_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payments SET status = 'refunded', updated_at = NOW() \
             WHERE order_id = $1 AND status <> 'refunded'",
        )
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// TESTS
// =============================================================================
// These run against a real PostgreSQL so that the row locking and the
// conditional UPDATE are exercised, not just their in-memory stand-ins:
//
//   DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::audit::testing::RecordingSink;
    use crate::checkout;
    use crate::engine::{DeliveryPolicy, Engine};
    use crate::fulfillment;
    use crate::models::CheckoutRequest;
    use crate::payments::{self, ManualTransferAdapter, PaymentAdapters, PaymentMethod, ProviderAdapter};
    use crate::vault::fixtures::test_vault;

    async fn engine() -> (Database, Engine) {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a scratch PostgreSQL database");
        let db = Database::connect(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        let engine = Engine::new(
            Arc::new(db.clone()),
            Arc::new(test_vault()),
            Arc::new(RecordingSink::default()),
            DeliveryPolicy::default(),
        );
        (db, engine)
    }

    /// An active product with `units` credentials, inserted in one
    /// transaction. Returns the unit ids in insertion order.
    async fn stocked_product(db: &Database, units: usize) -> (Uuid, Vec<Uuid>) {
        let (product_id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO products (name, price, currency, status) \
             VALUES ($1, 500, 'USD', 'active') RETURNING id",
        )
        .bind(format!("pg-test-{}", Uuid::new_v4()))
        .fetch_one(&db.pool)
        .await
        .unwrap();

        let vault = test_vault();
        let mut tx = db.begin().await.unwrap();
        let mut ids = Vec::with_capacity(units);
        for i in 0..units {
            let payload = vault.encrypt(&format!("pg-cred-{i}"), "v1").unwrap();
            ids.push(tx.insert_inventory_item(product_id, &payload).await.unwrap());
        }
        tx.commit().await.unwrap();
        (product_id, ids)
    }

    fn adapters() -> PaymentAdapters {
        PaymentAdapters::new(ManualTransferAdapter::new(None), ProviderAdapter::new(None))
    }

    async fn place(engine: &Engine, product_id: Uuid, quantity: i32) -> AppResult<checkout::PlacedOrder> {
        checkout::checkout(
            engine,
            &adapters(),
            CheckoutRequest {
                email: "pg@example.com".to_string(),
                email_confirm: "pg@example.com".to_string(),
                product_id,
                quantity,
                payment_method: PaymentMethod::ManualTransfer,
            },
            None,
        )
        .await
    }

    #[tokio::test]
    #[ignore = "needs PostgreSQL at DATABASE_URL"]
    async fn test_reserve_claims_batch_in_insertion_order() {
        let (db, engine) = engine().await;
        let (product_id, ids) = stocked_product(&db, 5).await;

        let placed = place(&engine, product_id, 2).await.unwrap();
        let mut reserved = placed.reserved.clone();
        reserved.sort();
        let mut oldest = ids[..2].to_vec();
        oldest.sort();
        assert_eq!(reserved, oldest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore = "needs PostgreSQL at DATABASE_URL"]
    async fn test_skip_locked_claims_never_oversell() {
        const UNITS: usize = 5;
        const BUYERS: usize = 20;

        let (db, engine) = engine().await;
        let (product_id, _) = stocked_product(&db, UNITS).await;

        let handles: Vec<_> = (0..BUYERS)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { place(&engine, product_id, 1).await })
            })
            .collect();

        let mut reserved = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(placed) => reserved.extend(placed.reserved),
                Err(AppError::InsufficientStock) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        reserved.sort();
        reserved.dedup();
        assert_eq!(reserved.len(), UNITS);

        let mut tx = db.begin().await.unwrap();
        let stats = tx.inventory_stats(product_id).await.unwrap();
        assert_eq!(stats.reserved, UNITS as i64);
        assert_eq!(stats.available, 0);
    }

    #[tokio::test]
    #[ignore = "needs PostgreSQL at DATABASE_URL"]
    async fn test_conditional_reveal_update_has_one_winner() {
        let (db, engine) = engine().await;
        let (product_id, _) = stocked_product(&db, 1).await;
        let placed = place(&engine, product_id, 1).await.unwrap();
        payments::mark_paid(&engine, placed.order.id).await.unwrap();
        let tokens = fulfillment::fulfill(&engine, placed.order.id).await.unwrap();

        // Both transactions see an unrevealed row before either updates it
        let mut first = db.begin().await.unwrap();
        let mut second = db.begin().await.unwrap();
        let event = second
            .delivery_by_token(&tokens[0])
            .await
            .unwrap()
            .unwrap()
            .event;
        assert!(!event.is_exhausted());

        let now = Utc::now();
        assert!(first
            .claim_reveal(event.id, now, Some("198.51.100.1"))
            .await
            .unwrap()
            .is_some());

        // The second UPDATE blocks on the row lock, then re-checks its
        // predicate against the committed row
        let (lost, committed) = tokio::join!(
            second.claim_reveal(event.id, now, Some("198.51.100.2")),
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                first.commit().await
            }
        );
        committed.unwrap();
        assert!(lost.unwrap().is_none());
        drop(second);

        let mut tx = db.begin().await.unwrap();
        let events = tx.deliveries_for_order(placed.order.id).await.unwrap();
        assert_eq!(events[0].reveal_count, 1);
        assert_eq!(events[0].revealed_ip.as_deref(), Some("198.51.100.1"));
    }
}
