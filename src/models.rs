// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the storage layer, the engine components and the
// HTTP handlers.
//
// LEARNING NOTES:
// - Status columns are plain text in PostgreSQL (guarded by CHECK constraints)
//   and closed enums in Rust; the `text_enum!` macro below bridges the two
// - Row structs derive FromRow so SQLx can map query results directly
// - Encrypted payload bytes are never part of these structs; they only travel
//   through `vault::EncryptedPayload`
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::payments::PaymentMethod;

// =============================================================================
// TEXT-BACKED ENUMS
// =============================================================================

/// A status string read from storage did not match any known variant.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// -----------------------------------------------------------------------------
// text_enum! macro
// -----------------------------------------------------------------------------
// Generates `as_str`, `Display`, `FromStr` and the SQLx Type/Encode/Decode
// impls for an enum stored as a text column.
//
// LEARNING NOTE:
// sqlx's derive(Type) maps enums to *custom* PostgreSQL enum types. We store
// statuses as VARCHAR, so we delegate to the `str` impls instead.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let text = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                Ok(text.parse()?)
            }
        }
    };
}

/// Catalog lifecycle of a product. Only `Active` products can be bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Draft,
    Active,
    Archived,
}

text_enum!(ProductStatus, "product status", {
    Draft => "draft",
    Active => "active",
    Archived => "archived",
});

/// State machine of a single credential unit.
///
/// ```text
/// available -> reserved -> sold
/// available -> reserved -> available   (expiry, release or refund)
/// sold -> available                    (refund)
/// available|reserved -> revoked        (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    Available,
    Reserved,
    Sold,
    Revoked,
}

text_enum!(InventoryStatus, "inventory status", {
    Available => "available",
    Reserved => "reserved",
    Sold => "sold",
    Revoked => "revoked",
});

impl InventoryStatus {
    /// Whether an operator may revoke a unit in this state.
    pub fn is_revocable(&self) -> bool {
        matches!(self, Self::Available | Self::Reserved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Fulfilled,
    Refunded,
    Cancelled,
}

text_enum!(OrderStatus, "order status", {
    Pending => "pending",
    Paid => "paid",
    Fulfilled => "fulfilled",
    Refunded => "refunded",
    Cancelled => "cancelled",
});

impl OrderStatus {
    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Paid | Self::Fulfilled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Refunded,
}

text_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Refunded => "refunded",
});

// =============================================================================
// STORED ENTITIES
// =============================================================================

/// Sellable catalog entry. Prices are integer minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
}

/// One credential unit, without its encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub encryption_key_id: String,
    pub status: InventoryStatus,
    pub order_item_id: Option<Uuid>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub order_code: String,
    pub customer_email: String,
    pub status: OrderStatus,
    pub subtotal: i64,
    pub total: i64,
    pub currency: String,
    pub ip_address: Option<String>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable line of an order; name and prices are snapshots taken at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
}

/// A reveal-once capability bound to one inventory unit of one order.
#[derive(Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub inventory_item_id: Uuid,
    pub delivery_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub reveal_count: i32,
    pub max_reveals: i32,
    pub revealed_at: Option<DateTime<Utc>>,
    pub revealed_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.token_expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.reveal_count >= self.max_reveals
    }
}

// Tokens are capabilities: keep them out of debug output.
impl fmt::Debug for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEvent")
            .field("id", &self.id)
            .field("order_id", &self.order_id)
            .field("inventory_item_id", &self.inventory_item_id)
            .field("delivery_token", &token_prefix(&self.delivery_token))
            .field("token_expires_at", &self.token_expires_at)
            .field("reveal_count", &self.reveal_count)
            .field("max_reveals", &self.max_reveals)
            .field("revealed_at", &self.revealed_at)
            .finish()
    }
}

/// First eight characters of a token, the most that may appear in logs.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub payment_method: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub currency: String,
    pub provider_tx_id: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A delivery event joined with the name of the product it delivers.
#[derive(Debug, Clone)]
pub struct DeliveryLookup {
    pub event: DeliveryEvent,
    pub product_name: String,
}

/// Per-status unit counts for one product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStats {
    pub product_id: Uuid,
    pub available: i64,
    pub reserved: i64,
    pub sold: i64,
    pub revoked: i64,
    pub total: i64,
}

impl InventoryStats {
    pub fn add(&mut self, status: InventoryStatus, count: i64) {
        match status {
            InventoryStatus::Available => self.available += count,
            InventoryStatus::Reserved => self.reserved += count,
            InventoryStatus::Sold => self.sold += count,
            InventoryStatus::Revoked => self.revoked += count,
        }
        self.total += count;
    }
}

// -----------------------------------------------------------------------------
// INSERT PAYLOADS
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_code: String,
    pub customer_email: String,
    pub subtotal: i64,
    pub total: i64,
    pub currency: String,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
}

#[derive(Debug, Clone)]
pub struct NewDeliveryEvent {
    pub order_id: Uuid,
    pub inventory_item_id: Uuid,
    pub delivery_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub max_reveals: i32,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: i64,
    pub currency: String,
    pub provider_tx_id: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// CHECKOUT
// -----------------------------------------------------------------------------
/// Request body for `POST /api/v1/checkout`
///
/// # Example JSON
/// ```json
/// {
///   "email": "buyer@example.com",
///   "email_confirm": "buyer@example.com",
///   "product_id": "6f1c...",
///   "quantity": 1,
///   "payment_method": "manual_transfer"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub email: String,
    pub email_confirm: String,
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub order_code: String,
    pub total: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_instructions: Option<String>,
}

// -----------------------------------------------------------------------------
// ORDER LOOKUP
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLookupRequest {
    pub order_code: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLookupResponse {
    pub order_code: String,
    pub status: OrderStatus,
    pub total: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderLookupItem>,
    pub delivery_links: Vec<DeliveryLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLookupItem {
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLink {
    pub token: String,
    pub revealed: bool,
    pub expired: bool,
    /// Disabled before it was ever used (refund, admin revoke, sweeper)
    pub revoked: bool,
}

// -----------------------------------------------------------------------------
// DELIVERY
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Ready,
    Revealed,
    Expired,
    NotFound,
}

/// Result of `GET /api/v1/delivery/:token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCheck {
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
}

#[derive(Serialize)]
pub struct RevealResponse {
    pub credential: String,
}

/// Admin view of one delivery capability. Carries the token so an operator can
/// resend the link; never carries the credential.
#[derive(Debug, Clone, Serialize)]
pub struct AdminDeliveryView {
    pub id: Uuid,
    pub inventory_item_id: Uuid,
    pub token: String,
    pub token_expires_at: DateTime<Utc>,
    pub reveal_count: i32,
    pub max_reveals: i32,
    pub revealed_at: Option<DateTime<Utc>>,
}

impl From<DeliveryEvent> for AdminDeliveryView {
    fn from(event: DeliveryEvent) -> Self {
        Self {
            id: event.id,
            inventory_item_id: event.inventory_item_id,
            token: event.delivery_token,
            token_expires_at: event.token_expires_at,
            reveal_count: event.reveal_count,
            max_reveals: event.max_reveals,
            revealed_at: event.revealed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillResponse {
    pub order_id: Uuid,
    pub delivery_tokens: Vec<String>,
}

// -----------------------------------------------------------------------------
// ADMIN: INVENTORY & KEYS
// -----------------------------------------------------------------------------
#[derive(Deserialize)]
pub struct ImportInventoryRequest {
    pub product_id: Uuid,
    pub credentials: Vec<String>,
}

// Credentials in transit must not show up in debug output.
impl fmt::Debug for ImportInventoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportInventoryRequest")
            .field("product_id", &self.product_id)
            .field("credentials", &format_args!("<{} redacted>", self.credentials.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportInventoryResponse {
    pub product_id: Uuid,
    pub imported: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateKeysRequest {
    pub from_key_id: String,
    pub to_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub from_key_id: String,
    pub to_key_id: String,
    pub rotated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub released_reservations: u64,
    pub expired_tokens: u64,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub rate_limiter: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
