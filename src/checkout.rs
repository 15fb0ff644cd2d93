// =============================================================================
// CHECKOUT & ORDER LOOKUP
// =============================================================================
// Creates a pending order with its units reserved and a payment intent, in
// one transaction. If stock runs out half way, the order never existed.
// =============================================================================

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::allocator;
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::models::{
    CheckoutRequest, CheckoutResponse, DeliveryLink, NewOrder, NewOrderItem, Order,
    OrderLookupItem, OrderLookupResponse, ProductStatus,
};
use crate::payments::PaymentAdapters;

pub const MAX_QUANTITY: i32 = 10;
const MAX_EMAIL_LEN: usize = 255;

const ORDER_CODE_PREFIX: &str = "ORD-";
const ORDER_CODE_LEN: usize = 10;
/// No 0/O or 1/I, so codes survive being read over the phone.
const ORDER_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// `ORD-` followed by 10 characters (50 bits) from the OS RNG.
pub fn generate_order_code() -> String {
    let mut bytes = [0u8; ORDER_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    // 256 is a multiple of 32, so the modulo is unbiased
    let code: String = bytes
        .iter()
        .map(|b| ORDER_CODE_ALPHABET[usize::from(*b) % ORDER_CODE_ALPHABET.len()] as char)
        .collect();
    format!("{ORDER_CODE_PREFIX}{code}")
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// Checks the request and returns the normalized buyer email.
pub fn validate(request: &CheckoutRequest) -> AppResult<String> {
    let email = normalize_email(&request.email);
    if !is_valid_email(&email) {
        return Err(AppError::BadRequest("invalid email address".to_string()));
    }
    if email != normalize_email(&request.email_confirm) {
        return Err(AppError::BadRequest("email addresses do not match".to_string()));
    }
    if !(1..=MAX_QUANTITY).contains(&request.quantity) {
        return Err(AppError::BadRequest(format!(
            "quantity must be between 1 and {MAX_QUANTITY}"
        )));
    }
    Ok(email)
}

/// A committed checkout.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: Order,
    pub reserved: Vec<Uuid>,
    pub payment_instructions: Option<String>,
}

impl PlacedOrder {
    pub fn to_response(&self) -> CheckoutResponse {
        CheckoutResponse {
            order_code: self.order.order_code.clone(),
            total: self.order.total,
            currency: self.order.currency.clone(),
            payment_instructions: self.payment_instructions.clone(),
        }
    }
}

pub async fn checkout(
    engine: &Engine,
    adapters: &PaymentAdapters,
    request: CheckoutRequest,
    ip: Option<&str>,
) -> AppResult<PlacedOrder> {
    let email = validate(&request)?;
    let mut tx = engine.begin().await?;

    let product = tx
        .product(request.product_id)
        .await?
        .filter(|p| p.status == ProductStatus::Active)
        .ok_or_else(|| AppError::NotFound("product".to_string()))?;

    let total = product
        .price
        .checked_mul(i64::from(request.quantity))
        .ok_or_else(|| AppError::BadRequest("order total out of range".to_string()))?;

    let order = tx
        .insert_order(NewOrder {
            order_code: generate_order_code(),
            customer_email: email,
            subtotal: total,
            total,
            currency: product.currency.clone(),
            ip_address: ip.map(str::to_string),
        })
        .await?;

    let item = tx
        .insert_order_item(NewOrderItem {
            order_id: order.id,
            product_id: product.id,
            product_name: product.name.clone(),
            quantity: request.quantity,
            unit_price: product.price,
            total_price: total,
        })
        .await?;

    // InsufficientStock returns here and the order rolls back with the tx
    let reserved = allocator::reserve(
        tx.as_mut(),
        product.id,
        request.quantity,
        item.id,
        engine.policy.reservation_ttl,
    )
    .await?;

    let intent = adapters
        .get(request.payment_method)
        .create_intent(tx.as_mut(), &order)
        .await?;

    tx.commit().await?;

    tracing::info!(
        order_id = %order.id,
        order_code = %order.order_code,
        product_id = %product.id,
        quantity = request.quantity,
        method = %request.payment_method,
        "Order placed"
    );

    Ok(PlacedOrder {
        order,
        reserved,
        payment_instructions: intent.instructions,
    })
}

/// Order summary for a buyer who knows both the code and the email. Any
/// mismatch is reported exactly like an unknown code.
pub async fn lookup(engine: &Engine, order_code: &str, email: &str) -> AppResult<OrderLookupResponse> {
    let not_found = || AppError::NotFound("order".to_string());

    let mut tx = engine.begin().await?;
    let order = tx
        .find_order_by_code(&order_code.trim().to_uppercase())
        .await?
        .filter(|o| o.customer_email == normalize_email(email))
        .ok_or_else(not_found)?;

    let items = tx.order_items(order.id).await?;
    let deliveries = tx.deliveries_for_order(order.id).await?;
    let now = Utc::now();

    Ok(OrderLookupResponse {
        order_code: order.order_code,
        status: order.status,
        total: order.total,
        currency: order.currency,
        created_at: order.created_at,
        fulfilled_at: order.fulfilled_at,
        items: items
            .into_iter()
            .map(|i| OrderLookupItem {
                product_name: i.product_name,
                quantity: i.quantity,
                unit_price: i.unit_price,
                total_price: i.total_price,
            })
            .collect(),
        delivery_links: deliveries
            .into_iter()
            .map(|d| DeliveryLink {
                revealed: d.reveal_count > 0,
                expired: d.is_expired(now),
                revoked: d.reveal_count == 0 && d.is_exhausted(),
                token: d.delivery_token,
            })
            .collect(),
    })
}
