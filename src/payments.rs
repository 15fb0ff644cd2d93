// =============================================================================
// PAYMENTS
// =============================================================================
// The adapter boundary to payment collection. The engine only needs to know
// that an order was paid; how the money moved is the adapter's business.
//
// LEARNING NOTES:
// - The adapter is picked by an explicit `PaymentMethod` (checkout field,
//   webhook URL segment). Webhook payloads are never inspected to guess
//   which provider sent them
// - Provider webhooks are authenticated with HMAC-SHA256 over the raw body;
//   `Mac::verify_slice` compares in constant time
// - Confirmation is idempotent on `provider_tx_id`: a redelivered webhook
//   gets `already_confirmed` instead of a second state change
// =============================================================================

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::audit::{SecurityEvent, Severity};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::models::{NewPayment, Order, OrderStatus, Payment, PaymentStatus};
use crate::store::StoreTx;

/// Header carrying the hex HMAC-SHA256 of a provider webhook body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

const DEFAULT_TRANSFER_INSTRUCTIONS: &str =
    "Transfer the order total by bank transfer and put the order code in the payment reference.";

type HmacSha256 = Hmac<Sha256>;

// -----------------------------------------------------------------------------
// PAYMENT METHOD
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Buyer wires the money; an operator confirms with mark-paid.
    #[default]
    ManualTransfer,
    /// External processor that reports back through signed webhooks.
    Provider,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::ManualTransfer => "manual_transfer",
            PaymentMethod::Provider => "provider",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual_transfer" => Ok(PaymentMethod::ManualTransfer),
            "provider" => Ok(PaymentMethod::Provider),
            other => Err(AppError::BadRequest(format!("unknown payment method: {other}"))),
        }
    }
}

// -----------------------------------------------------------------------------
// ADAPTER TRAIT
// -----------------------------------------------------------------------------

/// A pending payment created at checkout.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub payment: Payment,
    /// Shown to the buyer, if the method needs them to do something.
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Paid,
    Failed,
}

/// Authenticated content of a provider webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub order_id: Uuid,
    pub provider_tx_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: WebhookStatus,
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn create_intent(&self, tx: &mut dyn StoreTx, order: &Order) -> AppResult<PaymentIntent>;

    /// Authenticates and parses a webhook body. Fails with `Unauthorized`
    /// when the signature does not verify.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<WebhookEvent>;
}

async fn insert_pending(
    tx: &mut dyn StoreTx,
    order: &Order,
    method: PaymentMethod,
) -> AppResult<Payment> {
    tx.insert_payment(NewPayment {
        order_id: order.id,
        payment_method: method,
        status: PaymentStatus::Pending,
        amount: order.total,
        currency: order.currency.clone(),
        provider_tx_id: None,
        confirmed_at: None,
    })
    .await
}

// -----------------------------------------------------------------------------
// MANUAL TRANSFER
// -----------------------------------------------------------------------------
pub struct ManualTransferAdapter {
    instructions: String,
}

impl ManualTransferAdapter {
    pub fn new(instructions: Option<String>) -> Self {
        Self {
            instructions: instructions
                .unwrap_or_else(|| DEFAULT_TRANSFER_INSTRUCTIONS.to_string()),
        }
    }
}

#[async_trait]
impl PaymentAdapter for ManualTransferAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::ManualTransfer
    }

    async fn create_intent(&self, tx: &mut dyn StoreTx, order: &Order) -> AppResult<PaymentIntent> {
        let payment = insert_pending(tx, order, self.method()).await?;
        Ok(PaymentIntent {
            payment,
            instructions: Some(format!(
                "{} Reference: {}",
                self.instructions, order.order_code
            )),
        })
    }

    fn verify_webhook(&self, _headers: &HeaderMap, _body: &[u8]) -> AppResult<WebhookEvent> {
        Err(AppError::BadRequest(
            "manual transfers are confirmed by an operator".to_string(),
        ))
    }
}

// -----------------------------------------------------------------------------
// PROVIDER
// -----------------------------------------------------------------------------
pub struct ProviderAdapter {
    webhook_secret: Option<String>,
}

impl ProviderAdapter {
    pub fn new(webhook_secret: Option<String>) -> Self {
        Self { webhook_secret }
    }

    /// Hex HMAC-SHA256 of `body`, as the provider sends it.
    pub fn sign(secret: &str, body: &[u8]) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl PaymentAdapter for ProviderAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Provider
    }

    async fn create_intent(&self, tx: &mut dyn StoreTx, order: &Order) -> AppResult<PaymentIntent> {
        let payment = insert_pending(tx, order, self.method()).await?;
        Ok(PaymentIntent {
            payment,
            instructions: None,
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<WebhookEvent> {
        let secret = self.webhook_secret.as_deref().ok_or_else(|| {
            tracing::warn!("Provider webhook received but PAYMENT_WEBHOOK_SECRET is not set");
            AppError::Unauthorized
        })?;

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| hex::decode(v.trim()).ok())
            .ok_or(AppError::Unauthorized)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal("invalid webhook secret".to_string()))?;
        mac.update(body);
        mac.verify_slice(&signature)
            .map_err(|_| AppError::Unauthorized)?;

        serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(format!("malformed webhook body: {e}")))
    }
}

// -----------------------------------------------------------------------------
// REGISTRY
// -----------------------------------------------------------------------------
/// One adapter per `PaymentMethod`.
pub struct PaymentAdapters {
    manual: ManualTransferAdapter,
    provider: ProviderAdapter,
}

impl PaymentAdapters {
    pub fn new(manual: ManualTransferAdapter, provider: ProviderAdapter) -> Self {
        Self { manual, provider }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ManualTransferAdapter::new(config.bank_transfer_instructions.clone()),
            ProviderAdapter::new(config.payment_webhook_secret.clone()),
        )
    }

    pub fn get(&self, method: PaymentMethod) -> &dyn PaymentAdapter {
        match method {
            PaymentMethod::ManualTransfer => &self.manual,
            PaymentMethod::Provider => &self.provider,
        }
    }
}

// =============================================================================
// CONFIRMATION
// =============================================================================

/// What the payment side reports. `amount`/`currency` are None when an
/// operator attests the payment by hand.
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub method: PaymentMethod,
    pub provider_tx_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// Authentic webhook that reports something other than a payment.
    Ignored,
}

/// Moves a pending order to `paid` and records the confirmed payment, in
/// one transaction.
pub async fn confirm(
    engine: &Engine,
    order_id: Uuid,
    confirmation: PaymentConfirmation,
) -> AppResult<ConfirmOutcome> {
    let mut tx = engine.begin().await?;

    if let Some(tx_id) = confirmation.provider_tx_id.as_deref() {
        if let Some(existing) = tx.payment_by_provider_tx(tx_id).await? {
            if existing.status != PaymentStatus::Pending {
                tracing::debug!(%order_id, "Payment already processed");
                return Ok(ConfirmOutcome::AlreadyConfirmed);
            }
        }
    }

    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("order".to_string()))?;

    if order.status != OrderStatus::Pending {
        return Err(AppError::InvalidOrderState {
            status: order.status,
        });
    }

    let amount_ok = confirmation.amount.map_or(true, |a| a == order.total);
    let currency_ok = confirmation
        .currency
        .as_deref()
        .map_or(true, |c| c.eq_ignore_ascii_case(&order.currency));
    if !amount_ok || !currency_ok {
        engine.record(
            SecurityEvent::new("payment.amount_mismatch", Severity::Warn).details(json!({
                "order_id": order_id,
                "expected_amount": order.total,
                "reported_amount": confirmation.amount,
                "reported_currency": confirmation.currency,
            })),
        );
        return Err(AppError::BadRequest(
            "payment amount does not match the order".to_string(),
        ));
    }

    let now = Utc::now();
    match tx.pending_payment(order_id).await? {
        Some(payment) => {
            tx.confirm_payment(payment.id, confirmation.provider_tx_id.as_deref(), now)
                .await?
        }
        None => {
            tx.insert_payment(NewPayment {
                order_id,
                payment_method: confirmation.method,
                status: PaymentStatus::Confirmed,
                amount: order.total,
                currency: order.currency.clone(),
                provider_tx_id: confirmation.provider_tx_id.clone(),
                confirmed_at: Some(now),
            })
            .await?;
        }
    }
    tx.set_order_status(order_id, OrderStatus::Paid, None).await?;
    tx.commit().await?;

    tracing::info!(%order_id, method = %confirmation.method, "Payment confirmed");
    engine.record(
        SecurityEvent::new("payment.confirmed", Severity::Info).details(json!({
            "order_id": order_id,
            "method": confirmation.method.as_str(),
        })),
    );

    Ok(ConfirmOutcome::Confirmed)
}

/// Operator confirmation of a manual transfer.
pub async fn mark_paid(engine: &Engine, order_id: Uuid) -> AppResult<ConfirmOutcome> {
    confirm(
        engine,
        order_id,
        PaymentConfirmation {
            method: PaymentMethod::ManualTransfer,
            provider_tx_id: None,
            amount: None,
            currency: None,
        },
    )
    .await
}

/// Verifies a webhook with the adapter for `method` and applies it.
pub async fn handle_webhook(
    engine: &Engine,
    adapters: &PaymentAdapters,
    method: PaymentMethod,
    headers: &HeaderMap,
    body: &[u8],
    ip: Option<&str>,
) -> AppResult<ConfirmOutcome> {
    let event = match adapters.get(method).verify_webhook(headers, body) {
        Ok(event) => event,
        Err(AppError::Unauthorized) => {
            engine.record(
                SecurityEvent::new("webhook.invalid_signature", Severity::Critical)
                    .ip(ip)
                    .details(json!({ "method": method.as_str() })),
            );
            return Err(AppError::Unauthorized);
        }
        Err(e) => return Err(e),
    };

    if event.status != WebhookStatus::Paid {
        tracing::info!(order_id = %event.order_id, "Ignoring non-payment webhook");
        return Ok(ConfirmOutcome::Ignored);
    }

    let result = confirm(
        engine,
        event.order_id,
        PaymentConfirmation {
            method,
            provider_tx_id: Some(event.provider_tx_id.clone()),
            amount: Some(event.amount),
            currency: Some(event.currency.clone()),
        },
    )
    .await;

    if let Err(AppError::NotFound(_)) = &result {
        engine.record(
            SecurityEvent::new("webhook.order_not_found", Severity::Warn)
                .ip(ip)
                .details(json!({
                    "order_id": event.order_id,
                    "provider_tx_id": event.provider_tx_id,
                })),
        );
    }
    result
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::TestEngine;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test";

    fn adapters() -> PaymentAdapters {
        PaymentAdapters::new(
            ManualTransferAdapter::new(None),
            ProviderAdapter::new(Some(SECRET.to_string())),
        )
    }

    fn signed(body: &[u8], secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&ProviderAdapter::sign(secret, body)).unwrap(),
        );
        headers
    }

    fn webhook_body(order: &Order, tx_id: &str, amount: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "order_id": order.id,
            "provider_tx_id": tx_id,
            "amount": amount,
            "currency": order.currency,
            "status": "paid",
        }))
        .unwrap()
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(
            "provider".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::Provider
        );
        assert!("stripe".parse::<PaymentMethod>().is_err());
        assert_eq!(PaymentMethod::default(), PaymentMethod::ManualTransfer);
    }

    #[test]
    fn test_signature_verification() {
        let adapter = ProviderAdapter::new(Some(SECRET.to_string()));
        let body = br#"{"order_id":"6a1f8e1c-4f7e-4c3a-9f59-0c4b1e0d8d11","provider_tx_id":"tx_1","amount":500,"currency":"USD","status":"paid"}"#;

        let event = adapter.verify_webhook(&signed(body, SECRET), body).unwrap();
        assert_eq!(event.provider_tx_id, "tx_1");
        assert_eq!(event.amount, 500);

        let forged = adapter.verify_webhook(&signed(body, "wrong-secret"), body);
        assert!(matches!(forged, Err(AppError::Unauthorized)));

        let missing = adapter.verify_webhook(&HeaderMap::new(), body);
        assert!(matches!(missing, Err(AppError::Unauthorized)));

        let mut tampered = body.to_vec();
        tampered[10] ^= 1;
        let result = adapter.verify_webhook(&signed(body, SECRET), &tampered);
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[test]
    fn test_unconfigured_secret_rejects_everything() {
        let adapter = ProviderAdapter::new(None);
        let body = b"{}";
        assert!(matches!(
            adapter.verify_webhook(&signed(body, ""), body),
            Err(AppError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_manual_mark_paid() {
        let t = TestEngine::new();
        let product = t.stock("Game Key", 500, 1).await;
        let order = t.place_order(&product, 1).await;

        let outcome = mark_paid(&t.engine, order.id).await.unwrap();
        assert_eq!(outcome, ConfirmOutcome::Confirmed);
        assert_eq!(t.store.order(order.id).await.unwrap().status, OrderStatus::Paid);

        let payments = t.store.payments_of(order.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Confirmed);

        // Second confirmation is a state error, not a second payment
        let again = mark_paid(&t.engine, order.id).await;
        assert!(matches!(
            again,
            Err(AppError::InvalidOrderState {
                status: OrderStatus::Paid
            })
        ));
    }

    #[tokio::test]
    async fn test_webhook_is_idempotent() {
        let t = TestEngine::new();
        let product = t.stock("Game Key", 500, 1).await;
        let order = t.place_order_with(&product, 1, PaymentMethod::Provider).await;
        let adapters = adapters();

        let body = webhook_body(&order, "tx_42", 500);
        let headers = signed(&body, SECRET);

        let first = handle_webhook(&t.engine, &adapters, PaymentMethod::Provider, &headers, &body, None)
            .await
            .unwrap();
        assert_eq!(first, ConfirmOutcome::Confirmed);

        let second = handle_webhook(&t.engine, &adapters, PaymentMethod::Provider, &headers, &body, None)
            .await
            .unwrap();
        assert_eq!(second, ConfirmOutcome::AlreadyConfirmed);

        let payments = t.store.payments_of(order.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].provider_tx_id.as_deref(), Some("tx_42"));
    }

    #[tokio::test]
    async fn test_webhook_amount_mismatch_is_rejected() {
        let t = TestEngine::new();
        let product = t.stock("Game Key", 500, 1).await;
        let order = t.place_order_with(&product, 1, PaymentMethod::Provider).await;

        let body = webhook_body(&order, "tx_low", 1);
        let result = handle_webhook(
            &t.engine,
            &adapters(),
            PaymentMethod::Provider,
            &signed(&body, SECRET),
            &body,
            None,
        )
        .await;

        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(t.store.order(order.id).await.unwrap().status, OrderStatus::Pending);
        assert_eq!(t.security.count("payment.amount_mismatch"), 1);
    }

    #[tokio::test]
    async fn test_forged_webhook_is_recorded() {
        let t = TestEngine::new();
        let product = t.stock("Game Key", 500, 1).await;
        let order = t.place_order_with(&product, 1, PaymentMethod::Provider).await;

        let body = webhook_body(&order, "tx_forged", 500);
        let result = handle_webhook(
            &t.engine,
            &adapters(),
            PaymentMethod::Provider,
            &signed(&body, "attacker"),
            &body,
            Some("203.0.113.9"),
        )
        .await;

        assert!(matches!(result, Err(AppError::Unauthorized)));
        assert_eq!(
            t.security.severity_of("webhook.invalid_signature"),
            Some(Severity::Critical)
        );
        assert_eq!(t.store.order(order.id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_manual_method_has_no_webhook() {
        let t = TestEngine::new();
        let result = handle_webhook(
            &t.engine,
            &adapters(),
            PaymentMethod::ManualTransfer,
            &HeaderMap::new(),
            b"{}",
            None,
        )
        .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
