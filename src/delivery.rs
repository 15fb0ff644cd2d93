// =============================================================================
// DELIVERY TOKEN SERVICE
// =============================================================================
// Mints reveal-once capabilities for sold units and redeems them.
//
// LEARNING NOTES:
// - A token is 256 bits from the OS RNG, URL-safe base64 without padding
// - `check` answers from the delivery row alone and never touches the vault
// - `reveal` does everything in one transaction: the conditional increment
//   is the only thing that can move reveal_count, and the plaintext leaves
//   this module only after the increment committed
// - Unknown tokens and tokens of other orders look identical to the caller
// =============================================================================

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{SecurityEvent, Severity};
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    token_prefix, DeliveryCheck, DeliveryEvent, DeliveryStatus, NewDeliveryEvent,
};
use crate::store::StoreTx;
use crate::vault::Credential;

const TOKEN_BYTES: usize = 32;

/// Encoded length of a token: 32 bytes in unpadded base64.
pub const TOKEN_LEN: usize = 43;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Shape check before any lookup. Anything that could not have come from
/// `generate_token` is simply not found.
fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Creates the delivery event for one sold unit, inside the caller's
/// transaction. Returns the token.
pub async fn issue(
    tx: &mut dyn StoreTx,
    order_id: Uuid,
    inventory_item_id: Uuid,
    ttl: Duration,
    max_reveals: i32,
) -> AppResult<String> {
    let token = generate_token();
    tx.insert_delivery_event(NewDeliveryEvent {
        order_id,
        inventory_item_id,
        delivery_token: token.clone(),
        token_expires_at: Utc::now() + ttl,
        max_reveals,
    })
    .await?;

    tracing::debug!(
        %order_id,
        %inventory_item_id,
        token = %token_prefix(&token),
        "Delivery token issued"
    );
    Ok(token)
}

/// Status of a token for the delivery page.
pub async fn check(engine: &Engine, token: &str) -> AppResult<DeliveryCheck> {
    if !is_well_formed(token) {
        return Ok(DeliveryCheck {
            status: DeliveryStatus::NotFound,
            product_name: None,
        });
    }

    let mut tx = engine.begin().await?;
    let Some(lookup) = tx.delivery_by_token(token).await? else {
        return Ok(DeliveryCheck {
            status: DeliveryStatus::NotFound,
            product_name: None,
        });
    };

    let status = if lookup.event.is_expired(Utc::now()) {
        DeliveryStatus::Expired
    } else if lookup.event.is_exhausted() {
        DeliveryStatus::Revealed
    } else {
        DeliveryStatus::Ready
    };

    Ok(DeliveryCheck {
        status,
        product_name: Some(lookup.product_name),
    })
}

/// Redeems a token for its credential.
///
/// Errors: `NotFound`, `Expired`, `AlreadyRevealed` (including a lost race),
/// `DeliveryUnavailable` when the payload cannot be decrypted.
pub async fn reveal(engine: &Engine, token: &str, ip: Option<&str>) -> AppResult<Credential> {
    let prefix = token_prefix(token);

    let result = reveal_in_tx(engine, token, ip).await;
    let outcome = match &result {
        Ok(_) => "revealed",
        Err(AppError::NotFound(_)) => "not_found",
        Err(AppError::Expired) => "expired",
        Err(AppError::AlreadyRevealed) => "already_revealed",
        Err(AppError::RaceLost) => "race_lost",
        Err(AppError::DeliveryUnavailable) => "decrypt_error",
        Err(_) => "error",
    };
    metrics::record_reveal(outcome);

    match result {
        Ok(credential) => {
            tracing::info!(token = %prefix, "Credential revealed");
            engine.record(
                SecurityEvent::new("delivery.revealed", Severity::Info)
                    .ip(ip)
                    .details(json!({ "token_prefix": prefix })),
            );
            Ok(credential)
        }
        Err(AppError::NotFound(_)) => {
            engine.record(
                SecurityEvent::new("delivery.invalid_token", Severity::Warn)
                    .ip(ip)
                    .details(json!({ "token_prefix": prefix })),
            );
            Err(AppError::NotFound("delivery".to_string()))
        }
        Err(AppError::AlreadyRevealed) | Err(AppError::RaceLost) => {
            engine.record(
                SecurityEvent::new("delivery.repeat_reveal", Severity::Warn)
                    .ip(ip)
                    .details(json!({ "token_prefix": prefix, "race": outcome == "race_lost" })),
            );
            Err(AppError::AlreadyRevealed)
        }
        Err(other) => Err(other),
    }
}

async fn reveal_in_tx(engine: &Engine, token: &str, ip: Option<&str>) -> AppResult<Credential> {
    if !is_well_formed(token) {
        return Err(AppError::NotFound("delivery".to_string()));
    }

    let mut tx = engine.begin().await?;
    let lookup = tx
        .delivery_by_token(token)
        .await?
        .ok_or_else(|| AppError::NotFound("delivery".to_string()))?;
    let event = lookup.event;

    let now = Utc::now();
    if event.is_expired(now) {
        return Err(AppError::Expired);
    }
    if event.is_exhausted() {
        return Err(AppError::AlreadyRevealed);
    }

    let item_id = tx
        .claim_reveal(event.id, now, ip)
        .await?
        .ok_or(AppError::RaceLost)?;

    let decrypted = match tx.payload(item_id).await? {
        Some(payload) => engine
            .vault
            .decrypt(&payload)
            .map_err(|e| (e.to_string(), payload.key_id)),
        None => Err(("payload missing".to_string(), String::new())),
    };

    let credential = match decrypted {
        Ok(credential) => credential,
        Err((reason, key_id)) => {
            // Roll back so the buyer keeps the reveal they never received.
            drop(tx);
            tracing::error!(
                %item_id,
                key_id = %key_id,
                reason = %reason,
                token = %token_prefix(token),
                "Credential payload could not be decrypted"
            );
            engine.record(
                SecurityEvent::new("delivery.decrypt_failed", Severity::Critical)
                    .ip(ip)
                    .details(json!({
                        "inventory_item_id": item_id,
                        "key_id": key_id,
                        "token_prefix": token_prefix(token),
                    })),
            );
            return Err(AppError::DeliveryUnavailable);
        }
    };

    tx.commit().await?;
    Ok(credential)
}

/// Disables a token (`max_reveals = 0`).
pub async fn revoke(engine: &Engine, token: &str) -> AppResult<()> {
    let mut tx = engine.begin().await?;
    if !tx.revoke_token(token).await? {
        return Err(AppError::NotFound("delivery".to_string()));
    }
    tx.commit().await?;

    tracing::info!(token = %token_prefix(token), "Delivery token revoked");
    engine.record(
        SecurityEvent::new("delivery.revoked", Severity::Info)
            .details(json!({ "token_prefix": token_prefix(token) })),
    );
    Ok(())
}

pub async fn deliveries_for_order(engine: &Engine, order_id: Uuid) -> AppResult<Vec<DeliveryEvent>> {
    let mut tx = engine.begin().await?;
    if tx.lock_order(order_id).await?.is_none() {
        return Err(AppError::NotFound("order".to_string()));
    }
    tx.deliveries_for_order(order_id).await
}
