// =============================================================================
// REFUND / CANCEL
// =============================================================================
// Reverses an order. Refund works on paid and fulfilled orders: units return
// to the pool and every delivery token of the order stops working. Cancel
// drops a pending order and its reservations.
// =============================================================================

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{SecurityEvent, Severity};
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::OrderStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundReport {
    pub order_id: Uuid,
    pub released_units: u64,
    pub revoked_tokens: u64,
}

pub async fn refund(engine: &Engine, order_id: Uuid) -> AppResult<RefundReport> {
    let mut tx = engine.begin().await?;

    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("order".to_string()))?;
    if !order.status.is_refundable() {
        return Err(AppError::InvalidOrderState {
            status: order.status,
        });
    }

    tx.set_order_status(order_id, OrderStatus::Refunded, None)
        .await?;
    tx.refund_payments(order_id).await?;
    let released_units = tx.release_order_inventory(order_id).await?;
    let revoked_tokens = tx.revoke_order_tokens(order_id).await?;
    tx.commit().await?;

    metrics::record_refund();
    tracing::info!(%order_id, released_units, revoked_tokens, "Order refunded");
    engine.record(
        SecurityEvent::new("order.refunded", Severity::Info).details(json!({
            "order_id": order_id,
            "previous_status": order.status.as_str(),
            "released_units": released_units,
            "revoked_tokens": revoked_tokens,
        })),
    );

    Ok(RefundReport {
        order_id,
        released_units,
        revoked_tokens,
    })
}

/// Cancels a pending order and frees what it reserved. Returns the number of
/// units released.
pub async fn cancel(engine: &Engine, order_id: Uuid) -> AppResult<u64> {
    let mut tx = engine.begin().await?;

    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("order".to_string()))?;
    if order.status != OrderStatus::Pending {
        return Err(AppError::InvalidOrderState {
            status: order.status,
        });
    }

    let mut released = 0;
    for item in tx.order_items(order_id).await? {
        released += tx.release_reserved(item.id, None).await?;
    }
    tx.set_order_status(order_id, OrderStatus::Cancelled, None)
        .await?;
    tx.commit().await?;

    tracing::info!(%order_id, released, "Order cancelled");
    Ok(released)
}
