// =============================================================================
// FULFILLMENT
// =============================================================================
// Turns a paid order into sold units and delivery tokens, all or nothing.
//
// Units reserved for the order item at checkout are delivered when they are
// still held; otherwise fresh stock is claimed. If any unit cannot be found
// the transaction is dropped and nothing of this call survives.
// =============================================================================

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::allocator;
use crate::audit::{SecurityEvent, Severity};
use crate::delivery;
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::OrderStatus;

/// Fulfills a `paid` order. Returns one delivery token per unit.
pub async fn fulfill(engine: &Engine, order_id: Uuid) -> AppResult<Vec<String>> {
    let policy = engine.policy;
    let mut tx = engine.begin().await?;

    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("order".to_string()))?;
    if order.status != OrderStatus::Paid {
        return Err(AppError::InvalidOrderState {
            status: order.status,
        });
    }

    let now = Utc::now();
    let items = tx.order_items(order_id).await?;
    let mut tokens = Vec::new();

    for item in &items {
        // Lapsed holds go back first so they can't be mistaken for live ones
        let lapsed = tx.release_reserved(item.id, Some(now)).await?;
        if lapsed > 0 {
            tracing::debug!(order_item_id = %item.id, lapsed, "Released lapsed reservations");
        }

        for _ in 0..item.quantity {
            let unit_id = match tx.claim_reserved(item.id, now).await? {
                Some(unit_id) => unit_id,
                None => {
                    let claimed = allocator::reserve(
                        tx.as_mut(),
                        item.product_id,
                        1,
                        item.id,
                        policy.reservation_ttl,
                    )
                    .await?;
                    claimed
                        .into_iter()
                        .next()
                        .ok_or(AppError::InsufficientStock)?
                }
            };

            tx.mark_sold(unit_id, now).await?;
            let token = delivery::issue(
                tx.as_mut(),
                order_id,
                unit_id,
                policy.token_ttl,
                policy.max_reveals,
            )
            .await?;
            tokens.push(token);
        }
    }

    tx.set_order_status(order_id, OrderStatus::Fulfilled, Some(now))
        .await?;
    tx.commit().await?;

    metrics::record_fulfillment();
    tracing::info!(%order_id, units = tokens.len(), "Order fulfilled");
    engine.record(
        SecurityEvent::new("order.fulfilled", Severity::Info).details(json!({
            "order_id": order_id,
            "units": tokens.len(),
        })),
    );

    Ok(tokens)
}
