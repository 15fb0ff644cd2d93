// =============================================================================
// INVENTORY ALLOCATOR
// =============================================================================
// Claims credential units for an order item.
//
// LEARNING NOTES:
// - `reserve` runs inside the caller's transaction. On InsufficientStock the
//   caller returns the error, the transaction is dropped, and every row it
//   touched (including the order it just inserted) rolls back
// - The claim is one UPDATE over a `FOR UPDATE SKIP LOCKED` subselect, so
//   two checkouts for the last unit cannot both get it, and checkouts for
//   different units never wait on each other
// =============================================================================

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::store::StoreTx;

/// Reserves exactly `quantity` available units of `product_id` for
/// `order_item_id`, oldest stock first, until `now + ttl`.
pub async fn reserve(
    tx: &mut dyn StoreTx,
    product_id: Uuid,
    quantity: i32,
    order_item_id: Uuid,
    ttl: Duration,
) -> AppResult<Vec<Uuid>> {
    if quantity < 1 {
        return Err(AppError::BadRequest("quantity must be at least 1".to_string()));
    }

    let now = Utc::now();
    let claimed = tx
        .claim_available(product_id, i64::from(quantity), order_item_id, now, now + ttl)
        .await?;

    if claimed.len() < quantity as usize {
        // Counts stay in the log; the caller only learns "not enough".
        tracing::info!(
            %product_id,
            requested = quantity,
            claimed = claimed.len(),
            "Reservation failed: insufficient stock"
        );
        metrics::record_reservation(false);
        return Err(AppError::InsufficientStock);
    }

    tracing::debug!(%product_id, %order_item_id, quantity, "Units reserved");
    metrics::record_reservation(true);
    Ok(claimed)
}

/// Returns every unit reserved for the order item to the pool. Idempotent.
pub async fn release(engine: &Engine, order_item_id: Uuid) -> AppResult<u64> {
    let mut tx = engine.begin().await?;
    let released = tx.release_reserved(order_item_id, None).await?;
    tx.commit().await?;

    if released > 0 {
        tracing::info!(%order_item_id, released, "Reservation released");
    }
    Ok(released)
}
