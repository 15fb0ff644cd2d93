// =============================================================================
// INVENTORY ADMINISTRATION
// =============================================================================
// Operator-side stock management: bulk import of credentials (encrypted on
// the way in), revocation of single units and per-product counts.
// =============================================================================

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{SecurityEvent, Severity};
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::models::InventoryStats;

pub const MAX_IMPORT_BATCH: usize = 500;
pub const MAX_CREDENTIAL_LEN: usize = 5000;

/// Encrypts each credential under the active key and stores it as an
/// `available` unit. All or nothing.
pub async fn import(engine: &Engine, product_id: Uuid, credentials: Vec<String>) -> AppResult<usize> {
    let credentials = Zeroizing::new(credentials);

    if credentials.is_empty() || credentials.len() > MAX_IMPORT_BATCH {
        return Err(AppError::BadRequest(format!(
            "between 1 and {MAX_IMPORT_BATCH} credentials per import"
        )));
    }
    if let Some(index) = credentials
        .iter()
        .position(|c| c.trim().is_empty() || c.len() > MAX_CREDENTIAL_LEN)
    {
        return Err(AppError::BadRequest(format!(
            "credential #{} must be 1 to {MAX_CREDENTIAL_LEN} characters",
            index + 1
        )));
    }

    let key_id = engine.vault.active_key_id().to_string();
    let mut tx = engine.begin().await?;
    if tx.product(product_id).await?.is_none() {
        return Err(AppError::NotFound("product".to_string()));
    }

    for credential in credentials.iter() {
        let payload = engine.vault.encrypt(credential, &key_id)?;
        tx.insert_inventory_item(product_id, &payload).await?;
    }
    tx.commit().await?;

    let imported = credentials.len();
    tracing::info!(%product_id, imported, key_id = %key_id, "Inventory imported");
    engine.record(
        SecurityEvent::new("inventory.imported", Severity::Info).details(json!({
            "product_id": product_id,
            "count": imported,
            "key_id": key_id,
        })),
    );
    Ok(imported)
}

/// Takes a unit out of circulation for good. Only `available` and
/// `reserved` units can be revoked.
pub async fn revoke_item(engine: &Engine, item_id: Uuid) -> AppResult<()> {
    let mut tx = engine.begin().await?;
    if tx.inventory_item(item_id).await?.is_none() {
        return Err(AppError::NotFound("inventory item".to_string()));
    }
    if !tx.revoke_item(item_id, Utc::now()).await? {
        return Err(AppError::InvalidInventoryState);
    }
    tx.commit().await?;

    tracing::info!(%item_id, "Inventory item revoked");
    engine.record(
        SecurityEvent::new("inventory.revoked", Severity::Warn)
            .details(json!({ "inventory_item_id": item_id })),
    );
    Ok(())
}

pub async fn stats(engine: &Engine, product_id: Uuid) -> AppResult<InventoryStats> {
    let mut tx = engine.begin().await?;
    if tx.product(product_id).await?.is_none() {
        return Err(AppError::NotFound("product".to_string()));
    }
    tx.inventory_stats(product_id).await
}
