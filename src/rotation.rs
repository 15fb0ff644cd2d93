// =============================================================================
// KEY ROTATION
// =============================================================================
// Re-encrypts every unit sealed under one key with another, in a single
// transaction. Either every payload moves or none does.
// =============================================================================

use serde_json::json;

use crate::audit::{SecurityEvent, Severity};
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::models::RotationReport;

pub async fn rotate(engine: &Engine, from_key_id: &str, to_key_id: &str) -> AppResult<RotationReport> {
    let from = from_key_id.trim().to_lowercase();
    let to = to_key_id.trim().to_lowercase();

    if from == to {
        return Err(AppError::BadRequest("source and target keys must differ".to_string()));
    }
    for key_id in [&from, &to] {
        if !engine.vault.has_key(key_id) {
            return Err(AppError::BadRequest(format!("key {key_id} is not configured")));
        }
    }

    let mut tx = engine.begin().await?;
    let payloads = tx.lock_payloads_by_key(&from).await?;

    for (item_id, payload) in &payloads {
        let credential = engine.vault.decrypt(payload).map_err(|e| {
            tracing::error!(%item_id, key_id = %from, "Rotation aborted: payload failed to decrypt");
            e
        })?;
        let resealed = engine.vault.encrypt(credential.expose(), &to)?;
        tx.update_payload(*item_id, &resealed).await?;
    }
    tx.commit().await?;

    let rotated = payloads.len();
    tracing::info!(from = %from, to = %to, rotated, "Encryption keys rotated");
    engine.record(
        SecurityEvent::new("keys.rotated", Severity::Warn).details(json!({
            "from_key_id": from,
            "to_key_id": to,
            "rotated": rotated,
        })),
    );

    Ok(RotationReport {
        from_key_id: from,
        to_key_id: to,
        rotated,
    })
}
