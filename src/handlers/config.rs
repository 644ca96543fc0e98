use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial JSON update.
///
/// Engine defaults, storage settings and the job timeout apply to the next
/// request. Settings baked into the running server are stored but reported
/// under `restart_required`.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let running = state.get_config();
    let mut updated = running.clone();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    let restart_required = updated.restart_required(&running);
    if restart_required.is_empty() {
        tracing::info!("Configuration updated");
    } else {
        tracing::warn!(
            settings = ?restart_required,
            "Configuration updated; some settings take effect only after a restart"
        );
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "restart_required": restart_required,
        "updated_config": updated
    })))
}
