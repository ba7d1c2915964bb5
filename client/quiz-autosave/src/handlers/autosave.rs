use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::metrics::AUTOSAVE_DEV_REQUESTS_TOTAL;
use crate::models::{AutosaveRequest, SaveConfirmation};
use crate::services::DevServerState;

/// POST /api/autosave
pub async fn save_answers(
    State(state): State<Arc<DevServerState>>,
    Json(req): Json<AutosaveRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!(
        "Autosave for exam={}, user={}, changes={}",
        req.exam_quiz_id,
        req.user_id,
        req.changes.len()
    );

    let latency = state.latency();
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }

    if state.take_injected_failure() {
        AUTOSAVE_DEV_REQUESTS_TOTAL
            .with_label_values(&["injected_failure"])
            .inc();
        tracing::warn!("Injected autosave failure for exam={}", req.exam_quiz_id);
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Injected failure".to_string(),
        ));
    }

    if req.exam_quiz_id.trim().is_empty() || req.user_id.trim().is_empty() {
        AUTOSAVE_DEV_REQUESTS_TOTAL
            .with_label_values(&["invalid"])
            .inc();
        return Err((
            StatusCode::BAD_REQUEST,
            "examQuizId and userId are required".to_string(),
        ));
    }

    let saved = state.record(req);
    AUTOSAVE_DEV_REQUESTS_TOTAL
        .with_label_values(&["saved"])
        .inc();

    Ok((
        StatusCode::OK,
        Json(SaveConfirmation {
            success: true,
            timestamp: Some(Utc::now()),
            saved,
            message: None,
        }),
    ))
}
