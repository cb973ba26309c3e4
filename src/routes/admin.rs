use actix_web::{get, web, HttpResponse};

use crate::error::AppError;
use crate::state::AppState;

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Connection-state metrics: live count, average age, per-topic counts, and
/// the last sweep's counters.
#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.manager.lifecycle().get_metrics().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Instance-level stats: local socket count vs. the directory-wide total.
#[get("/stats")]
pub async fn stats(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stats = state.manager.stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[get("/topics")]
pub async fn topics(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let catalog = state.manager.directory().list_topics().await?;
    Ok(HttpResponse::Ok().json(catalog))
}
