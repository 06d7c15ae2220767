//! Event Feed Endpoint
//!
//! 최근 도메인 이벤트 (in-process 버퍼, 재시작 시 비워짐)

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::{error::ApiError, services::EventEnvelope, types::Actor, AppState};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// 기본 50, 최대 500
    pub limit: Option<usize>,
}

/// GET /events?limit=50 (admin)
pub async fn recent_events(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventEnvelope>>, ApiError> {
    actor.require_admin()?;
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(state.market.recent_events(limit)))
}
