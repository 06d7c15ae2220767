//! Pool Endpoints
//!
//! funding pool 조회와 tranche 투자.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::{
    error::{ApiError, EngineError},
    services::{Contribution, PoolStatus, PoolSummary, Settlement, WaterfallResult},
    types::{Actor, PoolId, Tranche},
    AppState,
};

// ============ Request/Response Types ============

/// 목록 필터
#[derive(Debug, Deserialize)]
pub struct PoolListQuery {
    /// open | filled | disbursed | closed
    pub status: Option<String>,
}

/// 투자 요청
#[derive(Debug, Deserialize)]
pub struct ContributeRequest {
    pub tranche: Tranche,
    /// IDR 금액 (정수)
    pub amount: i64,
}

/// 정산 금액 (preview / repayment 공용)
#[derive(Debug, Deserialize)]
pub struct ProceedsRequest {
    /// 수령한 상환 총액 (IDR)
    pub gross_proceeds: i64,
}

// ============ Handlers ============

/// GET /pools?status=open
pub async fn list_pools(
    State(state): State<AppState>,
    Query(query): Query<PoolListQuery>,
) -> Result<Json<Vec<PoolSummary>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(PoolStatus::parse(s)?),
        None => None,
    };
    Ok(Json(state.market.list_pools(status).await?))
}

/// GET /pools/:id
///
/// tranche별 target/funded/remaining + 진행률(bps)
pub async fn get_pool(
    State(state): State<AppState>,
    Path(id): Path<PoolId>,
) -> Result<Json<PoolSummary>, ApiError> {
    Ok(Json(state.market.get_pool(id).await?))
}

/// GET /pools/:id/contributions (exporter 본인 또는 admin)
pub async fn list_contributions(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
) -> Result<Json<Vec<Contribution>>, ApiError> {
    Ok(Json(state.market.pool_contributions(actor, id).await?))
}

/// POST /pools/:id/contributions
///
/// # Errors
///
/// - 403 `TIER_LOCKED`: catalyst 자격 없음
/// - 409 `CAPACITY_EXCEEDED`: tranche 잔여 용량 초과 (부분 수락 없음)
/// - 422 `INSUFFICIENT_BALANCE`: 투자자 잔액 부족
pub async fn contribute(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
    Json(req): Json<ContributeRequest>,
) -> Result<(StatusCode, Json<Contribution>), ApiError> {
    let contribution = state
        .market
        .contribute(actor, id, req.tranche, req.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(contribution)))
}

/// GET /pools/:id/settlement
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(id): Path<PoolId>,
) -> Result<Json<Settlement>, ApiError> {
    state
        .market
        .settlement(id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("settlement for pool {}", id)).into())
}

/// POST /pools/:id/waterfall/preview (admin, 부수효과 없음)
pub async fn preview_waterfall(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
    Json(req): Json<ProceedsRequest>,
) -> Result<Json<WaterfallResult>, ApiError> {
    Ok(Json(
        state
            .market
            .preview_waterfall(actor, id, req.gross_proceeds)
            .await?,
    ))
}
