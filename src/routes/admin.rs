//! Admin Endpoints
//!
//! 모든 핸들러는 `x-actor-role: admin` 필요 (권한 확인은 Marketplace에서).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::{
    error::ApiError,
    services::{ExporterApplication, FundingPool, Grade, Invoice, Settlement},
    types::{Actor, ApplicationId, Balance, InvoiceId, PoolId, UserId},
    AppState,
};

use super::pools::ProceedsRequest;

// ============ Request Types ============

/// 승인 요청. 관리자 등급이 최종 (제안과 달라도 됨)
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub grade: Grade,
    pub notes: Option<String>,
}

/// 반려 요청 (사유 필수)
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceCloseRequest {
    pub reason: Option<String>,
}

/// 잔액 조정 (부호 있는 IDR 금액)
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub amount: i64,
}

// ============ Invoices ============

/// POST /admin/invoices/:id/approve
pub async fn approve_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(
        state
            .market
            .approve_invoice(actor, id, req.grade, req.notes)
            .await?,
    ))
}

/// POST /admin/invoices/:id/reject
pub async fn reject_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.market.reject_invoice(actor, id, &req.reason).await?))
}

/// POST /admin/invoices/:id/pool
///
/// approved invoice를 tokenize하고 funding pool 오픈
pub async fn create_pool(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
) -> Result<(StatusCode, Json<FundingPool>), ApiError> {
    let pool = state.market.create_pool(actor, id).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

// ============ Pools ============

/// POST /admin/pools/:id/force-close
///
/// body 생략 가능
pub async fn force_close(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
    req: Option<Json<ForceCloseRequest>>,
) -> Result<Json<FundingPool>, ApiError> {
    let reason = req.and_then(|Json(r)| r.reason);
    Ok(Json(state.market.force_close(actor, id, reason).await?))
}

/// POST /admin/pools/:id/disburse
pub async fn disburse(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
) -> Result<Json<FundingPool>, ApiError> {
    Ok(Json(state.market.disburse(actor, id).await?))
}

/// POST /admin/pools/:id/repayment
///
/// 같은 금액으로 재호출하면 기존 정산을 그대로 반환 (멱등)
pub async fn record_repayment(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<PoolId>,
    Json(req): Json<ProceedsRequest>,
) -> Result<Json<Settlement>, ApiError> {
    Ok(Json(
        state
            .market
            .record_repayment(actor, id, req.gross_proceeds)
            .await?,
    ))
}

// ============ Exporter applications ============

/// POST /admin/exporter-applications/:id/approve
pub async fn approve_application(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ApplicationId>,
) -> Result<Json<ExporterApplication>, ApiError> {
    Ok(Json(state.market.approve_exporter_application(actor, id).await?))
}

/// POST /admin/exporter-applications/:id/reject
pub async fn reject_application(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ApplicationId>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<ExporterApplication>, ApiError> {
    Ok(Json(
        state
            .market
            .reject_exporter_application(actor, id, &req.reason)
            .await?,
    ))
}

// ============ Balances ============

/// POST /admin/balances/:user/grant
pub async fn grant_balance(
    State(state): State<AppState>,
    actor: Actor,
    Path(user): Path<UserId>,
    Json(req): Json<GrantRequest>,
) -> Result<Json<Balance>, ApiError> {
    Ok(Json(state.market.grant_balance(actor, user, req.amount).await?))
}
