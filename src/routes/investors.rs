//! Account Endpoints
//!
//! 잔액/원장 조회, 위험 성향 설문, exporter 가입 신청.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::{
    error::ApiError,
    services::{Contribution, ExporterApplication, RiskProfile},
    types::{Actor, Balance, LedgerEntry, Tranche, UserId},
    AppState,
};

// ============ Request Types ============

/// 위험 성향 설문 제출
#[derive(Debug, Deserialize)]
pub struct RiskProfileRequest {
    /// 5개 문항, 각 0..=3
    pub answers: Vec<u8>,
    pub selected_tier: Tranche,
}

/// Exporter 가입 신청
#[derive(Debug, Deserialize)]
pub struct ApplicationRequest {
    pub company_name: String,
    /// ISO 국가 코드
    pub country: String,
}

// ============ Handlers ============

/// GET /balances/:user
pub async fn get_balance(
    State(state): State<AppState>,
    actor: Actor,
    Path(user): Path<UserId>,
) -> Result<Json<Balance>, ApiError> {
    Ok(Json(state.market.balance(actor, user).await?))
}

/// GET /balances/:user/ledger
pub async fn get_ledger(
    State(state): State<AppState>,
    actor: Actor,
    Path(user): Path<UserId>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    Ok(Json(state.market.ledger(actor, user).await?))
}

/// GET /investors/:user/contributions
pub async fn investor_contributions(
    State(state): State<AppState>,
    actor: Actor,
    Path(user): Path<UserId>,
) -> Result<Json<Vec<Contribution>>, ApiError> {
    Ok(Json(state.market.investor_contributions(actor, user).await?))
}

/// POST /risk-profile
///
/// 재응시하면 이전 결과를 덮어씀
pub async fn submit_risk_profile(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<RiskProfileRequest>,
) -> Result<Json<RiskProfile>, ApiError> {
    Ok(Json(
        state
            .market
            .submit_questionnaire(actor, &req.answers, req.selected_tier)
            .await?,
    ))
}

/// GET /risk-profile/:user
///
/// 설문 전이면 `completed: false` 프로필
pub async fn get_risk_profile(
    State(state): State<AppState>,
    actor: Actor,
    Path(user): Path<UserId>,
) -> Result<Json<RiskProfile>, ApiError> {
    Ok(Json(state.market.risk_profile(actor, user).await?))
}

/// POST /exporter-applications
pub async fn submit_application(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<ApplicationRequest>,
) -> Result<(StatusCode, Json<ExporterApplication>), ApiError> {
    let application = state
        .market
        .submit_exporter_application(actor, &req.company_name, &req.country)
        .await?;
    Ok((StatusCode::CREATED, Json(application)))
}
