//! Invoice Endpoints
//!
//! exporter의 invoice 생성과 심사 요청.
//! 금액은 원 통화 minor unit 정수, 환율은 문자열 decimal (`"15800.25"`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::ApiError,
    services::{GradeSuggestion, Invoice, NewInvoice},
    types::{Actor, InvoiceId},
    AppState,
};

// ============ Handlers ============

/// POST /invoices
///
/// draft invoice 생성 (exporter)
///
/// # Request
///
/// ```json
/// {
///   "invoice_number": "INV-2024-001",
///   "buyer": { "name": "Yamada Trading", "country": "JP", "repeat_buyer": true },
///   "original_amount": 1000000,
///   "original_currency": "JPY",
///   "fx_rate": "100",
///   "due_date": "2024-06-30T00:00:00Z",
///   "funding_duration_days": 90,
///   "tranches": {
///     "priority_ratio_bps": 8000, "catalyst_ratio_bps": 2000,
///     "priority_interest_bps": 1000, "catalyst_interest_bps": 1800
///   },
///   "documents": [{ "kind": "invoice", "reference": "s3://docs/inv-001.pdf" }]
/// }
/// ```
pub async fn create_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<NewInvoice>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let invoice = state.market.create_invoice(actor, req).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

/// GET /invoices/:id
pub async fn get_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.market.get_invoice(actor, id).await?))
}

/// POST /invoices/:id/submit
///
/// draft → pending_review. 응답에 등급 제안 포함.
pub async fn submit_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.market.submit_invoice(actor, id).await?))
}

/// GET /invoices/:id/grade-suggestion
///
/// 현재 신호 기준으로 다시 계산 (저장하지 않음)
pub async fn grade_suggestion(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<InvoiceId>,
) -> Result<Json<GradeSuggestion>, ApiError> {
    Ok(Json(state.market.grade_suggestion(actor, id).await?))
}
