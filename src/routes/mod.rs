//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/invoices/*` - invoice 생성/제출/조회 (exporter)
//! - `/pools/*` - pool 조회, 투자, waterfall 미리보기
//! - `/admin/*` - 승인/반려, pool 생성/종료/지급/정산, 잔액 조정
//! - `/balances/*`, `/risk-profile/*`, `/exporter-applications` - 사용자 계정
//! - `/events` - 최근 도메인 이벤트
//!
//! # Authentication
//!
//! 인증은 앞단 게이트웨이가 처리하고, 검증된 호출자를 헤더로 전달한다.
//!
//! - `x-actor-id`: 사용자 UUID
//! - `x-actor-role`: `exporter` | `investor` | `admin`

pub mod admin;
pub mod events;
pub mod health;
pub mod investors;
pub mod invoices;
pub mod pools;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::types::{Actor, Role, UserId};
use crate::AppState;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let id = header(ACTOR_ID_HEADER)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ApiError::Unauthorized)?;
        let role = header(ACTOR_ROLE_HEADER)
            .and_then(Role::parse)
            .ok_or(ApiError::Unauthorized)?;

        Ok(Actor::new(UserId::from(id), role))
    }
}

/// 라우터 생성 (미들웨어 제외)
///
/// # Route Structure
///
/// ```text
/// GET  /health
///
/// POST /invoices                              - draft 생성
/// GET  /invoices/:id
/// POST /invoices/:id/submit                   - 심사 요청 (grading)
/// GET  /invoices/:id/grade-suggestion
///
/// GET  /pools?status=
/// GET  /pools/:id
/// GET  /pools/:id/contributions
/// POST /pools/:id/contributions               - 투자
/// GET  /pools/:id/settlement
/// POST /pools/:id/waterfall/preview
///
/// POST /admin/invoices/:id/approve
/// POST /admin/invoices/:id/reject
/// POST /admin/invoices/:id/pool
/// POST /admin/pools/:id/force-close
/// POST /admin/pools/:id/disburse
/// POST /admin/pools/:id/repayment
/// POST /admin/exporter-applications/:id/approve
/// POST /admin/exporter-applications/:id/reject
/// POST /admin/balances/:user/grant
///
/// POST /exporter-applications
/// GET  /balances/:user
/// GET  /balances/:user/ledger
/// GET  /investors/:user/contributions
/// POST /risk-profile
/// GET  /risk-profile/:user
///
/// GET  /events?limit=
/// ```
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // Invoices
        .route("/invoices", post(invoices::create_invoice))
        .route("/invoices/:id", get(invoices::get_invoice))
        .route("/invoices/:id/submit", post(invoices::submit_invoice))
        .route("/invoices/:id/grade-suggestion", get(invoices::grade_suggestion))

        // Pools
        .route("/pools", get(pools::list_pools))
        .route("/pools/:id", get(pools::get_pool))
        .route(
            "/pools/:id/contributions",
            get(pools::list_contributions).post(pools::contribute),
        )
        .route("/pools/:id/settlement", get(pools::get_settlement))
        .route("/pools/:id/waterfall/preview", post(pools::preview_waterfall))

        // Admin
        .route("/admin/invoices/:id/approve", post(admin::approve_invoice))
        .route("/admin/invoices/:id/reject", post(admin::reject_invoice))
        .route("/admin/invoices/:id/pool", post(admin::create_pool))
        .route("/admin/pools/:id/force-close", post(admin::force_close))
        .route("/admin/pools/:id/disburse", post(admin::disburse))
        .route("/admin/pools/:id/repayment", post(admin::record_repayment))
        .route(
            "/admin/exporter-applications/:id/approve",
            post(admin::approve_application),
        )
        .route(
            "/admin/exporter-applications/:id/reject",
            post(admin::reject_application),
        )
        .route("/admin/balances/:user/grant", post(admin::grant_balance))

        // Accounts
        .route("/exporter-applications", post(investors::submit_application))
        .route("/balances/:user", get(investors::get_balance))
        .route("/balances/:user/ledger", get(investors::get_ledger))
        .route("/investors/:user/contributions", get(investors::investor_contributions))
        .route("/risk-profile", post(investors::submit_risk_profile))
        .route("/risk-profile/:user", get(investors::get_risk_profile))

        // Events
        .route("/events", get(events::recent_events))

        // 상태 주입
        .with_state(state)
}
