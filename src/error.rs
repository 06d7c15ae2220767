//! Error Handling Module
//!
//! Two layers:
//! - `EngineError`: 도메인 에러 (grading, invoice, pool, waterfall, ledger)
//! - `ApiError`: HTTP 상태 코드 매핑 (axum `IntoResponse`)
//!
//! Uses thiserror for domain errors and integrates with tracing for structured logging.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::types::{PoolId, Tranche, UserId};

/// 엔진 에러
///
/// # Design Decision
///
/// 모든 상태 변경 연산은 all-or-nothing.
/// 에러가 반환되면 어떤 엔티티도 변경되지 않은 상태다.
#[derive(Debug, Error)]
pub enum EngineError {
    /// 잘못된 입력 (비율 합 != 100%, 음수 이율 등)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 현재 lifecycle 상태에서 허용되지 않는 연산
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// tranche 목표 금액 초과 (부분 체결 없음)
    #[error("Capacity exceeded on {tranche} tranche: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        tranche: Tranche,
        requested: i64,
        remaining: i64,
    },

    /// 잔액 부족
    #[error("Insufficient balance for {user}: available {available}, requested {requested}")]
    InsufficientBalance {
        user: UserId,
        available: i64,
        requested: i64,
    },

    /// 내부 정합성 위반 (contribution 합 != funded_amount). 도달하면 안 됨.
    #[error("Pool {pool} ledger mismatch: recorded {recorded}, contributions {ledger}")]
    InsufficientPoolFunds {
        pool: PoolId,
        recorded: i64,
        ledger: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// catalyst tranche 투자 자격 없음
    #[error("Investor {0} has not unlocked the catalyst tranche")]
    TierLocked(UserId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// 응답/로그용 안정적인 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            EngineError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            EngineError::InsufficientPoolFunds { .. } => "INSUFFICIENT_POOL_FUNDS",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::TierLocked(_) => "TIER_LOCKED",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Overflow(_) => "OVERFLOW",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// SQLx 에러를 EngineError로 변환
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                // unique violation (예: funding_pools.invoice_id)
                EngineError::InvalidState(format!("duplicate record: {}", db.message()))
            }
            _ => {
                tracing::error!("SQLx error: {:?}", err);
                EngineError::Storage(err.to_string())
            }
        }
    }
}

/// API 에러 타입
///
/// 각 에러 variant는 적절한 HTTP 상태 코드에 매핑됨.
/// 민감한 내부 정보는 클라이언트에 노출하지 않음.
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 400 Bad Request ============
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // ============ 401 Unauthorized ============
    #[error("Authentication required")]
    Unauthorized,

    // ============ Domain ============
    #[error(transparent)]
    Engine(#[from] EngineError),

    // ============ 500 Internal Server Error ============
    #[error("Internal server error")]
    InternalError,
}

/// API 에러 응답 구조
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<String>) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
                None,
            ),
            ApiError::InternalError => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            ApiError::Engine(err) => {
                let code = err.code();
                match err {
                    // 4xx 클라이언트 에러
                    EngineError::Validation(msg) => (
                        StatusCode::BAD_REQUEST,
                        code,
                        "Validation failed".to_string(),
                        Some(msg.clone()),
                    ),
                    EngineError::Forbidden(_) | EngineError::TierLocked(_) => {
                        (StatusCode::FORBIDDEN, code, err.to_string(), None)
                    }
                    EngineError::NotFound(resource) => (
                        StatusCode::NOT_FOUND,
                        code,
                        format!("{} not found", resource),
                        None,
                    ),
                    EngineError::InvalidState(_) | EngineError::CapacityExceeded { .. } => {
                        (StatusCode::CONFLICT, code, err.to_string(), None)
                    }
                    EngineError::InsufficientBalance { .. } => {
                        (StatusCode::UNPROCESSABLE_ENTITY, code, err.to_string(), None)
                    }

                    // 5xx 서버 에러: 상세 정보는 로그에만
                    EngineError::InsufficientPoolFunds { .. }
                    | EngineError::Overflow(_)
                    | EngineError::Storage(_) => {
                        tracing::error!("Engine failure: {}", err);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            code,
                            "An internal error occurred".to_string(),
                            None,
                        )
                    }
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// anyhow 에러를 ApiError로 변환
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {:?}", err);
        ApiError::InternalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::InvalidState("x".into()), StatusCode::CONFLICT),
            (
                EngineError::CapacityExceeded { tranche: Tranche::Priority, requested: 2, remaining: 1 },
                StatusCode::CONFLICT,
            ),
            (EngineError::TierLocked(UserId::new()), StatusCode::FORBIDDEN),
            (EngineError::NotFound("pool".into()), StatusCode::NOT_FOUND),
            (EngineError::Storage("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_unauthorized() {
        assert_eq!(ApiError::Unauthorized.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
