//! Invoice Pool API Library
//!
//! # Overview
//!
//! 수출 invoice 담보 금융 백엔드.
//! exporter가 올린 invoice를 등급 평가 → 관리자 승인 → 2-tranche funding pool로
//! 투자자에게 모집하고, 상환금은 waterfall(priority 먼저, catalyst 다음)로 분배한다.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                         API                              │
//! │                                                          │
//! │  ┌─────────┐  ┌─────────────┐  ┌─────────┐  ┌───────┐  │
//! │  │ Routes  │─▶│ Marketplace │─▶│   DB    │  │ Types │  │
//! │  └─────────┘  └──────┬──────┘  └─────────┘  └───────┘  │
//! │                      │                                  │
//! │        grading · invoice · pool · waterfall             │
//! │              risk_gate · events (순수 로직)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입 및 처리
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: 비즈니스 로직 (grading, 상태 머신, pool, waterfall, tier gate)
//! - `db`: Repository trait, PostgreSQL / 메모리 구현
//! - `types`: ID, 금액, 잔액 원장 등 공통 타입
//!
//! ## Usage
//!
//! ```rust,ignore
//! use invoice_pool_api::{AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::build(config).await?;
//!     let app = invoice_pool_api::routes::router(state);
//!     // ... 서버 시작
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod routes;
pub mod services;
pub mod db;
pub mod types;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::Config;
pub use error::{ApiError, EngineError, EngineResult};
pub use db::{Database, MemoryRepository, Repository};
pub use services::{EventBus, Marketplace};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub market: Arc<Marketplace>,
    /// PostgreSQL (없으면 메모리 저장소로 동작 중)
    pub db: Option<Arc<Database>>,
    pub config: Arc<Config>,
}

impl AppState {
    /// 설정에 따라 저장소 선택 후 상태 구성
    ///
    /// - `DATABASE_URL` 있음: 연결 + 마이그레이션
    /// - 없음: `MemoryRepository`
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let events = Arc::new(EventBus::new(config.event_buffer_size));

        let (repo, db): (Arc<dyn Repository>, Option<Arc<Database>>) = match &config.database_url {
            Some(url) => {
                let db = Arc::new(Database::connect(url).await?);
                tracing::info!("🗄️  Database connected");
                db.run_migrations().await?;
                tracing::info!("📦 Migrations completed");
                let repo: Arc<dyn Repository> = db.clone();
                (repo, Some(db))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory repository");
                let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
                (repo, None)
            }
        };

        let market = Marketplace::new(repo, events, config.funding_window_days);
        Ok(Self {
            market: Arc::new(market),
            db,
            config: Arc::new(config),
        })
    }

    /// 메모리 저장소 상태 (테스트/데모)
    pub fn in_memory(config: Config) -> Self {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let market = Marketplace::new(
            Arc::new(MemoryRepository::new()),
            events,
            config.funding_window_days,
        );
        Self {
            market: Arc::new(market),
            db: None,
            config: Arc::new(config),
        }
    }
}
