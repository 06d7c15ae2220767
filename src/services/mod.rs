//! Services Module
//!
//! 비즈니스 로직을 담당하는 서비스 레이어
//!
//! # Services
//! - `grading`: 등급 계산 (순수 함수)
//! - `invoice`: Invoice 상태 머신
//! - `pool`: Funding pool, tranche 용량 관리
//! - `waterfall`: 상환금 분배
//! - `risk_gate`: 투자자 위험 성향 → catalyst 자격
//! - `events`: 도메인 이벤트 버스
//! - `marketplace` / `admin`: 권한 확인 + 원자적 저장 + 이벤트 발행

pub mod admin;
pub mod events;
pub mod grading;
pub mod invoice;
pub mod marketplace;
pub mod pool;
pub mod risk_gate;
pub mod waterfall;

pub use admin::{ApplicationStatus, ExporterApplication};
pub use events::{DomainEvent, EventBus, EventEnvelope};
pub use grading::{Grade, GradeSuggestion};
pub use invoice::{Invoice, InvoiceStatus, NewInvoice};
pub use marketplace::Marketplace;
pub use pool::{Contribution, FundingPool, PoolStatus, PoolSummary};
pub use risk_gate::RiskProfile;
pub use waterfall::{Settlement, WaterfallResult};
