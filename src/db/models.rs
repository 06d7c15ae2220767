//! Database Models
//!
//! PostgreSQL row 구조체와 도메인 타입 변환.
//! enum은 TEXT (`as_str` / `parse`), 금액은 BIGINT minor unit,
//! 구조화된 값(문서 목록, 등급 제안, 정산 결과)은 JSONB.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::services::admin::{ApplicationStatus, ExporterApplication};
use crate::services::grading::{Grade, GradeSuggestion};
use crate::services::invoice::{Buyer, DocumentRef, Invoice, InvoiceStatus, TrancheConfig};
use crate::services::pool::{Contribution, FundingPool, PoolStatus};
use crate::services::risk_gate::RiskProfile;
use crate::services::waterfall::{Settlement, WaterfallResult};
use crate::types::{Balance, Bps, Currency, LedgerEntry, LedgerKind, Money, Tranche};

fn non_negative(value: i32, column: &'static str) -> EngineResult<u32> {
    u32::try_from(value).map_err(|_| EngineError::Storage(format!("negative value in {}", column)))
}

/// 요청 검증용 parse 에러를 저장소 손상으로 변환
fn corrupt(err: EngineError) -> EngineError {
    EngineError::Storage(err.to_string())
}

/// u32 → INTEGER 컬럼
pub(crate) fn to_db_int(value: u32, column: &'static str) -> EngineResult<i32> {
    i32::try_from(value).map_err(|_| EngineError::Overflow(column))
}

// ============ Invoices ============

#[derive(Debug, Clone, FromRow)]
pub struct InvoiceRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub invoice_number: String,
    pub description: Option<String>,
    pub buyer_name: String,
    pub buyer_country: String,
    pub repeat_buyer: bool,
    pub original_amount: i64,
    pub original_currency: String,
    pub fx_rate: Decimal,
    pub idr_amount: i64,
    pub due_date: DateTime<Utc>,
    pub funding_duration_days: i32,
    pub priority_ratio_bps: i32,
    pub catalyst_ratio_bps: i32,
    pub priority_interest_bps: i32,
    pub catalyst_interest_bps: i32,
    pub status: String,
    pub grade: Option<String>,
    pub grade_suggestion: Option<Json<GradeSuggestion>>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub documents: Json<Vec<DocumentRef>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = EngineError;

    fn try_from(row: InvoiceRow) -> EngineResult<Self> {
        let grade = match row.grade.as_deref() {
            Some(g) => Some(
                Grade::parse(g).ok_or_else(|| EngineError::Storage(format!("unknown grade: {}", g)))?,
            ),
            None => None,
        };

        Ok(Invoice {
            id: row.id.into(),
            owner: row.owner_id.into(),
            invoice_number: row.invoice_number,
            description: row.description,
            buyer: Buyer {
                name: row.buyer_name,
                country: row.buyer_country,
                repeat_buyer: row.repeat_buyer,
            },
            original_amount: Money::new(row.original_amount, Currency::new(&row.original_currency).map_err(corrupt)?),
            fx_rate: row.fx_rate,
            idr_amount: Money::idr(row.idr_amount),
            due_date: row.due_date,
            funding_duration_days: non_negative(row.funding_duration_days, "funding_duration_days")?,
            tranches: TrancheConfig {
                priority_ratio_bps: row.priority_ratio_bps,
                catalyst_ratio_bps: row.catalyst_ratio_bps,
                priority_interest_bps: row.priority_interest_bps,
                catalyst_interest_bps: row.catalyst_interest_bps,
            },
            status: InvoiceStatus::parse(&row.status)?,
            grade,
            grade_suggestion: row.grade_suggestion.map(|Json(s)| s),
            review_notes: row.review_notes,
            rejection_reason: row.rejection_reason,
            documents: row.documents.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============ Funding pools ============

#[derive(Debug, Clone, FromRow)]
pub struct PoolRow {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub exporter_id: Uuid,
    pub target_amount: i64,
    pub priority_target: i64,
    pub catalyst_target: i64,
    pub priority_funded: i64,
    pub catalyst_funded: i64,
    pub priority_interest_bps: i32,
    pub catalyst_interest_bps: i32,
    pub tenor_days: i32,
    pub status: String,
    pub investor_count: i32,
    pub contribution_count: i32,
    pub deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub disbursed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl TryFrom<PoolRow> for FundingPool {
    type Error = EngineError;

    fn try_from(row: PoolRow) -> EngineResult<Self> {
        Ok(FundingPool {
            id: row.id.into(),
            invoice_id: row.invoice_id.into(),
            exporter: row.exporter_id.into(),
            target_amount: Money::idr(row.target_amount),
            priority_target: Money::idr(row.priority_target),
            catalyst_target: Money::idr(row.catalyst_target),
            priority_funded: Money::idr(row.priority_funded),
            catalyst_funded: Money::idr(row.catalyst_funded),
            priority_interest: Bps(non_negative(row.priority_interest_bps, "priority_interest_bps")?),
            catalyst_interest: Bps(non_negative(row.catalyst_interest_bps, "catalyst_interest_bps")?),
            tenor_days: non_negative(row.tenor_days, "tenor_days")?,
            status: PoolStatus::parse(&row.status).map_err(corrupt)?,
            investor_count: non_negative(row.investor_count, "investor_count")?,
            contribution_count: non_negative(row.contribution_count, "contribution_count")?,
            deadline: row.deadline,
            opened_at: row.opened_at,
            disbursed_at: row.disbursed_at,
            closed_at: row.closed_at,
            close_reason: row.close_reason,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ContributionRow {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub investor_id: Uuid,
    pub tranche: String,
    pub amount: i64,
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ContributionRow> for Contribution {
    type Error = EngineError;

    fn try_from(row: ContributionRow) -> EngineResult<Self> {
        Ok(Contribution {
            id: row.id.into(),
            pool_id: row.pool_id.into(),
            investor: row.investor_id.into(),
            tranche: Tranche::parse(&row.tranche).map_err(corrupt)?,
            amount: Money::idr(row.amount),
            sequence: non_negative(row.sequence, "sequence")?,
            created_at: row.created_at,
        })
    }
}

/// 정산 결과 (waterfall 전체를 JSONB로 보관, 재생 시 그대로 반환)
#[derive(Debug, Clone, FromRow)]
pub struct SettlementRow {
    pub pool_id: Uuid,
    pub result: Json<WaterfallResult>,
    pub settled_by: Uuid,
    pub settled_at: DateTime<Utc>,
}

impl From<SettlementRow> for Settlement {
    fn from(row: SettlementRow) -> Self {
        Settlement {
            pool_id: row.pool_id.into(),
            result: row.result.0,
            settled_by: row.settled_by.into(),
            settled_at: row.settled_at,
        }
    }
}

// ============ Balances ============

#[derive(Debug, Clone, FromRow)]
pub struct BalanceRow {
    pub user_id: Uuid,
    pub available: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            user: row.user_id.into(),
            available: Money::idr(row.available),
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntryRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub delta: i64,
    pub kind: String,
    pub reference: Option<Uuid>,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = EngineError;

    fn try_from(row: LedgerEntryRow) -> EngineResult<Self> {
        Ok(LedgerEntry {
            id: row.id,
            user: row.user_id.into(),
            delta: row.delta,
            kind: LedgerKind::parse(&row.kind)?,
            reference: row.reference,
            actor: row.actor_id.into(),
            created_at: row.created_at,
        })
    }
}

// ============ Risk profiles ============

#[derive(Debug, Clone, FromRow)]
pub struct RiskProfileRow {
    pub investor_id: Uuid,
    pub completed: bool,
    pub selected_tier: String,
    pub catalyst_unlocked: bool,
    pub score: i32,
    pub submitted_at: DateTime<Utc>,
}

impl TryFrom<RiskProfileRow> for RiskProfile {
    type Error = EngineError;

    fn try_from(row: RiskProfileRow) -> EngineResult<Self> {
        Ok(RiskProfile {
            investor: row.investor_id.into(),
            completed: row.completed,
            selected_tier: Tranche::parse(&row.selected_tier).map_err(corrupt)?,
            catalyst_unlocked: row.catalyst_unlocked,
            score: non_negative(row.score, "score")?,
            submitted_at: row.submitted_at,
        })
    }
}

// ============ Exporter applications ============

#[derive(Debug, Clone, FromRow)]
pub struct ApplicationRow {
    pub id: Uuid,
    pub applicant_id: Uuid,
    pub company_name: String,
    pub country: String,
    pub status: String,
    pub reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<Uuid>,
}

impl TryFrom<ApplicationRow> for ExporterApplication {
    type Error = EngineError;

    fn try_from(row: ApplicationRow) -> EngineResult<Self> {
        Ok(ExporterApplication {
            id: row.id.into(),
            applicant: row.applicant_id.into(),
            company_name: row.company_name,
            country: row.country,
            status: ApplicationStatus::parse(&row.status)?,
            reason: row.reason,
            submitted_at: row.submitted_at,
            reviewed_at: row.reviewed_at,
            reviewed_by: row.reviewed_by.map(Into::into),
        })
    }
}
