//! Funding Pool Engine
//!
//! Approved invoice 1개 → pool 1개. Pool은 두 개의 tranche(priority / catalyst)를 가진다.
//!
//! # Invariants
//!
//! - `priority_funded ≤ priority_target`, `catalyst_funded ≤ catalyst_target` (항상)
//! - `funded_amount = priority_funded + catalyst_funded = Σ contribution.amount`
//! - contribution은 append-only
//!
//! # Concurrency
//!
//! 이 모듈의 함수들은 순수 계산이다. "check-and-increment"의 원자성은
//! 저장소 계층이 pool 단위 lock(Postgres `SELECT ... FOR UPDATE`,
//! 메모리 저장소는 pool별 mutex) 안에서 `admit()`을 호출하는 것으로 보장한다.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::services::invoice::{Invoice, InvoiceStatus};
use crate::types::{Bps, ContributionId, InvoiceId, Money, PoolId, Tranche, UserId};

/// Pool 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Open,
    Filled,
    Disbursed,
    Closed,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Open => "open",
            PoolStatus::Filled => "filled",
            PoolStatus::Disbursed => "disbursed",
            PoolStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        Ok(match s {
            "open" => PoolStatus::Open,
            "filled" => PoolStatus::Filled,
            "disbursed" => PoolStatus::Disbursed,
            "closed" => PoolStatus::Closed,
            other => return Err(EngineError::Validation(format!("unknown pool status: {}", other))),
        })
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Fill,
    ForceClose,
    Disburse,
    Settle,
}

/// 전이 테이블
pub fn transition(from: PoolStatus, event: PoolEvent) -> EngineResult<PoolStatus> {
    use PoolEvent as E;
    use PoolStatus as S;

    match (from, event) {
        (S::Open, E::Fill) => Ok(S::Filled),
        (S::Open, E::ForceClose) => Ok(S::Closed),
        (S::Filled, E::Disburse) => Ok(S::Disbursed),
        (S::Disbursed, E::Settle) => Ok(S::Closed),
        (from, event) => Err(EngineError::InvalidState(format!(
            "pool cannot {:?} from {}",
            event, from
        ))),
    }
}

/// 투자 기록 (append-only, 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub pool_id: PoolId,
    pub investor: UserId,
    pub tranche: Tranche,
    pub amount: Money,
    /// pool 내 순번 (1부터), waterfall tie-break
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
}

/// Funding pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingPool {
    pub id: PoolId,
    pub invoice_id: InvoiceId,
    pub exporter: UserId,
    pub target_amount: Money,
    pub priority_target: Money,
    pub catalyst_target: Money,
    pub priority_funded: Money,
    pub catalyst_funded: Money,
    pub priority_interest: Bps,
    pub catalyst_interest: Bps,
    pub tenor_days: u32,
    pub status: PoolStatus,
    pub investor_count: u32,
    pub contribution_count: u32,
    pub deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub disbursed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl FundingPool {
    /// Approved invoice로부터 pool 생성
    ///
    /// ```text
    /// target          = floor(idr_amount × funding_limit)
    /// priority_target = floor(target × priority_ratio)
    /// catalyst_target = target - priority_target
    /// ```
    pub fn open(invoice: &Invoice, funding_window_days: u32, now: DateTime<Utc>) -> EngineResult<Self> {
        if invoice.status != InvoiceStatus::Approved {
            return Err(EngineError::InvalidState(format!(
                "pool requires an approved invoice, invoice is {}",
                invoice.status
            )));
        }
        invoice.tranches.validate()?;

        let target_amount = invoice.idr_amount.apply_bps(invoice.funding_limit()?)?;
        let priority_target = target_amount.apply_bps(invoice.tranches.priority_ratio())?;
        let catalyst_target = target_amount.checked_sub(priority_target)?;

        // 0원 tranche는 채울 수 없어 pool이 영원히 open으로 남는다
        if !target_amount.is_positive() {
            return Err(EngineError::Validation(format!(
                "invoice amount {} is too small to fund at grade limit",
                invoice.idr_amount.amount
            )));
        }
        for (tranche, ratio, target) in [
            (Tranche::Priority, invoice.tranches.priority_ratio_bps, priority_target),
            (Tranche::Catalyst, invoice.tranches.catalyst_ratio_bps, catalyst_target),
        ] {
            if ratio > 0 && !target.is_positive() {
                return Err(EngineError::Validation(format!(
                    "{} tranche target rounds to zero",
                    tranche
                )));
            }
        }

        let window_end = now + Duration::days(funding_window_days as i64);
        let deadline = window_end.min(invoice.due_date);

        Ok(Self {
            id: PoolId::new(),
            invoice_id: invoice.id,
            exporter: invoice.owner,
            target_amount,
            priority_target,
            catalyst_target,
            priority_funded: Money::idr(0),
            catalyst_funded: Money::idr(0),
            priority_interest: invoice.tranches.priority_rate(),
            catalyst_interest: invoice.tranches.catalyst_rate(),
            tenor_days: invoice.funding_duration_days,
            status: PoolStatus::Open,
            investor_count: 0,
            contribution_count: 0,
            deadline,
            opened_at: now,
            disbursed_at: None,
            closed_at: None,
            close_reason: None,
        })
    }

    pub fn funded_amount(&self) -> EngineResult<Money> {
        self.priority_funded.checked_add(self.catalyst_funded)
    }

    pub fn target(&self, tranche: Tranche) -> Money {
        match tranche {
            Tranche::Priority => self.priority_target,
            Tranche::Catalyst => self.catalyst_target,
        }
    }

    pub fn funded(&self, tranche: Tranche) -> Money {
        match tranche {
            Tranche::Priority => self.priority_funded,
            Tranche::Catalyst => self.catalyst_funded,
        }
    }

    pub fn remaining(&self, tranche: Tranche) -> i64 {
        self.target(tranche).amount - self.funded(tranche).amount
    }

    pub fn is_filled(&self) -> bool {
        self.remaining(Tranche::Priority) == 0 && self.remaining(Tranche::Catalyst) == 0
    }

    /// 투자 수락 판단 + 증가 (한 번에)
    ///
    /// 성공 시 갱신된 pool과 새 contribution을 반환. 실패 시 아무것도 바뀌지 않음.
    /// 반드시 pool lock 안에서 호출해야 한다.
    pub fn admit(
        &self,
        investor: UserId,
        tranche: Tranche,
        amount: i64,
        first_contribution: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<(FundingPool, Contribution)> {
        if self.status != PoolStatus::Open {
            return Err(EngineError::InvalidState(format!("pool is {}", self.status)));
        }
        if now > self.deadline {
            return Err(EngineError::InvalidState("pool funding deadline has passed".to_string()));
        }
        if amount <= 0 {
            return Err(EngineError::Validation("contribution amount must be positive".to_string()));
        }

        let remaining = self.remaining(tranche);
        if amount > remaining {
            return Err(EngineError::CapacityExceeded {
                tranche,
                requested: amount,
                remaining,
            });
        }

        let mut next = self.clone();
        let added = Money::idr(amount);
        match tranche {
            Tranche::Priority => next.priority_funded = next.priority_funded.checked_add(added)?,
            Tranche::Catalyst => next.catalyst_funded = next.catalyst_funded.checked_add(added)?,
        }
        if first_contribution {
            next.investor_count += 1;
        }
        next.contribution_count += 1;
        next.close_if_filled();

        let contribution = Contribution {
            id: ContributionId::new(),
            pool_id: self.id,
            investor,
            tranche,
            amount: added,
            sequence: next.contribution_count,
            created_at: now,
        };

        Ok((next, contribution))
    }

    /// 두 tranche 모두 목표 도달 시 open → filled
    pub fn close_if_filled(&mut self) -> bool {
        if self.status == PoolStatus::Open && self.is_filled() {
            self.status = PoolStatus::Filled;
            true
        } else {
            false
        }
    }

    /// open → closed (관리자, 보통 deadline 미달)
    pub fn force_close(&self, reason: Option<String>, now: DateTime<Utc>) -> EngineResult<FundingPool> {
        let mut next = self.clone();
        next.status = transition(self.status, PoolEvent::ForceClose)?;
        next.closed_at = Some(now);
        next.close_reason = Some(reason.unwrap_or_else(|| "force closed by admin".to_string()));
        Ok(next)
    }

    /// filled → disbursed
    ///
    /// `ledger_total`은 저장된 contribution의 합. `funded_amount`와 다르면
    /// `InsufficientPoolFunds` (불변식 위반).
    pub fn disburse(&self, ledger_total: i64, now: DateTime<Utc>) -> EngineResult<FundingPool> {
        let status = transition(self.status, PoolEvent::Disburse)?;
        let recorded = self.funded_amount()?.amount;
        if recorded != ledger_total {
            tracing::error!(
                pool = %self.id,
                recorded,
                ledger_total,
                "CRITICAL: pool funded amount disagrees with contribution ledger"
            );
            return Err(EngineError::InsufficientPoolFunds {
                pool: self.id,
                recorded,
                ledger: ledger_total,
            });
        }
        let mut next = self.clone();
        next.status = status;
        next.disbursed_at = Some(now);
        Ok(next)
    }

    /// disbursed → closed (waterfall 정산 완료)
    pub fn settle(&self, now: DateTime<Utc>) -> EngineResult<FundingPool> {
        let mut next = self.clone();
        next.status = transition(self.status, PoolEvent::Settle)?;
        next.closed_at = Some(now);
        next.close_reason = Some("settled".to_string());
        Ok(next)
    }

    /// 서버 계산 파생 필드
    pub fn summary(&self) -> EngineResult<PoolSummary> {
        let funded = self.funded_amount()?;
        let funded_bps = if self.target_amount.amount == 0 {
            Bps::ONE.0
        } else {
            crate::types::mul_div_floor(funded.amount, Bps::ONE.0 as i64, self.target_amount.amount)? as u32
        };
        Ok(PoolSummary {
            pool: self.clone(),
            funded_amount: funded,
            funded_bps: Bps(funded_bps),
            priority_remaining: Money::idr(self.remaining(Tranche::Priority)),
            catalyst_remaining: Money::idr(self.remaining(Tranche::Catalyst)),
        })
    }
}

/// Pool + 파생 필드 (클라이언트 입력으로 받지 않음)
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    #[serde(flatten)]
    pub pool: FundingPool,
    pub funded_amount: Money,
    pub funded_bps: Bps,
    pub priority_remaining: Money,
    pub catalyst_remaining: Money,
}

/// contribution 목록의 tranche별 합계 (checked)
pub fn ledger_totals(contributions: &[Contribution]) -> EngineResult<(i64, i64)> {
    let mut priority: i64 = 0;
    let mut catalyst: i64 = 0;
    for c in contributions {
        let slot = match c.tranche {
            Tranche::Priority => &mut priority,
            Tranche::Catalyst => &mut catalyst,
        };
        *slot = slot
            .checked_add(c.amount.amount)
            .ok_or(EngineError::Overflow("contribution ledger sum"))?;
    }
    Ok((priority, catalyst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::grading::{self, ExporterHistory, Grade};
    use crate::services::invoice::tests::sample_request;

    fn approved_invoice(grade: Grade) -> Invoice {
        let invoice = Invoice::create(UserId::new(), sample_request(), Utc::now()).unwrap();
        let suggestion = grading::grade(
            &invoice.signals(),
            &ExporterHistory::default(),
            &invoice.document_completeness(),
        );
        invoice.submit(suggestion).unwrap().approve(grade, None).unwrap()
    }

    fn open_pool() -> FundingPool {
        FundingPool::open(&approved_invoice(Grade::A), 14, Utc::now()).unwrap()
    }

    #[test]
    fn test_targets_for_grade_a_invoice() {
        let pool = open_pool();
        assert_eq!(pool.target_amount, Money::idr(90_000_000));
        assert_eq!(pool.priority_target, Money::idr(72_000_000));
        assert_eq!(pool.catalyst_target, Money::idr(18_000_000));
        assert_eq!(pool.status, PoolStatus::Open);
        assert_eq!(pool.tenor_days, 90);
        assert_eq!(pool.priority_interest, Bps(1_000));
    }

    #[test]
    fn test_open_requires_approved() {
        let invoice = Invoice::create(UserId::new(), sample_request(), Utc::now()).unwrap();
        assert!(matches!(
            FundingPool::open(&invoice, 14, Utc::now()),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_open_rejects_target_that_floors_to_zero() {
        let mut invoice = approved_invoice(Grade::C);
        invoice.idr_amount = Money::idr(1);
        assert!(matches!(
            FundingPool::open(&invoice, 14, Utc::now()),
            Err(EngineError::Validation(_))
        ));

        // target 1 (90%), priority floor(0.8) = 0
        let mut invoice = approved_invoice(Grade::A);
        invoice.idr_amount = Money::idr(2);
        assert!(matches!(
            FundingPool::open(&invoice, 14, Utc::now()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_deadline_capped_by_due_date() {
        let invoice = approved_invoice(Grade::B);
        let pool = FundingPool::open(&invoice, 1_000, Utc::now()).unwrap();
        assert_eq!(pool.deadline, invoice.due_date);
    }

    #[test]
    fn test_admit_and_fill() {
        let pool = open_pool();
        let investor = UserId::new();

        let (pool, c1) = pool.admit(investor, Tranche::Priority, 72_000_000, true, Utc::now()).unwrap();
        assert_eq!(c1.sequence, 1);
        assert_eq!(pool.status, PoolStatus::Open);
        assert_eq!(pool.investor_count, 1);

        let (pool, c2) = pool.admit(investor, Tranche::Catalyst, 18_000_000, false, Utc::now()).unwrap();
        assert_eq!(c2.sequence, 2);
        assert_eq!(pool.investor_count, 1);
        assert_eq!(pool.status, PoolStatus::Filled);
        assert_eq!(pool.funded_amount().unwrap(), Money::idr(90_000_000));

        // filled pool은 더 이상 받지 않음
        assert!(matches!(
            pool.admit(UserId::new(), Tranche::Priority, 1, true, Utc::now()),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_over_target_rejected_whole() {
        let pool = open_pool();
        let (pool, _) = pool.admit(UserId::new(), Tranche::Catalyst, 10_000_000, true, Utc::now()).unwrap();

        let err = pool
            .admit(UserId::new(), Tranche::Catalyst, 8_000_001, true, Utc::now())
            .unwrap_err();
        match err {
            EngineError::CapacityExceeded { tranche, requested, remaining } => {
                assert_eq!(tranche, Tranche::Catalyst);
                assert_eq!(requested, 8_000_001);
                assert_eq!(remaining, 8_000_000);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(pool.catalyst_funded, Money::idr(10_000_000));
    }

    #[test]
    fn test_admit_rejects_non_positive_and_late() {
        let pool = open_pool();
        assert!(matches!(
            pool.admit(UserId::new(), Tranche::Priority, 0, true, Utc::now()),
            Err(EngineError::Validation(_))
        ));
        let late = pool.deadline + Duration::seconds(1);
        assert!(matches!(
            pool.admit(UserId::new(), Tranche::Priority, 1, true, late),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_disburse_checks_ledger() {
        let pool = open_pool();
        let (pool, _) = pool.admit(UserId::new(), Tranche::Priority, 72_000_000, true, Utc::now()).unwrap();
        assert!(matches!(pool.disburse(72_000_000, Utc::now()), Err(EngineError::InvalidState(_))));

        let (pool, _) = pool.admit(UserId::new(), Tranche::Catalyst, 18_000_000, true, Utc::now()).unwrap();
        assert!(matches!(
            pool.disburse(89_999_999, Utc::now()),
            Err(EngineError::InsufficientPoolFunds { .. })
        ));

        let disbursed = pool.disburse(90_000_000, Utc::now()).unwrap();
        assert_eq!(disbursed.status, PoolStatus::Disbursed);
        assert!(disbursed.disbursed_at.is_some());
        assert_eq!(disbursed.settle(Utc::now()).unwrap().status, PoolStatus::Closed);
    }

    #[test]
    fn test_force_close_only_when_open() {
        let pool = open_pool();
        let closed = pool.force_close(None, Utc::now()).unwrap();
        assert_eq!(closed.status, PoolStatus::Closed);
        assert!(closed.force_close(None, Utc::now()).is_err());
    }

    #[test]
    fn test_summary_derived_fields() {
        let pool = open_pool();
        let (pool, _) = pool.admit(UserId::new(), Tranche::Priority, 45_000_000, true, Utc::now()).unwrap();
        let summary = pool.summary().unwrap();
        assert_eq!(summary.funded_amount, Money::idr(45_000_000));
        assert_eq!(summary.funded_bps, Bps(5_000));
        assert_eq!(summary.priority_remaining, Money::idr(27_000_000));
        assert_eq!(summary.catalyst_remaining, Money::idr(18_000_000));
    }

    #[test]
    fn test_ledger_totals() {
        let pool = open_pool();
        let (pool, a) = pool.admit(UserId::new(), Tranche::Priority, 5, true, Utc::now()).unwrap();
        let (_, b) = pool.admit(UserId::new(), Tranche::Catalyst, 7, true, Utc::now()).unwrap();
        assert_eq!(ledger_totals(&[a, b]).unwrap(), (5, 7));
    }
}
