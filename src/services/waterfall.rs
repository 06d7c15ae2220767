//! Disbursement & Repayment Waterfall
//!
//! 만기(또는 조기 부도) 시 상환금을 tranche 우선순위에 따라 분배한다.
//!
//! ```text
//! gross ─▶ Priority (≤ funded × (1 + rate × tenor/365))
//!       ─▶ Catalyst (≤ funded × (1 + rate × tenor/365))   ← first-loss
//!       ─▶ residual → exporter
//! ```
//!
//! tranche 내부는 contribution 금액 비례 (floor) + 남은 1원 단위는
//! 나머지가 큰 순서, 같으면 contribution sequence 순서로 배분한다.
//! 같은 입력이면 항상 같은 결과 (재시도 안전).

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::services::pool::{ledger_totals, Contribution, FundingPool};
use crate::types::{Bps, ContributionId, Currency, Money, PoolId, Tranche, UserId};

/// actual/365 day count (이율은 p.a. 기준)
pub const DAY_COUNT_BASIS: i64 = 365;

/// tranche별 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrancheOutcome {
    pub tranche: Tranche,
    pub funded: Money,
    /// 원금 + 이자
    pub owed: Money,
    pub paid: Money,
    pub shortfall: Money,
}

/// 투자자별 지급액
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub contribution_id: ContributionId,
    pub investor: UserId,
    pub tranche: Tranche,
    pub principal: Money,
    pub amount: Money,
}

/// Waterfall 계산 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaterfallResult {
    pub pool_id: PoolId,
    pub gross_proceeds: Money,
    pub priority: TrancheOutcome,
    pub catalyst: TrancheOutcome,
    /// exporter에게 반환 (초과 상환 시에만)
    pub residual: Money,
    /// priority → catalyst, 각 tranche 안에서는 sequence 순
    pub payouts: Vec<Payout>,
}

impl WaterfallResult {
    /// 어느 한 tranche라도 전액 상환받지 못했는지
    pub fn has_shortfall(&self) -> bool {
        self.priority.shortfall.is_positive() || self.catalyst.shortfall.is_positive()
    }
}

/// 저장된 정산 결과 (pool당 최대 1개)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub pool_id: PoolId,
    pub result: WaterfallResult,
    pub settled_by: UserId,
    pub settled_at: DateTime<Utc>,
}

impl Settlement {
    /// 같은 gross로 재실행하면 저장된 결과를 그대로 돌려준다.
    /// 다른 gross면 이미 정산된 pool → `InvalidState`.
    pub fn replay(&self, gross_proceeds: Money) -> EngineResult<Settlement> {
        if self.result.gross_proceeds != gross_proceeds {
            return Err(EngineError::InvalidState(format!(
                "pool {} already settled with gross proceeds {}",
                self.pool_id, self.result.gross_proceeds
            )));
        }
        Ok(self.clone())
    }
}

/// `funded × (1 + rate × tenor_days / 365)` (이자는 floor)
pub fn accrued_owed(funded: i64, rate: Bps, tenor_days: u32) -> EngineResult<i64> {
    if funded < 0 {
        return Err(EngineError::Overflow("negative tranche principal"));
    }
    let interest = (funded as i128) * (rate.0 as i128) * (tenor_days as i128)
        / ((Bps::ONE.0 as i128) * (DAY_COUNT_BASIS as i128));
    let interest = i64::try_from(interest).map_err(|_| EngineError::Overflow("accrued interest"))?;
    funded
        .checked_add(interest)
        .ok_or(EngineError::Overflow("accrued interest"))
}

/// Waterfall 계산 (부수효과 없음)
pub fn compute(
    pool: &FundingPool,
    contributions: &[Contribution],
    gross_proceeds: Money,
) -> EngineResult<WaterfallResult> {
    if gross_proceeds.currency != Currency::IDR {
        return Err(EngineError::Validation("repayment must be in IDR".to_string()));
    }
    if gross_proceeds.amount < 0 {
        return Err(EngineError::Validation("gross proceeds must not be negative".to_string()));
    }
    if contributions.iter().any(|c| c.pool_id != pool.id) {
        return Err(EngineError::Validation("contribution belongs to another pool".to_string()));
    }

    let (priority_ledger, catalyst_ledger) = ledger_totals(contributions)?;
    let recorded = pool.funded_amount()?.amount;
    if priority_ledger != pool.priority_funded.amount || catalyst_ledger != pool.catalyst_funded.amount {
        tracing::error!(pool = %pool.id, recorded, "CRITICAL: waterfall input ledger mismatch");
        return Err(EngineError::InsufficientPoolFunds {
            pool: pool.id,
            recorded,
            ledger: priority_ledger + catalyst_ledger,
        });
    }

    let priority_owed = accrued_owed(pool.priority_funded.amount, pool.priority_interest, pool.tenor_days)?;
    let catalyst_owed = accrued_owed(pool.catalyst_funded.amount, pool.catalyst_interest, pool.tenor_days)?;

    let gross = gross_proceeds.amount;
    let priority_paid = gross.min(priority_owed);
    let after_priority = gross - priority_paid;
    let catalyst_paid = after_priority.min(catalyst_owed);
    let residual = after_priority - catalyst_paid;

    let mut payouts = distribute(Tranche::Priority, contributions, pool.priority_funded.amount, priority_paid)?;
    payouts.extend(distribute(Tranche::Catalyst, contributions, pool.catalyst_funded.amount, catalyst_paid)?);

    Ok(WaterfallResult {
        pool_id: pool.id,
        gross_proceeds,
        priority: TrancheOutcome {
            tranche: Tranche::Priority,
            funded: pool.priority_funded,
            owed: Money::idr(priority_owed),
            paid: Money::idr(priority_paid),
            shortfall: Money::idr(priority_owed - priority_paid),
        },
        catalyst: TrancheOutcome {
            tranche: Tranche::Catalyst,
            funded: pool.catalyst_funded,
            owed: Money::idr(catalyst_owed),
            paid: Money::idr(catalyst_paid),
            shortfall: Money::idr(catalyst_owed - catalyst_paid),
        },
        residual: Money::idr(residual),
        payouts,
    })
}

/// tranche 내 비례 배분 (largest remainder)
fn distribute(
    tranche: Tranche,
    contributions: &[Contribution],
    tranche_funded: i64,
    tranche_paid: i64,
) -> EngineResult<Vec<Payout>> {
    let mut members: Vec<&Contribution> = contributions.iter().filter(|c| c.tranche == tranche).collect();
    members.sort_by_key(|c| c.sequence);

    if members.is_empty() || tranche_funded == 0 {
        return Ok(Vec::new());
    }

    let mut shares: Vec<(i64, i128)> = Vec::with_capacity(members.len());
    let mut allocated: i64 = 0;
    for c in &members {
        let numerator = (c.amount.amount as i128) * (tranche_paid as i128);
        let base = numerator / tranche_funded as i128;
        let remainder = numerator % tranche_funded as i128;
        let base = i64::try_from(base).map_err(|_| EngineError::Overflow("payout share"))?;
        allocated = allocated
            .checked_add(base)
            .ok_or(EngineError::Overflow("payout share"))?;
        shares.push((base, remainder));
    }

    // 남은 단위 수는 항상 멤버 수보다 작다
    let leftover = (tranche_paid - allocated) as usize;
    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by_key(|&i| (Reverse(shares[i].1), members[i].sequence));
    for &i in order.iter().take(leftover) {
        shares[i].0 += 1;
    }

    Ok(members
        .iter()
        .zip(shares)
        .map(|(c, (amount, _))| Payout {
            contribution_id: c.id,
            investor: c.investor,
            tranche,
            principal: c.amount,
            amount: Money::idr(amount),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::services::pool::PoolStatus;
    use crate::types::InvoiceId;

    /// 100,000,000 IDR, grade A, 80/20, 10% / 18% p.a., 90일
    fn funded_pool(priority: &[i64], catalyst: &[i64]) -> (FundingPool, Vec<Contribution>) {
        let now = Utc::now();
        let mut pool = FundingPool {
            id: PoolId::new(),
            invoice_id: InvoiceId::new(),
            exporter: UserId::new(),
            target_amount: Money::idr(90_000_000),
            priority_target: Money::idr(72_000_000),
            catalyst_target: Money::idr(18_000_000),
            priority_funded: Money::idr(0),
            catalyst_funded: Money::idr(0),
            priority_interest: Bps(1_000),
            catalyst_interest: Bps(1_800),
            tenor_days: 90,
            status: PoolStatus::Open,
            investor_count: 0,
            contribution_count: 0,
            deadline: now + Duration::days(14),
            opened_at: now,
            disbursed_at: None,
            closed_at: None,
            close_reason: None,
        };
        let mut contributions = Vec::new();
        for (tranche, amounts) in [(Tranche::Priority, priority), (Tranche::Catalyst, catalyst)] {
            for &amount in amounts {
                let (next, c) = pool.admit(UserId::new(), tranche, amount, true, now).unwrap();
                pool = next;
                contributions.push(c);
            }
        }
        (pool, contributions)
    }

    fn full_pool() -> (FundingPool, Vec<Contribution>) {
        funded_pool(&[40_000_000, 32_000_000], &[18_000_000])
    }

    #[test]
    fn test_accrued_owed_actual_365() {
        // 72,000,000 × 10% × 90/365 = 1,775,342.46 → 1,775,342
        assert_eq!(accrued_owed(72_000_000, Bps(1_000), 90).unwrap(), 73_775_342);
        // 18,000,000 × 18% × 90/365 = 798,904.1 → 798,904
        assert_eq!(accrued_owed(18_000_000, Bps(1_800), 90).unwrap(), 18_798_904);
        assert_eq!(accrued_owed(1_000, Bps::ZERO, 90).unwrap(), 1_000);
    }

    #[test]
    fn test_full_repayment_pays_both_tranches() {
        let (pool, contributions) = full_pool();
        let result = compute(&pool, &contributions, Money::idr(100_000_000)).unwrap();

        assert_eq!(result.priority.paid, Money::idr(73_775_342));
        assert_eq!(result.catalyst.paid, Money::idr(18_798_904));
        assert_eq!(result.residual, Money::idr(100_000_000 - 73_775_342 - 18_798_904));
        assert!(!result.has_shortfall());

        let total: i64 = result.payouts.iter().map(|p| p.amount.amount).sum();
        assert_eq!(total + result.residual.amount, 100_000_000);
    }

    #[test]
    fn test_priority_entitlement_only_leaves_catalyst_at_zero() {
        let (pool, contributions) = full_pool();
        let result = compute(&pool, &contributions, Money::idr(73_775_342)).unwrap();

        assert_eq!(result.priority.paid, result.priority.owed);
        assert_eq!(result.catalyst.paid, Money::idr(0));
        assert_eq!(result.catalyst.shortfall, Money::idr(18_798_904));
        assert!(result
            .payouts
            .iter()
            .filter(|p| p.tranche == Tranche::Catalyst)
            .all(|p| p.amount.is_zero()));
    }

    #[test]
    fn test_ninety_percent_of_full_repayment() {
        let (pool, contributions) = full_pool();
        // 전체 상환액 92,574,246 의 90% = 83,316,821
        let result = compute(&pool, &contributions, Money::idr(83_316_821)).unwrap();

        // priority 전액 (원금 + 이자), catalyst가 부족분 흡수
        assert_eq!(result.priority.shortfall, Money::idr(0));
        assert_eq!(result.catalyst.paid, Money::idr(83_316_821 - 73_775_342));
        assert!(result.catalyst.paid.amount < result.catalyst.funded.amount);
        assert_eq!(result.residual, Money::idr(0));
    }

    #[test]
    fn test_priority_short_is_pro_rata_and_catalyst_zero() {
        let (pool, contributions) = full_pool();
        let result = compute(&pool, &contributions, Money::idr(36_000_001)).unwrap();

        assert_eq!(result.catalyst.paid, Money::idr(0));
        let priority: Vec<i64> = result
            .payouts
            .iter()
            .filter(|p| p.tranche == Tranche::Priority)
            .map(|p| p.amount.amount)
            .collect();
        // 40/72 × 36,000,001 = 20,000,000.55 → 20,000,001 (남은 1원은 나머지가 큰 쪽)
        // 32/72 × 36,000,001 = 16,000,000.44 → 16,000,000
        assert_eq!(priority, vec![20_000_001, 16_000_000]);
    }

    #[test]
    fn test_leftover_tie_broken_by_sequence() {
        let (pool, contributions) = funded_pool(&[24_000_000, 24_000_000, 24_000_000], &[18_000_000]);
        let result = compute(&pool, &contributions, Money::idr(2)).unwrap();
        let amounts: Vec<i64> = result.payouts.iter().map(|p| p.amount.amount).collect();
        assert_eq!(amounts, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_zero_proceeds() {
        let (pool, contributions) = full_pool();
        let result = compute(&pool, &contributions, Money::idr(0)).unwrap();
        assert!(result.payouts.iter().all(|p| p.amount.is_zero()));
        assert!(result.has_shortfall());
    }

    #[test]
    fn test_idempotent() {
        let (pool, contributions) = full_pool();
        let a = compute(&pool, &contributions, Money::idr(88_888_888)).unwrap();
        let b = compute(&pool, &contributions, Money::idr(88_888_888)).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn test_rejects_inconsistent_ledger() {
        let (pool, mut contributions) = full_pool();
        contributions.pop();
        assert!(matches!(
            compute(&pool, &contributions, Money::idr(1)),
            Err(EngineError::InsufficientPoolFunds { .. })
        ));
    }

    #[test]
    fn test_rejects_negative_proceeds() {
        let (pool, contributions) = full_pool();
        assert!(matches!(
            compute(&pool, &contributions, Money::idr(-1)),
            Err(EngineError::Validation(_))
        ));
    }
}
