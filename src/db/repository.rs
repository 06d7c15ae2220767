//! Repository Pattern Implementation
//!
//! 저장소 추상화. 상태를 바꾸는 메서드 하나 = 원자적 단위 하나.
//!
//! - `Database` (db/mod.rs): PostgreSQL, 트랜잭션 + `SELECT ... FOR UPDATE`
//! - `MemoryRepository` (이 파일): 개발/테스트용, pool별 `tokio::sync::Mutex`
//!
//! 두 구현 모두 수락 여부 판단은 `services::pool` / `services::waterfall`의
//! 순수 함수에 맡기고, 여기서는 lock과 저장만 담당한다.
//!
//! # Lock order (memory)
//!
//! `pools map → pool entry → invoices → accounts`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::services::admin::{ApplicationStatus, ExporterApplication};
use crate::services::grading::ExporterHistory;
use crate::services::invoice::{Invoice, InvoiceStatus};
use crate::services::pool::{ledger_totals, Contribution, FundingPool, PoolStatus};
use crate::services::risk_gate::RiskProfile;
use crate::services::waterfall::{self, Settlement};
use crate::types::{
    ApplicationId, Balance, InvoiceId, LedgerEntry, LedgerKind, Money, PoolId, Tranche, UserId,
};

/// 투자 요청 (tier gate 통과 후)
#[derive(Debug, Clone, Copy)]
pub struct ContributionRequest {
    pub pool_id: PoolId,
    pub investor: UserId,
    pub tranche: Tranche,
    pub amount: i64,
    pub now: DateTime<Utc>,
}

/// 투자 결과
#[derive(Debug, Clone)]
pub struct ContributionOutcome {
    pub pool: FundingPool,
    pub contribution: Contribution,
    /// 이 투자로 open → filled 전이가 일어났는지
    pub filled: bool,
}

/// 강제 종료 결과
#[derive(Debug, Clone)]
pub struct ForceCloseOutcome {
    pub pool: FundingPool,
    pub refunded: Money,
}

/// 정산 결과
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub settlement: Settlement,
    /// true면 기존 정산을 재생한 것 (잔액 변동 없음)
    pub replayed: bool,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // ============ Invoices ============
    async fn insert_invoice(&self, invoice: &Invoice) -> EngineResult<()>;
    async fn get_invoice(&self, id: InvoiceId) -> EngineResult<Option<Invoice>>;
    /// compare-and-swap: 저장된 상태가 `expected`일 때만 덮어씀, 아니면 `InvalidState`
    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> EngineResult<()>;
    async fn exporter_history(&self, exporter: UserId) -> EngineResult<ExporterHistory>;

    // ============ Pools ============
    /// invoice approved → funding 전이와 pool 생성을 한 번에 (invoice당 pool 1개)
    async fn create_pool(&self, pool: &FundingPool, invoice: &Invoice) -> EngineResult<()>;
    async fn get_pool(&self, id: PoolId) -> EngineResult<Option<FundingPool>>;
    async fn pool_for_invoice(&self, invoice: InvoiceId) -> EngineResult<Option<FundingPool>>;
    async fn list_pools(&self, status: Option<PoolStatus>) -> EngineResult<Vec<FundingPool>>;
    async fn list_contributions(&self, pool: PoolId) -> EngineResult<Vec<Contribution>>;
    async fn investor_contributions(&self, investor: UserId) -> EngineResult<Vec<Contribution>>;

    /// 용량 확인 + 증가 + 투자자 잔액 차감 + contribution 기록 (pool lock 안에서)
    async fn contribute(&self, req: ContributionRequest) -> EngineResult<ContributionOutcome>;
    /// open → closed, 모든 contribution 환불
    async fn force_close_pool(
        &self,
        pool: PoolId,
        reason: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<ForceCloseOutcome>;
    /// filled → disbursed, exporter 잔액 증가, invoice funding → funded
    async fn disburse_pool(&self, pool: PoolId, actor: UserId, now: DateTime<Utc>) -> EngineResult<FundingPool>;
    /// waterfall 계산 + 지급 + pool closed + invoice repaid (멱등)
    async fn settle_pool(
        &self,
        pool: PoolId,
        gross_proceeds: Money,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<SettlementOutcome>;
    async fn get_settlement(&self, pool: PoolId) -> EngineResult<Option<Settlement>>;

    // ============ Balances ============
    async fn get_balance(&self, user: UserId) -> EngineResult<Balance>;
    /// 부호 있는 조정 + 원장 기록. 음수 잔액이 되면 `InsufficientBalance`.
    async fn adjust_balance(
        &self,
        user: UserId,
        delta: i64,
        kind: LedgerKind,
        reference: Option<Uuid>,
        actor: UserId,
    ) -> EngineResult<Balance>;
    async fn ledger_entries(&self, user: UserId) -> EngineResult<Vec<LedgerEntry>>;

    // ============ Risk profiles ============
    async fn upsert_risk_profile(&self, profile: &RiskProfile) -> EngineResult<()>;
    async fn get_risk_profile(&self, investor: UserId) -> EngineResult<Option<RiskProfile>>;

    // ============ Exporter applications ============
    async fn insert_application(&self, application: &ExporterApplication) -> EngineResult<()>;
    async fn get_application(&self, id: ApplicationId) -> EngineResult<Option<ExporterApplication>>;
    async fn update_application(
        &self,
        application: &ExporterApplication,
        expected: ApplicationStatus,
    ) -> EngineResult<()>;
}

// ============ In-memory implementation ============

/// pool 하나의 상태 (pool lock 단위)
#[derive(Debug)]
struct PoolLedger {
    pool: FundingPool,
    contributions: Vec<Contribution>,
    settlement: Option<Settlement>,
}

#[derive(Debug, Default)]
struct Accounts {
    balances: HashMap<UserId, Balance>,
    entries: Vec<LedgerEntry>,
}

impl Accounts {
    fn balance(&self, user: UserId) -> Balance {
        self.balances.get(&user).cloned().unwrap_or_else(|| Balance::empty(user))
    }

    /// 여러 조정을 모두 검증한 뒤에만 반영 (all-or-nothing)
    fn apply(&mut self, adjustments: &[(UserId, i64, LedgerKind, Option<Uuid>)], actor: UserId) -> EngineResult<()> {
        let mut staged: HashMap<UserId, Balance> = HashMap::new();
        for (user, delta, _, _) in adjustments {
            let balance = staged.entry(*user).or_insert_with(|| self.balance(*user));
            balance.adjust(*delta)?;
        }
        self.balances.extend(staged);
        for (user, delta, kind, reference) in adjustments {
            self.entries.push(LedgerEntry::new(*user, *delta, *kind, *reference, actor));
        }
        Ok(())
    }
}

/// 메모리 저장소 (개발/테스트)
#[derive(Default)]
pub struct MemoryRepository {
    pools: RwLock<HashMap<PoolId, Arc<Mutex<PoolLedger>>>>,
    pool_by_invoice: Mutex<HashMap<InvoiceId, PoolId>>,
    invoices: Mutex<HashMap<InvoiceId, Invoice>>,
    accounts: Mutex<Accounts>,
    profiles: Mutex<HashMap<UserId, RiskProfile>>,
    applications: Mutex<HashMap<ApplicationId, ExporterApplication>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool_entry(&self, id: PoolId) -> EngineResult<Arc<Mutex<PoolLedger>>> {
        self.pools
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", id)))
    }
}

fn swap_invoice(
    invoices: &mut HashMap<InvoiceId, Invoice>,
    invoice: &Invoice,
    expected: InvoiceStatus,
) -> EngineResult<()> {
    let stored = invoices
        .get_mut(&invoice.id)
        .ok_or_else(|| EngineError::NotFound(format!("invoice {}", invoice.id)))?;
    if stored.status != expected {
        return Err(EngineError::InvalidState(format!(
            "invoice {} is {}, expected {}",
            invoice.id, stored.status, expected
        )));
    }
    *stored = invoice.clone();
    Ok(())
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_invoice(&self, invoice: &Invoice) -> EngineResult<()> {
        let mut invoices = self.invoices.lock().await;
        if invoices.contains_key(&invoice.id) {
            return Err(EngineError::InvalidState(format!("invoice {} already exists", invoice.id)));
        }
        invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: InvoiceId) -> EngineResult<Option<Invoice>> {
        Ok(self.invoices.lock().await.get(&id).cloned())
    }

    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> EngineResult<()> {
        let mut invoices = self.invoices.lock().await;
        swap_invoice(&mut invoices, invoice, expected)
    }

    async fn exporter_history(&self, exporter: UserId) -> EngineResult<ExporterHistory> {
        let entries: Vec<Arc<Mutex<PoolLedger>>> = self.pools.read().await.values().cloned().collect();
        let mut history = ExporterHistory::default();
        for entry in entries {
            let ledger = entry.lock().await;
            if ledger.pool.exporter != exporter {
                continue;
            }
            if let Some(settlement) = &ledger.settlement {
                if settlement.result.has_shortfall() {
                    history.defaulted += 1;
                } else {
                    history.repaid_in_full += 1;
                }
            }
        }
        Ok(history)
    }

    async fn create_pool(&self, pool: &FundingPool, invoice: &Invoice) -> EngineResult<()> {
        let mut by_invoice = self.pool_by_invoice.lock().await;
        if by_invoice.contains_key(&invoice.id) {
            return Err(EngineError::InvalidState(format!("invoice {} already has a pool", invoice.id)));
        }
        {
            let mut invoices = self.invoices.lock().await;
            swap_invoice(&mut invoices, invoice, InvoiceStatus::Approved)?;
        }
        by_invoice.insert(invoice.id, pool.id);
        self.pools.write().await.insert(
            pool.id,
            Arc::new(Mutex::new(PoolLedger {
                pool: pool.clone(),
                contributions: Vec::new(),
                settlement: None,
            })),
        );
        Ok(())
    }

    async fn get_pool(&self, id: PoolId) -> EngineResult<Option<FundingPool>> {
        let entry = match self.pools.read().await.get(&id).cloned() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let ledger = entry.lock().await;
        Ok(Some(ledger.pool.clone()))
    }

    async fn pool_for_invoice(&self, invoice: InvoiceId) -> EngineResult<Option<FundingPool>> {
        let pool_id = self.pool_by_invoice.lock().await.get(&invoice).copied();
        match pool_id {
            Some(id) => self.get_pool(id).await,
            None => Ok(None),
        }
    }

    async fn list_pools(&self, status: Option<PoolStatus>) -> EngineResult<Vec<FundingPool>> {
        let entries: Vec<Arc<Mutex<PoolLedger>>> = self.pools.read().await.values().cloned().collect();
        let mut pools = Vec::with_capacity(entries.len());
        for entry in entries {
            let ledger = entry.lock().await;
            if status.map_or(true, |s| ledger.pool.status == s) {
                pools.push(ledger.pool.clone());
            }
        }
        pools.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        Ok(pools)
    }

    async fn list_contributions(&self, pool: PoolId) -> EngineResult<Vec<Contribution>> {
        let entry = self.pool_entry(pool).await?;
        let ledger = entry.lock().await;
        Ok(ledger.contributions.clone())
    }

    async fn investor_contributions(&self, investor: UserId) -> EngineResult<Vec<Contribution>> {
        let entries: Vec<Arc<Mutex<PoolLedger>>> = self.pools.read().await.values().cloned().collect();
        let mut found = Vec::new();
        for entry in entries {
            let ledger = entry.lock().await;
            found.extend(ledger.contributions.iter().filter(|c| c.investor == investor).cloned());
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn contribute(&self, req: ContributionRequest) -> EngineResult<ContributionOutcome> {
        let entry = self.pool_entry(req.pool_id).await?;
        let mut ledger = entry.lock().await;

        let first = !ledger.contributions.iter().any(|c| c.investor == req.investor);
        let was_open = ledger.pool.status == PoolStatus::Open;
        let (pool, contribution) = ledger
            .pool
            .admit(req.investor, req.tranche, req.amount, first, req.now)?;

        self.accounts.lock().await.apply(
            &[(req.investor, -req.amount, LedgerKind::Contribution, Some(req.pool_id.as_uuid()))],
            req.investor,
        )?;

        let filled = was_open && pool.status == PoolStatus::Filled;
        ledger.pool = pool.clone();
        ledger.contributions.push(contribution.clone());

        Ok(ContributionOutcome { pool, contribution, filled })
    }

    async fn force_close_pool(
        &self,
        pool: PoolId,
        reason: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<ForceCloseOutcome> {
        let entry = self.pool_entry(pool).await?;
        let mut ledger = entry.lock().await;

        let closed = ledger.pool.force_close(reason, now)?;
        let refunds: Vec<(UserId, i64, LedgerKind, Option<Uuid>)> = ledger
            .contributions
            .iter()
            .map(|c| (c.investor, c.amount.amount, LedgerKind::Refund, Some(pool.as_uuid())))
            .collect();
        let refunded = ledger.pool.funded_amount()?;

        self.accounts.lock().await.apply(&refunds, actor)?;
        ledger.pool = closed.clone();

        Ok(ForceCloseOutcome { pool: closed, refunded })
    }

    async fn disburse_pool(&self, pool: PoolId, actor: UserId, now: DateTime<Utc>) -> EngineResult<FundingPool> {
        let entry = self.pool_entry(pool).await?;
        let mut ledger = entry.lock().await;

        let (priority, catalyst) = ledger_totals(&ledger.contributions)?;
        let ledger_total = priority
            .checked_add(catalyst)
            .ok_or(EngineError::Overflow("contribution ledger sum"))?;
        let disbursed = ledger.pool.disburse(ledger_total, now)?;

        let mut invoices = self.invoices.lock().await;
        let invoice = invoices
            .get(&disbursed.invoice_id)
            .ok_or_else(|| EngineError::NotFound(format!("invoice {}", disbursed.invoice_id)))?
            .mark_funded()?;

        let amount = disbursed.funded_amount()?.amount;
        self.accounts.lock().await.apply(
            &[(disbursed.exporter, amount, LedgerKind::Disbursement, Some(pool.as_uuid()))],
            actor,
        )?;

        swap_invoice(&mut invoices, &invoice, InvoiceStatus::Funding)?;
        ledger.pool = disbursed.clone();
        Ok(disbursed)
    }

    async fn settle_pool(
        &self,
        pool: PoolId,
        gross_proceeds: Money,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<SettlementOutcome> {
        let entry = self.pool_entry(pool).await?;
        let mut ledger = entry.lock().await;

        if let Some(existing) = &ledger.settlement {
            return Ok(SettlementOutcome {
                settlement: existing.replay(gross_proceeds)?,
                replayed: true,
            });
        }

        let settled_pool = ledger.pool.settle(now)?;
        let result = waterfall::compute(&ledger.pool, &ledger.contributions, gross_proceeds)?;

        let mut invoices = self.invoices.lock().await;
        let invoice = invoices
            .get(&settled_pool.invoice_id)
            .ok_or_else(|| EngineError::NotFound(format!("invoice {}", settled_pool.invoice_id)))?
            .mark_repaid()?;

        let mut credits: Vec<(UserId, i64, LedgerKind, Option<Uuid>)> = result
            .payouts
            .iter()
            .filter(|p| p.amount.is_positive())
            .map(|p| (p.investor, p.amount.amount, LedgerKind::Payout, Some(pool.as_uuid())))
            .collect();
        if result.residual.is_positive() {
            credits.push((settled_pool.exporter, result.residual.amount, LedgerKind::Residual, Some(pool.as_uuid())));
        }
        self.accounts.lock().await.apply(&credits, actor)?;

        swap_invoice(&mut invoices, &invoice, InvoiceStatus::Funded)?;
        let settlement = Settlement {
            pool_id: pool,
            result,
            settled_by: actor,
            settled_at: now,
        };
        ledger.pool = settled_pool;
        ledger.settlement = Some(settlement.clone());

        Ok(SettlementOutcome { settlement, replayed: false })
    }

    async fn get_settlement(&self, pool: PoolId) -> EngineResult<Option<Settlement>> {
        let entry = self.pool_entry(pool).await?;
        let ledger = entry.lock().await;
        Ok(ledger.settlement.clone())
    }

    async fn get_balance(&self, user: UserId) -> EngineResult<Balance> {
        Ok(self.accounts.lock().await.balance(user))
    }

    async fn adjust_balance(
        &self,
        user: UserId,
        delta: i64,
        kind: LedgerKind,
        reference: Option<Uuid>,
        actor: UserId,
    ) -> EngineResult<Balance> {
        let mut accounts = self.accounts.lock().await;
        accounts.apply(&[(user, delta, kind, reference)], actor)?;
        Ok(accounts.balance(user))
    }

    async fn ledger_entries(&self, user: UserId) -> EngineResult<Vec<LedgerEntry>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts.entries.iter().filter(|e| e.user == user).cloned().collect())
    }

    async fn upsert_risk_profile(&self, profile: &RiskProfile) -> EngineResult<()> {
        self.profiles.lock().await.insert(profile.investor, profile.clone());
        Ok(())
    }

    async fn get_risk_profile(&self, investor: UserId) -> EngineResult<Option<RiskProfile>> {
        Ok(self.profiles.lock().await.get(&investor).cloned())
    }

    async fn insert_application(&self, application: &ExporterApplication) -> EngineResult<()> {
        self.applications.lock().await.insert(application.id, application.clone());
        Ok(())
    }

    async fn get_application(&self, id: ApplicationId) -> EngineResult<Option<ExporterApplication>> {
        Ok(self.applications.lock().await.get(&id).cloned())
    }

    async fn update_application(
        &self,
        application: &ExporterApplication,
        expected: ApplicationStatus,
    ) -> EngineResult<()> {
        let mut applications = self.applications.lock().await;
        let stored = applications
            .get_mut(&application.id)
            .ok_or_else(|| EngineError::NotFound(format!("application {}", application.id)))?;
        if stored.status != expected {
            return Err(EngineError::InvalidState(format!(
                "application {} is {}, expected {}",
                application.id,
                stored.status.as_str(),
                expected.as_str()
            )));
        }
        *stored = application.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_balance_adjust_all_or_nothing() {
        let repo = MemoryRepository::new();
        let user = UserId::new();
        let admin = UserId::new();

        let balance = repo.adjust_balance(user, 1_000, LedgerKind::Grant, None, admin).await.unwrap();
        assert_eq!(balance.available.amount, 1_000);

        let err = repo
            .adjust_balance(user, -1_001, LedgerKind::Grant, None, admin)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert_eq!(repo.get_balance(user).await.unwrap().available.amount, 1_000);
        assert_eq!(repo.ledger_entries(user).await.unwrap().len(), 1);
    }

    #[test]
    fn test_accounts_apply_is_atomic() {
        let mut accounts = Accounts::default();
        let (a, b, actor) = (UserId::new(), UserId::new(), UserId::new());
        accounts.apply(&[(a, 10, LedgerKind::Grant, None)], actor).unwrap();

        // b가 음수가 되므로 a의 증가도 반영되지 않아야 함
        let err = accounts.apply(
            &[(a, 5, LedgerKind::Payout, None), (b, -1, LedgerKind::Grant, None)],
            actor,
        );
        assert!(err.is_err());
        assert_eq!(accounts.balance(a).available.amount, 10);
        assert_eq!(accounts.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_pool_is_not_found() {
        let repo = MemoryRepository::new();
        assert!(repo.get_pool(PoolId::new()).await.unwrap().is_none());
        assert!(matches!(
            repo.list_contributions(PoolId::new()).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
