//! Database Module
//!
//! # Interview Q&A
//!
//! Q: 동시에 여러 투자자가 같은 tranche에 투자하면?
//! A: pool row lock으로 직렬화
//!
//!    ```sql
//!    SELECT ... FROM funding_pools WHERE id = $1 FOR UPDATE
//!    ```
//!
//!    - 용량 확인, 증가, 잔액 차감, contribution 기록이 한 트랜잭션
//!    - 같은 pool에 대한 두 번째 트랜잭션은 첫 번째 commit까지 대기
//!    - 어떤 순서로 실행돼도 tranche target 초과 불가
//!
//! Q: 관리자 두 명이 같은 invoice를 동시에 승인/반려하면?
//! A: 상태 compare-and-swap
//!
//!    ```sql
//!    UPDATE invoices SET ... WHERE id = $1 AND status = 'pending_review'
//!    ```
//!
//!    - 영향받은 row가 0이면 이미 다른 관리자가 처리한 것 → `InvalidState`
//!
//! Q: invoice당 pool이 하나뿐임을 어떻게 보장하는가?
//! A: `funding_pools.invoice_id UNIQUE` 제약 + invoice CAS (approved → funding)
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최소/최대 커넥션 수 설정
//!    - 커넥션 재사용 (오버헤드 감소)
//!    - 타임아웃 처리

mod models;
mod repository;

pub use repository::{
    ContributionOutcome, ContributionRequest, ForceCloseOutcome, MemoryRepository, Repository,
    SettlementOutcome,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::services::admin::{ApplicationStatus, ExporterApplication};
use crate::services::grading::ExporterHistory;
use crate::services::invoice::{Invoice, InvoiceStatus};
use crate::services::pool::{ledger_totals, Contribution, FundingPool, PoolStatus};
use crate::services::risk_gate::RiskProfile;
use crate::services::waterfall::{self, Settlement};
use crate::types::{
    ApplicationId, Balance, InvoiceId, LedgerEntry, LedgerKind, Money, PoolId, UserId,
};
use models::{
    to_db_int, ApplicationRow, BalanceRow, ContributionRow, InvoiceRow, LedgerEntryRow, PoolRow,
    RiskProfileRow, SettlementRow,
};

const INVOICE_COLUMNS: &str = "id, owner_id, invoice_number, description, buyer_name, buyer_country, \
    repeat_buyer, original_amount, original_currency, fx_rate, idr_amount, due_date, \
    funding_duration_days, priority_ratio_bps, catalyst_ratio_bps, priority_interest_bps, \
    catalyst_interest_bps, status, grade, grade_suggestion, review_notes, rejection_reason, \
    documents, created_at, updated_at";

const POOL_COLUMNS: &str = "id, invoice_id, exporter_id, target_amount, priority_target, \
    catalyst_target, priority_funded, catalyst_funded, priority_interest_bps, \
    catalyst_interest_bps, tenor_days, status, investor_count, contribution_count, deadline, \
    opened_at, disbursed_at, closed_at, close_reason";

const CONTRIBUTION_COLUMNS: &str = "id, pool_id, investor_id, tranche, amount, sequence, created_at";

/// 잔액 조정 한 건 (user, delta, kind, reference)
type Adjustment = (UserId, i64, LedgerKind, Option<Uuid>);

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pg: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10 (트래픽에 따라 조정)
    /// - min_connections: 1 (idle 시 최소 유지)
    /// - acquire_timeout: 3초 (커넥션 획득 대기)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pg = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pg })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pg).await?;
        Ok(())
    }
}

// ============ Transaction helpers ============

async fn fetch_invoice(conn: &mut PgConnection, id: InvoiceId, for_update: bool) -> EngineResult<Invoice> {
    let sql = format!(
        "SELECT {} FROM invoices WHERE id = $1{}",
        INVOICE_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query_as::<_, InvoiceRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("invoice {}", id)))?;
    row.try_into()
}

/// invoice 상태 CAS. 변경되는 컬럼은 리뷰/상태 관련 필드뿐.
async fn swap_invoice(conn: &mut PgConnection, invoice: &Invoice, expected: InvoiceStatus) -> EngineResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE invoices SET
            status = $2,
            grade = $3,
            grade_suggestion = $4,
            review_notes = $5,
            rejection_reason = $6,
            updated_at = $7
        WHERE id = $1 AND status = $8
        "#,
    )
    .bind(invoice.id.as_uuid())
    .bind(invoice.status.as_str())
    .bind(invoice.grade.map(|g| g.as_str()))
    .bind(invoice.grade_suggestion.map(Json))
    .bind(&invoice.review_notes)
    .bind(&invoice.rejection_reason)
    .bind(invoice.updated_at)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM invoices WHERE id = $1")
        .bind(invoice.id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
    match current {
        None => Err(EngineError::NotFound(format!("invoice {}", invoice.id))),
        Some((status,)) => Err(EngineError::InvalidState(format!(
            "invoice {} is {}, expected {}",
            invoice.id, status, expected
        ))),
    }
}

/// pool row lock (트랜잭션 종료까지 유지)
async fn lock_pool(conn: &mut PgConnection, id: PoolId) -> EngineResult<FundingPool> {
    let sql = format!("SELECT {} FROM funding_pools WHERE id = $1 FOR UPDATE", POOL_COLUMNS);
    let row = sqlx::query_as::<_, PoolRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("pool {}", id)))?;
    row.try_into()
}

async fn save_pool(conn: &mut PgConnection, pool: &FundingPool) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE funding_pools SET
            priority_funded = $2,
            catalyst_funded = $3,
            status = $4,
            investor_count = $5,
            contribution_count = $6,
            disbursed_at = $7,
            closed_at = $8,
            close_reason = $9
        WHERE id = $1
        "#,
    )
    .bind(pool.id.as_uuid())
    .bind(pool.priority_funded.amount)
    .bind(pool.catalyst_funded.amount)
    .bind(pool.status.as_str())
    .bind(to_db_int(pool.investor_count, "investor_count")?)
    .bind(to_db_int(pool.contribution_count, "contribution_count")?)
    .bind(pool.disbursed_at)
    .bind(pool.closed_at)
    .bind(&pool.close_reason)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn pool_contributions(conn: &mut PgConnection, pool: PoolId) -> EngineResult<Vec<Contribution>> {
    let sql = format!(
        "SELECT {} FROM contributions WHERE pool_id = $1 ORDER BY sequence",
        CONTRIBUTION_COLUMNS
    );
    sqlx::query_as::<_, ContributionRow>(&sql)
        .bind(pool.as_uuid())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Contribution::try_from)
        .collect()
}

async fn fetch_settlement(conn: &mut PgConnection, pool: PoolId) -> EngineResult<Option<Settlement>> {
    let row = sqlx::query_as::<_, SettlementRow>(
        "SELECT pool_id, result, settled_by, settled_at FROM settlements WHERE pool_id = $1",
    )
    .bind(pool.as_uuid())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Settlement::from))
}

/// 잔액 조정 + 원장 기록. balance row를 lock한 뒤 `Balance::adjust`로 검증.
async fn apply_adjustment(conn: &mut PgConnection, adjustment: Adjustment, actor: UserId) -> EngineResult<Balance> {
    let (user, delta, kind, reference) = adjustment;

    sqlx::query("INSERT INTO balances (user_id, available, updated_at) VALUES ($1, 0, NOW()) ON CONFLICT (user_id) DO NOTHING")
        .bind(user.as_uuid())
        .execute(&mut *conn)
        .await?;

    let mut balance: Balance = sqlx::query_as::<_, BalanceRow>(
        "SELECT user_id, available, updated_at FROM balances WHERE user_id = $1 FOR UPDATE",
    )
    .bind(user.as_uuid())
    .fetch_one(&mut *conn)
    .await?
    .into();

    balance.adjust(delta)?;

    sqlx::query("UPDATE balances SET available = $2, updated_at = $3 WHERE user_id = $1")
        .bind(user.as_uuid())
        .bind(balance.available.amount)
        .bind(balance.updated_at)
        .execute(&mut *conn)
        .await?;

    let entry = LedgerEntry::new(user, delta, kind, reference, actor);
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, user_id, delta, kind, reference, actor_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.user.as_uuid())
    .bind(entry.delta)
    .bind(entry.kind.as_str())
    .bind(entry.reference)
    .bind(entry.actor.as_uuid())
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(balance)
}

/// 여러 사용자 조정. user id 순으로 lock (교착 방지)
async fn apply_all(conn: &mut PgConnection, mut adjustments: Vec<Adjustment>, actor: UserId) -> EngineResult<()> {
    adjustments.sort_by_key(|(user, ..)| *user);
    for adjustment in adjustments {
        apply_adjustment(conn, adjustment, actor).await?;
    }
    Ok(())
}

#[async_trait]
impl Repository for Database {
    // ============ Invoices ============

    async fn insert_invoice(&self, invoice: &Invoice) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, owner_id, invoice_number, description, buyer_name, buyer_country,
                repeat_buyer, original_amount, original_currency, fx_rate, idr_amount, due_date,
                funding_duration_days, priority_ratio_bps, catalyst_ratio_bps, priority_interest_bps,
                catalyst_interest_bps, status, grade, grade_suggestion, review_notes, rejection_reason,
                documents, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.owner.as_uuid())
        .bind(&invoice.invoice_number)
        .bind(&invoice.description)
        .bind(&invoice.buyer.name)
        .bind(&invoice.buyer.country)
        .bind(invoice.buyer.repeat_buyer)
        .bind(invoice.original_amount.amount)
        .bind(invoice.original_amount.currency.as_str())
        .bind(invoice.fx_rate)
        .bind(invoice.idr_amount.amount)
        .bind(invoice.due_date)
        .bind(to_db_int(invoice.funding_duration_days, "funding_duration_days")?)
        .bind(invoice.tranches.priority_ratio_bps)
        .bind(invoice.tranches.catalyst_ratio_bps)
        .bind(invoice.tranches.priority_interest_bps)
        .bind(invoice.tranches.catalyst_interest_bps)
        .bind(invoice.status.as_str())
        .bind(invoice.grade.map(|g| g.as_str()))
        .bind(invoice.grade_suggestion.map(Json))
        .bind(&invoice.review_notes)
        .bind(&invoice.rejection_reason)
        .bind(Json(&invoice.documents))
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    async fn get_invoice(&self, id: InvoiceId) -> EngineResult<Option<Invoice>> {
        let mut conn = self.pg.acquire().await?;
        match fetch_invoice(&mut conn, id, false).await {
            Ok(invoice) => Ok(Some(invoice)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> EngineResult<()> {
        let mut conn = self.pg.acquire().await?;
        swap_invoice(&mut conn, invoice, expected).await
    }

    async fn exporter_history(&self, exporter: UserId) -> EngineResult<ExporterHistory> {
        let (repaid, defaulted): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT shortfall),
                COUNT(*) FILTER (WHERE shortfall)
            FROM settlements
            WHERE exporter_id = $1
            "#,
        )
        .bind(exporter.as_uuid())
        .fetch_one(&self.pg)
        .await?;

        Ok(ExporterHistory {
            repaid_in_full: u32::try_from(repaid).map_err(|_| EngineError::Overflow("repaid count"))?,
            defaulted: u32::try_from(defaulted).map_err(|_| EngineError::Overflow("default count"))?,
        })
    }

    // ============ Pools ============

    async fn create_pool(&self, pool: &FundingPool, invoice: &Invoice) -> EngineResult<()> {
        let mut tx = self.pg.begin().await?;

        swap_invoice(&mut tx, invoice, InvoiceStatus::Approved).await?;
        sqlx::query(
            r#"
            INSERT INTO funding_pools (
                id, invoice_id, exporter_id, target_amount, priority_target, catalyst_target,
                priority_funded, catalyst_funded, priority_interest_bps, catalyst_interest_bps,
                tenor_days, status, investor_count, contribution_count, deadline, opened_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(pool.id.as_uuid())
        .bind(pool.invoice_id.as_uuid())
        .bind(pool.exporter.as_uuid())
        .bind(pool.target_amount.amount)
        .bind(pool.priority_target.amount)
        .bind(pool.catalyst_target.amount)
        .bind(pool.priority_funded.amount)
        .bind(pool.catalyst_funded.amount)
        .bind(to_db_int(pool.priority_interest.0, "priority_interest_bps")?)
        .bind(to_db_int(pool.catalyst_interest.0, "catalyst_interest_bps")?)
        .bind(to_db_int(pool.tenor_days, "tenor_days")?)
        .bind(pool.status.as_str())
        .bind(to_db_int(pool.investor_count, "investor_count")?)
        .bind(to_db_int(pool.contribution_count, "contribution_count")?)
        .bind(pool.deadline)
        .bind(pool.opened_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_pool(&self, id: PoolId) -> EngineResult<Option<FundingPool>> {
        let sql = format!("SELECT {} FROM funding_pools WHERE id = $1", POOL_COLUMNS);
        sqlx::query_as::<_, PoolRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pg)
            .await?
            .map(FundingPool::try_from)
            .transpose()
    }

    async fn pool_for_invoice(&self, invoice: InvoiceId) -> EngineResult<Option<FundingPool>> {
        let sql = format!("SELECT {} FROM funding_pools WHERE invoice_id = $1", POOL_COLUMNS);
        sqlx::query_as::<_, PoolRow>(&sql)
            .bind(invoice.as_uuid())
            .fetch_optional(&self.pg)
            .await?
            .map(FundingPool::try_from)
            .transpose()
    }

    async fn list_pools(&self, status: Option<PoolStatus>) -> EngineResult<Vec<FundingPool>> {
        let sql = format!(
            "SELECT {} FROM funding_pools WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY opened_at DESC",
            POOL_COLUMNS
        );
        sqlx::query_as::<_, PoolRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pg)
            .await?
            .into_iter()
            .map(FundingPool::try_from)
            .collect()
    }

    async fn list_contributions(&self, pool: PoolId) -> EngineResult<Vec<Contribution>> {
        let mut conn = self.pg.acquire().await?;
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM funding_pools WHERE id = $1")
            .bind(pool.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(EngineError::NotFound(format!("pool {}", pool)));
        }
        pool_contributions(&mut conn, pool).await
    }

    async fn investor_contributions(&self, investor: UserId) -> EngineResult<Vec<Contribution>> {
        let sql = format!(
            "SELECT {} FROM contributions WHERE investor_id = $1 ORDER BY created_at",
            CONTRIBUTION_COLUMNS
        );
        sqlx::query_as::<_, ContributionRow>(&sql)
            .bind(investor.as_uuid())
            .fetch_all(&self.pg)
            .await?
            .into_iter()
            .map(Contribution::try_from)
            .collect()
    }

    async fn contribute(&self, req: ContributionRequest) -> EngineResult<ContributionOutcome> {
        let mut tx = self.pg.begin().await?;

        let current = lock_pool(&mut tx, req.pool_id).await?;
        let (already_in,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM contributions WHERE pool_id = $1 AND investor_id = $2)",
        )
        .bind(req.pool_id.as_uuid())
        .bind(req.investor.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let (pool, contribution) = current.admit(req.investor, req.tranche, req.amount, !already_in, req.now)?;

        apply_adjustment(
            &mut tx,
            (req.investor, -req.amount, LedgerKind::Contribution, Some(req.pool_id.as_uuid())),
            req.investor,
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO contributions (id, pool_id, investor_id, tranche, amount, sequence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(contribution.id.as_uuid())
        .bind(contribution.pool_id.as_uuid())
        .bind(contribution.investor.as_uuid())
        .bind(contribution.tranche.as_str())
        .bind(contribution.amount.amount)
        .bind(to_db_int(contribution.sequence, "sequence")?)
        .bind(contribution.created_at)
        .execute(&mut *tx)
        .await?;

        save_pool(&mut tx, &pool).await?;
        tx.commit().await?;

        let filled = current.status == PoolStatus::Open && pool.status == PoolStatus::Filled;
        Ok(ContributionOutcome { pool, contribution, filled })
    }

    async fn force_close_pool(
        &self,
        pool: PoolId,
        reason: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<ForceCloseOutcome> {
        let mut tx = self.pg.begin().await?;

        let current = lock_pool(&mut tx, pool).await?;
        let closed = current.force_close(reason, now)?;
        let refunds: Vec<Adjustment> = pool_contributions(&mut tx, pool)
            .await?
            .iter()
            .map(|c| (c.investor, c.amount.amount, LedgerKind::Refund, Some(pool.as_uuid())))
            .collect();
        let refunded = current.funded_amount()?;

        apply_all(&mut tx, refunds, actor).await?;
        save_pool(&mut tx, &closed).await?;
        tx.commit().await?;

        Ok(ForceCloseOutcome { pool: closed, refunded })
    }

    async fn disburse_pool(&self, pool: PoolId, actor: UserId, now: DateTime<Utc>) -> EngineResult<FundingPool> {
        let mut tx = self.pg.begin().await?;

        let current = lock_pool(&mut tx, pool).await?;
        let contributions = pool_contributions(&mut tx, pool).await?;
        let (priority, catalyst) = ledger_totals(&contributions)?;
        let ledger_total = priority
            .checked_add(catalyst)
            .ok_or(EngineError::Overflow("contribution ledger sum"))?;
        let disbursed = current.disburse(ledger_total, now)?;

        let invoice = fetch_invoice(&mut tx, disbursed.invoice_id, true).await?.mark_funded()?;
        let amount = disbursed.funded_amount()?.amount;
        apply_adjustment(
            &mut tx,
            (disbursed.exporter, amount, LedgerKind::Disbursement, Some(pool.as_uuid())),
            actor,
        )
        .await?;

        swap_invoice(&mut tx, &invoice, InvoiceStatus::Funding).await?;
        save_pool(&mut tx, &disbursed).await?;
        tx.commit().await?;
        Ok(disbursed)
    }

    async fn settle_pool(
        &self,
        pool: PoolId,
        gross_proceeds: Money,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<SettlementOutcome> {
        let mut tx = self.pg.begin().await?;

        let current = lock_pool(&mut tx, pool).await?;
        if let Some(existing) = fetch_settlement(&mut tx, pool).await? {
            return Ok(SettlementOutcome {
                settlement: existing.replay(gross_proceeds)?,
                replayed: true,
            });
        }

        let settled_pool = current.settle(now)?;
        let contributions = pool_contributions(&mut tx, pool).await?;
        let result = waterfall::compute(&current, &contributions, gross_proceeds)?;
        let invoice = fetch_invoice(&mut tx, settled_pool.invoice_id, true).await?.mark_repaid()?;

        let mut credits: Vec<Adjustment> = result
            .payouts
            .iter()
            .filter(|p| p.amount.is_positive())
            .map(|p| (p.investor, p.amount.amount, LedgerKind::Payout, Some(pool.as_uuid())))
            .collect();
        if result.residual.is_positive() {
            credits.push((settled_pool.exporter, result.residual.amount, LedgerKind::Residual, Some(pool.as_uuid())));
        }
        apply_all(&mut tx, credits, actor).await?;

        let settlement = Settlement {
            pool_id: pool,
            result,
            settled_by: actor,
            settled_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO settlements (pool_id, exporter_id, gross_proceeds, shortfall, result, settled_by, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(pool.as_uuid())
        .bind(settled_pool.exporter.as_uuid())
        .bind(settlement.result.gross_proceeds.amount)
        .bind(settlement.result.has_shortfall())
        .bind(Json(&settlement.result))
        .bind(actor.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        swap_invoice(&mut tx, &invoice, InvoiceStatus::Funded).await?;
        save_pool(&mut tx, &settled_pool).await?;
        tx.commit().await?;

        Ok(SettlementOutcome { settlement, replayed: false })
    }

    async fn get_settlement(&self, pool: PoolId) -> EngineResult<Option<Settlement>> {
        let mut conn = self.pg.acquire().await?;
        fetch_settlement(&mut conn, pool).await
    }

    // ============ Balances ============

    async fn get_balance(&self, user: UserId) -> EngineResult<Balance> {
        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available, updated_at FROM balances WHERE user_id = $1",
        )
        .bind(user.as_uuid())
        .fetch_optional(&self.pg)
        .await?;
        Ok(row.map(Balance::from).unwrap_or_else(|| Balance::empty(user)))
    }

    async fn adjust_balance(
        &self,
        user: UserId,
        delta: i64,
        kind: LedgerKind,
        reference: Option<Uuid>,
        actor: UserId,
    ) -> EngineResult<Balance> {
        let mut tx = self.pg.begin().await?;
        let balance = apply_adjustment(&mut tx, (user, delta, kind, reference), actor).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn ledger_entries(&self, user: UserId) -> EngineResult<Vec<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntryRow>(
            r#"
            SELECT id, user_id, delta, kind, reference, actor_id, created_at
            FROM ledger_entries
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pg)
        .await?
        .into_iter()
        .map(LedgerEntry::try_from)
        .collect()
    }

    // ============ Risk profiles ============

    async fn upsert_risk_profile(&self, profile: &RiskProfile) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_profiles (investor_id, completed, selected_tier, catalyst_unlocked, score, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (investor_id)
            DO UPDATE SET
                completed = EXCLUDED.completed,
                selected_tier = EXCLUDED.selected_tier,
                catalyst_unlocked = EXCLUDED.catalyst_unlocked,
                score = EXCLUDED.score,
                submitted_at = EXCLUDED.submitted_at
            "#,
        )
        .bind(profile.investor.as_uuid())
        .bind(profile.completed)
        .bind(profile.selected_tier.as_str())
        .bind(profile.catalyst_unlocked)
        .bind(to_db_int(profile.score, "score")?)
        .bind(profile.submitted_at)
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    async fn get_risk_profile(&self, investor: UserId) -> EngineResult<Option<RiskProfile>> {
        sqlx::query_as::<_, RiskProfileRow>(
            r#"
            SELECT investor_id, completed, selected_tier, catalyst_unlocked, score, submitted_at
            FROM risk_profiles
            WHERE investor_id = $1
            "#,
        )
        .bind(investor.as_uuid())
        .fetch_optional(&self.pg)
        .await?
        .map(RiskProfile::try_from)
        .transpose()
    }

    // ============ Exporter applications ============

    async fn insert_application(&self, application: &ExporterApplication) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exporter_applications (
                id, applicant_id, company_name, country, status, reason,
                submitted_at, reviewed_at, reviewed_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(application.id.as_uuid())
        .bind(application.applicant.as_uuid())
        .bind(&application.company_name)
        .bind(&application.country)
        .bind(application.status.as_str())
        .bind(&application.reason)
        .bind(application.submitted_at)
        .bind(application.reviewed_at)
        .bind(application.reviewed_by.map(|u| u.as_uuid()))
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    async fn get_application(&self, id: ApplicationId) -> EngineResult<Option<ExporterApplication>> {
        sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT id, applicant_id, company_name, country, status, reason,
                   submitted_at, reviewed_at, reviewed_by
            FROM exporter_applications
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pg)
        .await?
        .map(ExporterApplication::try_from)
        .transpose()
    }

    async fn update_application(
        &self,
        application: &ExporterApplication,
        expected: ApplicationStatus,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE exporter_applications SET
                status = $2,
                reason = $3,
                reviewed_at = $4,
                reviewed_by = $5
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(application.id.as_uuid())
        .bind(application.status.as_str())
        .bind(&application.reason)
        .bind(application.reviewed_at)
        .bind(application.reviewed_by.map(|u| u.as_uuid()))
        .bind(expected.as_str())
        .execute(&self.pg)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_application(application.id).await? {
                None => Err(EngineError::NotFound(format!("application {}", application.id))),
                Some(stored) => Err(EngineError::InvalidState(format!(
                    "application {} is {}, expected {}",
                    application.id,
                    stored.status.as_str(),
                    expected.as_str()
                ))),
            };
        }
        Ok(())
    }
}
