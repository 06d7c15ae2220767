//! Marketplace Service
//!
//! 엔진의 진입점. 모든 연산은 명시적인 `Actor`와 엔티티 ID를 받는다 (ambient context 없음).
//!
//! # Flow
//!
//! ```text
//! create_invoice ─▶ submit_invoice (grading) ─▶ approve/reject (admin.rs)
//!        ─▶ create_pool ─▶ contribute × N ─▶ (filled) ─▶ disburse ─▶ record_repayment
//! ```
//!
//! 권한 확인 → 저장소의 원자적 연산 → 커밋 후 이벤트 발행 순서.

use std::sync::Arc;

use chrono::Utc;

use crate::db::{ContributionRequest, Repository};
use crate::error::{EngineError, EngineResult};
use crate::services::events::{DomainEvent, EventBus, EventEnvelope};
use crate::services::grading::{self, GradeSuggestion};
use crate::services::invoice::{Invoice, InvoiceStatus, NewInvoice};
use crate::services::pool::{Contribution, FundingPool, PoolStatus, PoolSummary};
use crate::services::risk_gate::{self, RiskProfile};
use crate::services::waterfall::{self, Settlement, WaterfallResult};
use crate::types::{Actor, Balance, InvoiceId, LedgerEntry, Money, PoolId, Role, Tranche, UserId};

/// 기본 모집 기간 (일)
pub const DEFAULT_FUNDING_WINDOW_DAYS: u32 = 14;

/// Marketplace 서비스
pub struct Marketplace {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) events: Arc<EventBus>,
    funding_window_days: u32,
}

impl Marketplace {
    pub fn new(repo: Arc<dyn Repository>, events: Arc<EventBus>, funding_window_days: u32) -> Self {
        Self {
            repo,
            events,
            funding_window_days,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) async fn load_invoice(&self, id: InvoiceId) -> EngineResult<Invoice> {
        self.repo
            .get_invoice(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("invoice {}", id)))
    }

    pub(crate) async fn load_pool(&self, id: PoolId) -> EngineResult<FundingPool> {
        self.repo
            .get_pool(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", id)))
    }

    // ============ Invoices ============

    /// Draft invoice 생성 (exporter)
    pub async fn create_invoice(&self, actor: Actor, req: NewInvoice) -> EngineResult<Invoice> {
        if actor.role != Role::Exporter {
            return Err(EngineError::Forbidden("only exporters create invoices".to_string()));
        }
        let invoice = Invoice::create(actor.id, req, Utc::now())?;
        self.repo.insert_invoice(&invoice).await?;

        tracing::info!(invoice = %invoice.id, owner = %actor.id, idr_amount = invoice.idr_amount.amount, "invoice created");
        self.events.publish(DomainEvent::InvoiceCreated {
            invoice_id: invoice.id,
            owner: invoice.owner,
            idr_amount: invoice.idr_amount,
        });
        Ok(invoice)
    }

    /// 소유자 또는 관리자만 조회
    pub async fn get_invoice(&self, actor: Actor, id: InvoiceId) -> EngineResult<Invoice> {
        let invoice = self.load_invoice(id).await?;
        actor.require_self_or_admin(invoice.owner)?;
        Ok(invoice)
    }

    /// 현재 신호로 등급 제안 계산 (부수효과 없음)
    pub async fn grade_suggestion(&self, actor: Actor, id: InvoiceId) -> EngineResult<GradeSuggestion> {
        let invoice = self.load_invoice(id).await?;
        actor.require_self_or_admin(invoice.owner)?;
        self.suggest(&invoice).await
    }

    async fn suggest(&self, invoice: &Invoice) -> EngineResult<GradeSuggestion> {
        let history = self.repo.exporter_history(invoice.owner).await?;
        Ok(grading::grade(&invoice.signals(), &history, &invoice.document_completeness()))
    }

    /// draft → pending_review + grading
    pub async fn submit_invoice(&self, actor: Actor, id: InvoiceId) -> EngineResult<Invoice> {
        let invoice = self.load_invoice(id).await?;
        if invoice.owner != actor.id {
            return Err(EngineError::Forbidden("only the owner can submit an invoice".to_string()));
        }

        let suggestion = self.suggest(&invoice).await?;
        let submitted = invoice.submit(suggestion)?;
        self.repo.update_invoice(&submitted, InvoiceStatus::Draft).await?;

        tracing::info!(
            invoice = %id,
            grade = suggestion.suggested_grade.as_str(),
            score = suggestion.grade_score,
            "invoice submitted for review"
        );
        self.events.publish(DomainEvent::InvoiceSubmitted {
            invoice_id: id,
            suggested_grade: suggestion.suggested_grade,
            grade_score: suggestion.grade_score,
        });
        Ok(submitted)
    }

    // ============ Pools ============

    /// approved → tokenized → funding + pool 생성 (admin)
    pub async fn create_pool(&self, actor: Actor, invoice_id: InvoiceId) -> EngineResult<FundingPool> {
        actor.require_admin()?;
        let invoice = self.load_invoice(invoice_id).await?;
        if self.repo.pool_for_invoice(invoice_id).await?.is_some() {
            // 빠른 실패. 최종 보장은 저장소의 unique 제약
            return Err(EngineError::InvalidState(format!("invoice {} already has a pool", invoice_id)));
        }

        let now = Utc::now();
        let pool = FundingPool::open(&invoice, self.funding_window_days, now)?;
        let funding = invoice.tokenize()?.start_funding()?;
        self.repo.create_pool(&pool, &funding).await?;

        tracing::info!(
            pool = %pool.id,
            invoice = %invoice_id,
            target = pool.target_amount.amount,
            priority_target = pool.priority_target.amount,
            catalyst_target = pool.catalyst_target.amount,
            actor = %actor.id,
            "funding pool opened"
        );
        self.events.publish_all([
            DomainEvent::InvoiceTokenized { invoice_id },
            DomainEvent::PoolOpened {
                pool_id: pool.id,
                invoice_id,
                target_amount: pool.target_amount,
            },
        ]);
        Ok(pool)
    }

    pub async fn get_pool(&self, id: PoolId) -> EngineResult<PoolSummary> {
        self.load_pool(id).await?.summary()
    }

    pub async fn list_pools(&self, status: Option<PoolStatus>) -> EngineResult<Vec<PoolSummary>> {
        self.repo
            .list_pools(status)
            .await?
            .iter()
            .map(FundingPool::summary)
            .collect()
    }

    pub async fn pool_contributions(&self, actor: Actor, id: PoolId) -> EngineResult<Vec<Contribution>> {
        let pool = self.load_pool(id).await?;
        actor.require_self_or_admin(pool.exporter)?;
        self.repo.list_contributions(id).await
    }

    pub async fn investor_contributions(&self, actor: Actor, investor: UserId) -> EngineResult<Vec<Contribution>> {
        actor.require_self_or_admin(investor)?;
        self.repo.investor_contributions(investor).await
    }

    /// 투자 (investor)
    ///
    /// tier gate → 저장소의 원자적 check-and-increment.
    /// 같은 호출을 두 번 하면 별개의 contribution 두 개가 생긴다.
    pub async fn contribute(
        &self,
        actor: Actor,
        pool_id: PoolId,
        tranche: Tranche,
        amount: i64,
    ) -> EngineResult<Contribution> {
        if actor.role != Role::Investor {
            return Err(EngineError::Forbidden("only investors contribute".to_string()));
        }

        let profile = self
            .repo
            .get_risk_profile(actor.id)
            .await?
            .unwrap_or_else(|| RiskProfile::not_completed(actor.id));
        if !profile.permits(tranche) {
            tracing::warn!(pool = %pool_id, investor = %actor.id, "catalyst contribution blocked by tier gate");
            return Err(EngineError::TierLocked(actor.id));
        }

        let outcome = self
            .repo
            .contribute(ContributionRequest {
                pool_id,
                investor: actor.id,
                tranche,
                amount,
                now: Utc::now(),
            })
            .await
            .map_err(|err| {
                tracing::warn!(pool = %pool_id, investor = %actor.id, %tranche, amount, error = %err, "contribution rejected");
                err
            })?;

        let contribution = outcome.contribution;
        tracing::info!(
            pool = %pool_id,
            investor = %actor.id,
            %tranche,
            amount,
            priority_funded = outcome.pool.priority_funded.amount,
            catalyst_funded = outcome.pool.catalyst_funded.amount,
            "contribution accepted"
        );
        self.events.publish(DomainEvent::ContributionAccepted {
            pool_id,
            contribution_id: contribution.id,
            investor: actor.id,
            tranche,
            amount: contribution.amount,
        });
        if outcome.filled {
            tracing::info!(pool = %pool_id, "pool filled");
            self.events.publish(DomainEvent::PoolFilled { pool_id });
        }
        Ok(contribution)
    }

    /// open → closed + 환불 (admin, deadline 미달 시)
    pub async fn force_close(&self, actor: Actor, pool_id: PoolId, reason: Option<String>) -> EngineResult<FundingPool> {
        actor.require_admin()?;
        let outcome = self
            .repo
            .force_close_pool(pool_id, reason, actor.id, Utc::now())
            .await?;

        tracing::info!(pool = %pool_id, refunded = outcome.refunded.amount, actor = %actor.id, "pool force closed");
        self.events.publish(DomainEvent::PoolForceClosed {
            pool_id,
            refunded: outcome.refunded,
            actor: actor.id,
        });
        Ok(outcome.pool)
    }

    /// filled → disbursed, funded_amount → exporter (admin)
    pub async fn disburse(&self, actor: Actor, pool_id: PoolId) -> EngineResult<FundingPool> {
        actor.require_admin()?;
        let pool = self.repo.disburse_pool(pool_id, actor.id, Utc::now()).await?;
        let amount = pool.funded_amount()?;

        tracing::info!(pool = %pool_id, exporter = %pool.exporter, amount = amount.amount, actor = %actor.id, "pool disbursed");
        self.events.publish(DomainEvent::PoolDisbursed {
            pool_id,
            exporter: pool.exporter,
            amount,
            actor: actor.id,
        });
        Ok(pool)
    }

    /// 상환금 수령 → waterfall 분배 (admin, 멱등)
    pub async fn record_repayment(&self, actor: Actor, pool_id: PoolId, gross_proceeds: i64) -> EngineResult<Settlement> {
        actor.require_admin()?;
        let outcome = self
            .repo
            .settle_pool(pool_id, Money::idr(gross_proceeds), actor.id, Utc::now())
            .await?;

        let result = &outcome.settlement.result;
        if outcome.replayed {
            tracing::info!(pool = %pool_id, gross = gross_proceeds, "repayment replayed, settlement unchanged");
        } else {
            tracing::info!(
                pool = %pool_id,
                gross = gross_proceeds,
                priority_paid = result.priority.paid.amount,
                catalyst_paid = result.catalyst.paid.amount,
                residual = result.residual.amount,
                actor = %actor.id,
                "pool settled"
            );
            self.events.publish(DomainEvent::PoolSettled {
                pool_id,
                gross_proceeds: result.gross_proceeds,
                residual: result.residual,
                shortfall: result.has_shortfall(),
            });
        }
        Ok(outcome.settlement)
    }

    /// 정산 미리보기 (disbursed pool, 부수효과 없음)
    pub async fn preview_waterfall(&self, actor: Actor, pool_id: PoolId, gross_proceeds: i64) -> EngineResult<WaterfallResult> {
        actor.require_admin()?;
        let pool = self.load_pool(pool_id).await?;
        if pool.status != PoolStatus::Disbursed {
            return Err(EngineError::InvalidState(format!("pool is {}, expected disbursed", pool.status)));
        }
        let contributions = self.repo.list_contributions(pool_id).await?;
        waterfall::compute(&pool, &contributions, Money::idr(gross_proceeds))
    }

    pub async fn settlement(&self, pool_id: PoolId) -> EngineResult<Option<Settlement>> {
        self.repo.get_settlement(pool_id).await
    }

    // ============ Investors ============

    /// 위험 성향 설문 제출 (재응시 시 덮어씀)
    pub async fn submit_questionnaire(
        &self,
        actor: Actor,
        answers: &[u8],
        selected_tier: Tranche,
    ) -> EngineResult<RiskProfile> {
        if actor.role != Role::Investor {
            return Err(EngineError::Forbidden("only investors take the risk questionnaire".to_string()));
        }
        let profile = risk_gate::evaluate(actor.id, answers, selected_tier, Utc::now())?;
        self.repo.upsert_risk_profile(&profile).await?;

        tracing::info!(investor = %actor.id, score = profile.score, catalyst_unlocked = profile.catalyst_unlocked, "risk profile updated");
        self.events.publish(DomainEvent::RiskProfileUpdated {
            investor: actor.id,
            catalyst_unlocked: profile.catalyst_unlocked,
        });
        Ok(profile)
    }

    pub async fn risk_profile(&self, actor: Actor, investor: UserId) -> EngineResult<RiskProfile> {
        actor.require_self_or_admin(investor)?;
        Ok(self
            .repo
            .get_risk_profile(investor)
            .await?
            .unwrap_or_else(|| RiskProfile::not_completed(investor)))
    }

    pub async fn balance(&self, actor: Actor, user: UserId) -> EngineResult<Balance> {
        actor.require_self_or_admin(user)?;
        self.repo.get_balance(user).await
    }

    pub async fn ledger(&self, actor: Actor, user: UserId) -> EngineResult<Vec<LedgerEntry>> {
        actor.require_self_or_admin(user)?;
        self.repo.ledger_entries(user).await
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EventEnvelope> {
        self.events.recent(limit)
    }
}
