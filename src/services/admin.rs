//! Admin Workflow Controller
//!
//! 관리자 승인/반려와 잔액 수동 조정.
//! 모든 연산은 `Role::Admin` 필요, actor ID와 함께 로그에 남긴다.
//!
//! Exporter 신청 승인은 엔진 안에서 권한을 바꾸지 않는다. 역할은 gateway가
//! `x-actor-role`로 주입하므로, gateway가 `ExporterApplicationReviewed`
//! (`approved: true`)를 구독해 신청자에게 exporter 역할을 부여한다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::services::events::DomainEvent;
use crate::services::grading::Grade;
use crate::services::invoice::{Invoice, InvoiceStatus};
use crate::services::marketplace::Marketplace;
use crate::types::{Actor, ApplicationId, Balance, InvoiceId, LedgerKind, UserId};

/// Exporter 가입 신청 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        Ok(match s {
            "pending" => ApplicationStatus::Pending,
            "approved" => ApplicationStatus::Approved,
            "rejected" => ApplicationStatus::Rejected,
            other => return Err(EngineError::Storage(format!("unknown application status: {}", other))),
        })
    }
}

/// Exporter(mitra) 가입 신청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterApplication {
    pub id: ApplicationId,
    pub applicant: UserId,
    pub company_name: String,
    pub country: String,
    pub status: ApplicationStatus,
    pub reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<UserId>,
}

impl ExporterApplication {
    fn review(&self, approved: bool, reason: Option<String>, reviewer: UserId) -> EngineResult<Self> {
        if self.status != ApplicationStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "application {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        let mut next = self.clone();
        next.status = if approved { ApplicationStatus::Approved } else { ApplicationStatus::Rejected };
        next.reason = reason;
        next.reviewed_at = Some(Utc::now());
        next.reviewed_by = Some(reviewer);
        Ok(next)
    }
}

impl Marketplace {
    // ============ Invoices ============

    /// pending_review → approved (관리자 등급이 최종)
    pub async fn approve_invoice(
        &self,
        actor: Actor,
        id: InvoiceId,
        grade: Grade,
        notes: Option<String>,
    ) -> EngineResult<Invoice> {
        actor.require_admin()?;
        let invoice = self.load_invoice(id).await?;
        let approved = invoice.approve(grade, notes)?;
        self.repo.update_invoice(&approved, InvoiceStatus::PendingReview).await?;

        let suggested = invoice.grade_suggestion.map(|s| s.suggested_grade);
        if suggested.is_some() && suggested != Some(grade) {
            tracing::info!(invoice = %id, suggested = ?suggested, grade = grade.as_str(), actor = %actor.id, "grade overridden by admin");
        }
        tracing::info!(invoice = %id, grade = grade.as_str(), actor = %actor.id, "invoice approved");
        self.events.publish(DomainEvent::InvoiceApproved {
            invoice_id: id,
            grade,
            actor: actor.id,
        });
        Ok(approved)
    }

    /// pending_review → rejected (terminal)
    pub async fn reject_invoice(&self, actor: Actor, id: InvoiceId, reason: &str) -> EngineResult<Invoice> {
        actor.require_admin()?;
        let invoice = self.load_invoice(id).await?;
        let rejected = invoice.reject(reason)?;
        self.repo.update_invoice(&rejected, InvoiceStatus::PendingReview).await?;

        tracing::info!(invoice = %id, actor = %actor.id, reason, "invoice rejected");
        self.events.publish(DomainEvent::InvoiceRejected {
            invoice_id: id,
            reason: rejected.rejection_reason.clone().unwrap_or_default(),
            actor: actor.id,
        });
        Ok(rejected)
    }

    // ============ Exporter applications ============

    /// 가입 신청 (신청자 본인)
    pub async fn submit_exporter_application(
        &self,
        actor: Actor,
        company_name: &str,
        country: &str,
    ) -> EngineResult<ExporterApplication> {
        if company_name.trim().is_empty() || country.trim().is_empty() {
            return Err(EngineError::Validation("company name and country are required".to_string()));
        }
        let application = ExporterApplication {
            id: ApplicationId::new(),
            applicant: actor.id,
            company_name: company_name.trim().to_string(),
            country: country.trim().to_ascii_uppercase(),
            status: ApplicationStatus::Pending,
            reason: None,
            submitted_at: Utc::now(),
            reviewed_at: None,
            reviewed_by: None,
        };
        self.repo.insert_application(&application).await?;
        tracing::info!(application = %application.id, applicant = %actor.id, "exporter application submitted");
        Ok(application)
    }

    pub async fn approve_exporter_application(&self, actor: Actor, id: ApplicationId) -> EngineResult<ExporterApplication> {
        self.review_application(actor, id, true, None).await
    }

    pub async fn reject_exporter_application(
        &self,
        actor: Actor,
        id: ApplicationId,
        reason: &str,
    ) -> EngineResult<ExporterApplication> {
        if reason.trim().is_empty() {
            actor.require_admin()?;
            return Err(EngineError::Validation("rejection reason is required".to_string()));
        }
        self.review_application(actor, id, false, Some(reason.trim().to_string()))
            .await
    }

    async fn review_application(
        &self,
        actor: Actor,
        id: ApplicationId,
        approved: bool,
        reason: Option<String>,
    ) -> EngineResult<ExporterApplication> {
        actor.require_admin()?;
        let application = self
            .repo
            .get_application(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("application {}", id)))?;
        let reviewed = application.review(approved, reason, actor.id)?;
        self.repo
            .update_application(&reviewed, ApplicationStatus::Pending)
            .await?;

        tracing::info!(application = %id, approved, actor = %actor.id, "exporter application reviewed");
        self.events.publish(DomainEvent::ExporterApplicationReviewed {
            application_id: id,
            applicant: reviewed.applicant,
            approved,
            actor: actor.id,
        });
        Ok(reviewed)
    }

    // ============ Balances ============

    /// 수동 잔액 조정 (+/-). 잔액이 음수가 되면 `InsufficientBalance`.
    pub async fn grant_balance(&self, actor: Actor, user: UserId, signed_amount: i64) -> EngineResult<Balance> {
        actor.require_admin()?;
        if signed_amount == 0 {
            return Err(EngineError::Validation("grant amount must not be zero".to_string()));
        }

        let balance = self
            .repo
            .adjust_balance(user, signed_amount, LedgerKind::Grant, None, actor.id)
            .await
            .map_err(|err| {
                tracing::warn!(user = %user, delta = signed_amount, actor = %actor.id, error = %err, "balance grant rejected");
                err
            })?;

        tracing::info!(
            user = %user,
            delta = signed_amount,
            balance = balance.available.amount,
            actor = %actor.id,
            "balance granted"
        );
        self.events.publish(DomainEvent::BalanceGranted {
            user,
            delta: signed_amount,
            actor: actor.id,
        });
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::MemoryRepository;
    use crate::services::events::EventBus;

    fn market() -> Marketplace {
        Marketplace::new(Arc::new(MemoryRepository::new()), Arc::new(EventBus::new(64)), 14)
    }

    #[tokio::test]
    async fn test_grant_balance_positive_and_negative() {
        let market = market();
        let admin = Actor::admin(UserId::new());
        let user = UserId::new();

        let balance = market.grant_balance(admin, user, 5_000).await.unwrap();
        assert_eq!(balance.available.amount, 5_000);

        let balance = market.grant_balance(admin, user, -2_000).await.unwrap();
        assert_eq!(balance.available.amount, 3_000);

        let err = market.grant_balance(admin, user, -3_001).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));

        let entries = market.ledger(admin, user).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.actor == admin.id && e.kind == LedgerKind::Grant));
    }

    #[tokio::test]
    async fn test_grant_requires_admin() {
        let market = market();
        let investor = Actor::investor(UserId::new());
        assert!(matches!(
            market.grant_balance(investor, investor.id, 100).await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_exporter_application_review() {
        let market = market();
        let admin = Actor::admin(UserId::new());
        let applicant = Actor::exporter(UserId::new());

        let app = market
            .submit_exporter_application(applicant, "PT Kopi Nusantara", "id")
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert_eq!(app.country, "ID");

        let approved = market.approve_exporter_application(admin, app.id).await.unwrap();
        assert_eq!(approved.status, ApplicationStatus::Approved);
        assert_eq!(approved.reviewed_by, Some(admin.id));

        let reviewed = market
            .events()
            .recent(10)
            .into_iter()
            .find_map(|envelope| match envelope.event {
                DomainEvent::ExporterApplicationReviewed { applicant, approved, .. } => Some((applicant, approved)),
                _ => None,
            });
        assert_eq!(reviewed, Some((applicant.id, true)));

        let err = market
            .reject_exporter_application(admin, app.id, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reject_application_needs_reason() {
        let market = market();
        let admin = Actor::admin(UserId::new());
        let app = market
            .submit_exporter_application(Actor::exporter(UserId::new()), "CV Rempah", "ID")
            .await
            .unwrap();
        assert!(matches!(
            market.reject_exporter_application(admin, app.id, " ").await,
            Err(EngineError::Validation(_))
        ));
        let rejected = market
            .reject_exporter_application(admin, app.id, "incomplete KYC")
            .await
            .unwrap();
        assert_eq!(rejected.reason.as_deref(), Some("incomplete KYC"));
    }
}
