//! End-to-end scenarios against the in-memory repository.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

use crate::config::Config;
use crate::db::MemoryRepository;
use crate::error::EngineError;
use crate::services::events::{DomainEvent, EventBus};
use crate::services::grading::Grade;
use crate::services::invoice::tests::sample_request;
use crate::services::invoice::InvoiceStatus;
use crate::services::marketplace::Marketplace;
use crate::services::pool::{FundingPool, PoolStatus};
use crate::types::{Actor, PoolId, Tranche, UserId};
use crate::AppState;

struct Harness {
    market: Arc<Marketplace>,
    admin: Actor,
    exporter: Actor,
}

impl Harness {
    fn new() -> Self {
        let market = Marketplace::new(Arc::new(MemoryRepository::new()), Arc::new(EventBus::new(256)), 14);
        Self {
            market: Arc::new(market),
            admin: Actor::admin(UserId::new()),
            exporter: Actor::exporter(UserId::new()),
        }
    }

    /// draft → pending_review → approved(A) → pool open (90M: 72M / 18M)
    async fn open_pool(&self) -> FundingPool {
        let invoice = self.market.create_invoice(self.exporter, sample_request()).await.unwrap();
        self.market.submit_invoice(self.exporter, invoice.id).await.unwrap();
        self.market
            .approve_invoice(self.admin, invoice.id, Grade::A, None)
            .await
            .unwrap();
        self.market.create_pool(self.admin, invoice.id).await.unwrap()
    }

    async fn funded_investor(&self, amount: i64) -> Actor {
        let investor = Actor::investor(UserId::new());
        self.market.grant_balance(self.admin, investor.id, amount).await.unwrap();
        investor
    }

    async fn catalyst_investor(&self, amount: i64) -> Actor {
        let investor = self.funded_investor(amount).await;
        self.market
            .submit_questionnaire(investor, &[2, 2, 2, 2, 2], Tranche::Catalyst)
            .await
            .unwrap();
        investor
    }

    async fn available(&self, user: UserId) -> i64 {
        self.market.balance(self.admin, user).await.unwrap().available.amount
    }

    async fn pool(&self, id: PoolId) -> FundingPool {
        self.market.get_pool(id).await.unwrap().pool
    }
}

#[tokio::test]
async fn test_full_lifecycle_conserves_money() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    assert_eq!(pool.target_amount.amount, 90_000_000);
    assert_eq!(pool.priority_target.amount, 72_000_000);
    assert_eq!(pool.catalyst_target.amount, 18_000_000);

    let alice = h.funded_investor(40_000_000).await;
    let bob = h.funded_investor(32_000_000).await;
    let carol = h.catalyst_investor(18_000_000).await;

    h.market.contribute(alice, pool.id, Tranche::Priority, 40_000_000).await.unwrap();
    h.market.contribute(bob, pool.id, Tranche::Priority, 32_000_000).await.unwrap();
    h.market.contribute(carol, pool.id, Tranche::Catalyst, 18_000_000).await.unwrap();

    let filled = h.pool(pool.id).await;
    assert_eq!(filled.status, PoolStatus::Filled);
    assert_eq!(filled.investor_count, 3);
    assert_eq!(h.available(alice.id).await, 0);

    h.market.disburse(h.admin, pool.id).await.unwrap();
    assert_eq!(h.available(h.exporter.id).await, 90_000_000);
    let invoice = h.market.get_invoice(h.admin, filled.invoice_id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Funded);

    let settlement = h.market.record_repayment(h.admin, pool.id, 100_000_000).await.unwrap();
    let result = &settlement.result;
    assert_eq!(result.priority.paid.amount, 73_775_342);
    assert_eq!(result.catalyst.paid.amount, 18_798_904);
    assert_eq!(result.residual.amount, 7_425_754);
    assert!(!result.has_shortfall());

    // 73,775,342 × 40/72 = 40,986,301.11 / × 32/72 = 32,789,040.89 → 남은 1은 bob
    assert_eq!(h.available(alice.id).await, 40_986_301);
    assert_eq!(h.available(bob.id).await, 32_789_041);
    assert_eq!(h.available(carol.id).await, 18_798_904);
    assert_eq!(h.available(h.exporter.id).await, 90_000_000 + 7_425_754);

    let mut sum = 0;
    for user in [alice.id, bob.id, carol.id, h.exporter.id] {
        sum += h.available(user).await;
    }
    // 초기 지급 90M + 상환 총액 100M
    assert_eq!(sum, 190_000_000);

    assert_eq!(h.pool(pool.id).await.status, PoolStatus::Closed);
    let invoice = h.market.get_invoice(h.admin, filled.invoice_id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Repaid);

    let events = h.market.recent_events(100);
    assert!(events
        .iter()
        .any(|e| matches!(e.event, DomainEvent::PoolSettled { shortfall: false, .. })));
    assert!(events.iter().any(|e| matches!(e.event, DomainEvent::PoolFilled { .. })));
}

#[tokio::test]
async fn test_settlement_is_idempotent() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let priority = h.funded_investor(72_000_000).await;
    let catalyst = h.catalyst_investor(18_000_000).await;
    h.market.contribute(priority, pool.id, Tranche::Priority, 72_000_000).await.unwrap();
    h.market.contribute(catalyst, pool.id, Tranche::Catalyst, 18_000_000).await.unwrap();
    h.market.disburse(h.admin, pool.id).await.unwrap();

    let first = h.market.record_repayment(h.admin, pool.id, 80_000_000).await.unwrap();
    let balance_after = h.available(priority.id).await;

    let replay = h.market.record_repayment(h.admin, pool.id, 80_000_000).await.unwrap();
    assert_eq!(first, replay);
    assert_eq!(h.available(priority.id).await, balance_after);

    let err = h.market.record_repayment(h.admin, pool.id, 81_000_000).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let settled = h
        .market
        .recent_events(100)
        .into_iter()
        .filter(|e| matches!(e.event, DomainEvent::PoolSettled { .. }))
        .count();
    assert_eq!(settled, 1);
}

#[tokio::test]
async fn test_shortfall_lands_on_catalyst_first() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let priority = h.funded_investor(72_000_000).await;
    let catalyst = h.catalyst_investor(18_000_000).await;
    h.market.contribute(priority, pool.id, Tranche::Priority, 72_000_000).await.unwrap();
    h.market.contribute(catalyst, pool.id, Tranche::Catalyst, 18_000_000).await.unwrap();
    h.market.disburse(h.admin, pool.id).await.unwrap();

    // priority 원리금과 정확히 같은 금액
    let settlement = h.market.record_repayment(h.admin, pool.id, 73_775_342).await.unwrap();
    assert_eq!(settlement.result.priority.shortfall.amount, 0);
    assert_eq!(settlement.result.catalyst.paid.amount, 0);
    assert_eq!(settlement.result.catalyst.shortfall.amount, 18_798_904);
    assert_eq!(settlement.result.residual.amount, 0);
    assert_eq!(h.available(catalyst.id).await, 0);
}

#[tokio::test]
async fn test_exporter_history_feeds_next_grade() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let priority = h.funded_investor(72_000_000).await;
    let catalyst = h.catalyst_investor(18_000_000).await;
    h.market.contribute(priority, pool.id, Tranche::Priority, 72_000_000).await.unwrap();
    h.market.contribute(catalyst, pool.id, Tranche::Catalyst, 18_000_000).await.unwrap();
    h.market.disburse(h.admin, pool.id).await.unwrap();
    h.market.record_repayment(h.admin, pool.id, 95_000_000).await.unwrap();

    let next = h.market.create_invoice(h.exporter, sample_request()).await.unwrap();
    let suggestion = h.market.grade_suggestion(h.exporter, next.id).await.unwrap();
    // repeat buyer 40 + 전액 상환 1건 60
    assert_eq!(suggestion.history_score, 100);
    assert_eq!(suggestion.suggested_grade, Grade::A);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_contributions_never_overshoot() {
    let h = Harness::new();
    let pool = h.open_pool().await;

    let mut investors = Vec::new();
    for _ in 0..20 {
        investors.push(h.funded_investor(5_000_000).await);
    }

    let handles: Vec<_> = investors
        .into_iter()
        .map(|investor| {
            let market = h.market.clone();
            tokio::spawn(async move {
                market.contribute(investor, pool.id, Tranche::Priority, 5_000_000).await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::CapacityExceeded { tranche, remaining, .. }) => {
                assert_eq!(tranche, Tranche::Priority);
                assert!(remaining < 5_000_000);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // 72M / 5M → 14건 수락, 2M 남음
    assert_eq!(accepted, 14);
    let current = h.pool(pool.id).await;
    assert_eq!(current.priority_funded.amount, 70_000_000);
    assert_eq!(current.contribution_count, 14);

    let contributions = h.market.pool_contributions(h.admin, pool.id).await.unwrap();
    let ledger: i64 = contributions.iter().map(|c| c.amount.amount).sum();
    assert_eq!(ledger, current.priority_funded.amount);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_approve_and_reject_single_winner() {
    let h = Harness::new();
    let invoice = h.market.create_invoice(h.exporter, sample_request()).await.unwrap();
    h.market.submit_invoice(h.exporter, invoice.id).await.unwrap();

    let (approve_market, reject_market) = (h.market.clone(), h.market.clone());
    let (a, b) = (h.admin, Actor::admin(UserId::new()));
    let id = invoice.id;
    let approve = tokio::spawn(async move { approve_market.approve_invoice(a, id, Grade::B, None).await });
    let reject = tokio::spawn(async move { reject_market.reject_invoice(b, id, "duplicate").await });

    let approve = approve.await.unwrap();
    let reject = reject.await.unwrap();
    assert!(approve.is_ok() ^ reject.is_ok());

    let stored = h.market.get_invoice(h.admin, id).await.unwrap();
    if approve.is_ok() {
        assert_eq!(stored.status, InvoiceStatus::Approved);
        assert!(matches!(reject, Err(EngineError::InvalidState(_))));
    } else {
        assert_eq!(stored.status, InvoiceStatus::Rejected);
        assert!(matches!(approve, Err(EngineError::InvalidState(_))));
    }
}

#[tokio::test]
async fn test_tier_gate_blocks_catalyst_without_side_effects() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let investor = h.funded_investor(10_000_000).await;

    let err = h
        .market
        .contribute(investor, pool.id, Tranche::Catalyst, 1_000_000)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TierLocked(id) if id == investor.id));
    assert_eq!(h.pool(pool.id).await.catalyst_funded.amount, 0);
    assert_eq!(h.available(investor.id).await, 10_000_000);

    // 점수 미달 설문도 잠금 유지
    h.market
        .submit_questionnaire(investor, &[3, 3, 1, 1, 1], Tranche::Catalyst)
        .await
        .unwrap();
    assert!(matches!(
        h.market.contribute(investor, pool.id, Tranche::Catalyst, 1_000_000).await,
        Err(EngineError::TierLocked(_))
    ));

    // priority는 언제나 허용
    assert_ok!(h.market.contribute(investor, pool.id, Tranche::Priority, 1_000_000).await);
}

#[tokio::test]
async fn test_contribution_requires_balance() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let investor = h.funded_investor(1_000).await;

    let err = h
        .market
        .contribute(investor, pool.id, Tranche::Priority, 1_001)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    let current = h.pool(pool.id).await;
    assert_eq!(current.priority_funded.amount, 0);
    assert_eq!(current.contribution_count, 0);
}

#[tokio::test]
async fn test_double_reject_keeps_first_reason() {
    let h = Harness::new();
    let invoice = h.market.create_invoice(h.exporter, sample_request()).await.unwrap();
    h.market.submit_invoice(h.exporter, invoice.id).await.unwrap();

    assert_ok!(h.market.reject_invoice(h.admin, invoice.id, "missing bill of lading").await);
    let err = assert_err!(h.market.reject_invoice(h.admin, invoice.id, "second opinion").await);
    assert!(matches!(err, EngineError::InvalidState(_)));

    let stored = h.market.get_invoice(h.admin, invoice.id).await.unwrap();
    assert_eq!(stored.rejection_reason.as_deref(), Some("missing bill of lading"));
}

#[tokio::test]
async fn test_one_pool_per_invoice() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let err = assert_err!(h.market.create_pool(h.admin, pool.invoice_id).await);
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(h.market.list_pools(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unfundable_invoice_gets_no_pool() {
    let h = Harness::new();
    let mut req = sample_request();
    req.original_amount = 1;
    let invoice = h.market.create_invoice(h.exporter, req).await.unwrap();
    h.market.submit_invoice(h.exporter, invoice.id).await.unwrap();
    h.market
        .approve_invoice(h.admin, invoice.id, Grade::C, None)
        .await
        .unwrap();

    let err = assert_err!(h.market.create_pool(h.admin, invoice.id).await);
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.market.list_pools(None).await.unwrap().is_empty());
    let invoice = h.market.get_invoice(h.admin, invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Approved);
}

#[tokio::test]
async fn test_force_close_refunds_investors() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let alice = h.funded_investor(10_000_000).await;
    let carol = h.catalyst_investor(5_000_000).await;
    h.market.contribute(alice, pool.id, Tranche::Priority, 10_000_000).await.unwrap();
    h.market.contribute(carol, pool.id, Tranche::Catalyst, 5_000_000).await.unwrap();

    let closed = h
        .market
        .force_close(h.admin, pool.id, Some("deadline missed".to_string()))
        .await
        .unwrap();
    assert_eq!(closed.status, PoolStatus::Closed);
    assert_eq!(h.available(alice.id).await, 10_000_000);
    assert_eq!(h.available(carol.id).await, 5_000_000);

    assert!(matches!(
        h.market.contribute(alice, pool.id, Tranche::Priority, 1).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        h.market.disburse(h.admin, pool.id).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_disburse_requires_filled_pool() {
    let h = Harness::new();
    let pool = h.open_pool().await;
    let investor = h.funded_investor(1_000_000).await;
    h.market.contribute(investor, pool.id, Tranche::Priority, 1_000_000).await.unwrap();

    assert!(matches!(
        h.market.disburse(h.admin, pool.id).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        h.market.record_repayment(h.admin, pool.id, 1_000_000).await,
        Err(EngineError::InvalidState(_))
    ));
    assert_eq!(h.available(h.exporter.id).await, 0);
}

#[tokio::test]
async fn test_admin_operations_require_admin_role() {
    let h = Harness::new();
    let invoice = h.market.create_invoice(h.exporter, sample_request()).await.unwrap();
    h.market.submit_invoice(h.exporter, invoice.id).await.unwrap();

    assert!(matches!(
        h.market.approve_invoice(h.exporter, invoice.id, Grade::A, None).await,
        Err(EngineError::Forbidden(_))
    ));
    let investor = Actor::investor(UserId::new());
    assert!(matches!(
        h.market.create_invoice(investor, sample_request()).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ============ HTTP ============

fn app() -> axum::Router {
    crate::routes::router(AppState::in_memory(Config::default()))
}

#[tokio::test]
async fn test_health_reports_memory_storage() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["storage"], "memory");
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_missing_actor_is_unauthorized() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/risk-profile")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"answers":[2,2,2,2,2],"selected_tier":"catalyst"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_risk_profile_over_http() {
    let investor = UserId::new();
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/risk-profile")
                .header("content-type", "application/json")
                .header("x-actor-id", investor.to_string())
                .header("x-actor-role", "investor")
                .body(Body::from(r#"{"answers":[2,2,2,2,2],"selected_tier":"catalyst"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["catalyst_unlocked"], true);
    assert_eq!(json["score"], 10);
}

#[tokio::test]
async fn test_unknown_pool_is_not_found() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri(format!("/pools/{}", PoolId::new()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
