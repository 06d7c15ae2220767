//! Domain Event Bus
//!
//! 엔진은 이벤트를 발행만 하고 전달(알림, NFT 발행 등)은 외부 구독자 책임.
//!
//! # Architecture
//! ```text
//! ┌──────────────┐  publish   ┌──────────────┐  subscribe  ┌──────────────┐
//! │ Marketplace  │──────────▶│   EventBus    │────────────▶│  Notifier /  │
//! │ (commit 후)  │            │ broadcast +   │             │  Minter ...  │
//! └──────────────┘            │ recent buffer │             └──────────────┘
//!                             └──────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::services::grading::Grade;
use crate::types::{ApplicationId, ContributionId, InvoiceId, Money, PoolId, Tranche, UserId};

/// 도메인 이벤트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    InvoiceCreated {
        invoice_id: InvoiceId,
        owner: UserId,
        idr_amount: Money,
    },
    InvoiceSubmitted {
        invoice_id: InvoiceId,
        suggested_grade: Grade,
        grade_score: u32,
    },
    InvoiceApproved {
        invoice_id: InvoiceId,
        grade: Grade,
        actor: UserId,
    },
    InvoiceRejected {
        invoice_id: InvoiceId,
        reason: String,
        actor: UserId,
    },
    /// 외부 minting 서비스의 트리거
    InvoiceTokenized {
        invoice_id: InvoiceId,
    },
    PoolOpened {
        pool_id: PoolId,
        invoice_id: InvoiceId,
        target_amount: Money,
    },
    ContributionAccepted {
        pool_id: PoolId,
        contribution_id: ContributionId,
        investor: UserId,
        tranche: Tranche,
        amount: Money,
    },
    PoolFilled {
        pool_id: PoolId,
    },
    PoolForceClosed {
        pool_id: PoolId,
        refunded: Money,
        actor: UserId,
    },
    PoolDisbursed {
        pool_id: PoolId,
        exporter: UserId,
        amount: Money,
        actor: UserId,
    },
    PoolSettled {
        pool_id: PoolId,
        gross_proceeds: Money,
        residual: Money,
        shortfall: bool,
    },
    BalanceGranted {
        user: UserId,
        delta: i64,
        actor: UserId,
    },
    ExporterApplicationReviewed {
        application_id: ApplicationId,
        applicant: UserId,
        approved: bool,
        actor: UserId,
    },
    RiskProfileUpdated {
        investor: UserId,
        catalyst_unlocked: bool,
    },
}

/// 순번 + 발생 시각
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// 이벤트 버스
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    recent: Mutex<VecDeque<EventEnvelope>>,
    capacity: usize,
    next_sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// 이벤트 발행 (구독자가 없어도 recent buffer에는 남음)
    pub fn publish(&self, event: DomainEvent) {
        let envelope = EventEnvelope {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            occurred_at: Utc::now(),
            event,
        };
        tracing::debug!(sequence = envelope.sequence, event = ?envelope.event, "domain event");

        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(envelope.clone());
        }

        let _ = self.tx.send(envelope);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// 최근 이벤트 (오래된 순)
    pub fn recent(&self, limit: usize) -> Vec<EventEnvelope> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }
}
