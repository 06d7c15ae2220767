//! Balance Ledger Primitives
//!
//! 사용자별 IDR 잔액과 append-only 원장 항목.
//! 잔액 변경은 항상 `LedgerEntry`와 함께 기록된다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Money, UserId};
use crate::error::{EngineError, EngineResult};

/// 원장 항목 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// 관리자 수동 조정 (+/-)
    Grant,
    /// 투자자 → pool
    Contribution,
    /// 강제 종료된 pool에서 투자자에게 반환
    Refund,
    /// pool → exporter
    Disbursement,
    /// 상환금 → 투자자
    Payout,
    /// 상환 잔여금 → exporter
    Residual,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Grant => "grant",
            LedgerKind::Contribution => "contribution",
            LedgerKind::Refund => "refund",
            LedgerKind::Disbursement => "disbursement",
            LedgerKind::Payout => "payout",
            LedgerKind::Residual => "residual",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        Ok(match s {
            "grant" => LedgerKind::Grant,
            "contribution" => LedgerKind::Contribution,
            "refund" => LedgerKind::Refund,
            "disbursement" => LedgerKind::Disbursement,
            "payout" => LedgerKind::Payout,
            "residual" => LedgerKind::Residual,
            other => return Err(EngineError::Storage(format!("unknown ledger kind: {}", other))),
        })
    }
}

/// 사용자 잔액 (IDR)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user: UserId,
    pub available: Money,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn empty(user: UserId) -> Self {
        Self {
            user,
            available: Money::idr(0),
            updated_at: Utc::now(),
        }
    }

    /// 부호 있는 조정. 결과가 음수면 `InsufficientBalance`, 잔액은 그대로.
    pub fn adjust(&mut self, delta: i64) -> EngineResult<()> {
        let next = self
            .available
            .amount
            .checked_add(delta)
            .ok_or(EngineError::Overflow("balance adjustment"))?;
        if next < 0 {
            return Err(EngineError::InsufficientBalance {
                user: self.user,
                available: self.available.amount,
                requested: i64::try_from(delta.unsigned_abs()).unwrap_or(i64::MAX),
            });
        }
        self.available.amount = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// append-only 원장 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user: UserId,
    /// 부호 있는 IDR 금액
    pub delta: i64,
    pub kind: LedgerKind,
    /// 관련 엔티티 (pool id, invoice id 등)
    pub reference: Option<Uuid>,
    /// 조정을 일으킨 actor
    pub actor: UserId,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(user: UserId, delta: i64, kind: LedgerKind, reference: Option<Uuid>, actor: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            delta,
            kind,
            reference,
            actor,
            created_at: Utc::now(),
        }
    }
}
