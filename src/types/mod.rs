//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의
//!
//! - `money`: 금액, 통화, basis point, 환율 변환
//! - `ledger`: 사용자 잔액과 원장 항목
//! - ID newtype, actor/role, tranche

mod ledger;
mod money;

pub use ledger::{Balance, LedgerEntry, LedgerKind};
pub use money::{convert_to_idr, mul_div_floor, Bps, Currency, Money};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// 사용자 (exporter / investor / admin)
    UserId
);
id_type!(InvoiceId);
id_type!(PoolId);
id_type!(ContributionId);
id_type!(
    /// Exporter(mitra) 가입 신청서
    ApplicationId
);

/// 인증된 사용자 역할 (인증 자체는 외부 게이트웨이)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Exporter,
    Investor,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exporter" | "mitra" => Some(Role::Exporter),
            "investor" => Some(Role::Investor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// 모든 연산에 명시적으로 전달되는 호출자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn admin(id: UserId) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn exporter(id: UserId) -> Self {
        Self::new(id, Role::Exporter)
    }

    pub fn investor(id: UserId) -> Self {
        Self::new(id, Role::Investor)
    }

    pub fn require_admin(&self) -> EngineResult<()> {
        if self.role != Role::Admin {
            return Err(EngineError::Forbidden("admin role required".to_string()));
        }
        Ok(())
    }

    /// 본인 또는 관리자만 허용
    pub fn require_self_or_admin(&self, user: UserId) -> EngineResult<()> {
        if self.role == Role::Admin || self.id == user {
            Ok(())
        } else {
            Err(EngineError::Forbidden("not the owner of this resource".to_string()))
        }
    }
}

/// 위험 트랜치
///
/// - Priority: 선순위, 먼저 상환
/// - Catalyst: 후순위 (first-loss)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tranche {
    Priority,
    Catalyst,
}

impl Tranche {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tranche::Priority => "priority",
            Tranche::Catalyst => "catalyst",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "priority" => Ok(Tranche::Priority),
            "catalyst" => Ok(Tranche::Catalyst),
            other => Err(EngineError::Validation(format!("unknown tranche: {}", other))),
        }
    }
}

impl fmt::Display for Tranche {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
