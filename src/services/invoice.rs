//! Invoice State Machine
//!
//! # Lifecycle
//!
//! ```text
//! draft ──submit──▶ pending_review ──approve──▶ approved ──tokenize──▶ tokenized
//!                         │                                                │
//!                       reject                                       start_funding
//!                         ▼                                                ▼
//!                     rejected (terminal)       repaid ◀──repay── funded ◀──disburse── funding
//! ```
//!
//! 전이는 `transition()` 테이블로만 결정된다. 메서드는 새 `Invoice`를 반환하고
//! 원본은 건드리지 않으므로, 실패 시 엔티티는 항상 이전 상태 그대로다.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::services::grading::{
    DocumentCompleteness, DocumentKind, Grade, GradeSuggestion, InvoiceSignals,
};
use crate::types::{convert_to_idr, Bps, Currency, InvoiceId, Money, UserId};

/// 최대 funding 기간 (일)
pub const MAX_FUNDING_DURATION_DAYS: u32 = 365;

/// Invoice 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    PendingReview,
    Approved,
    Rejected,
    Tokenized,
    Funding,
    Funded,
    Repaid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::PendingReview => "pending_review",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Rejected => "rejected",
            InvoiceStatus::Tokenized => "tokenized",
            InvoiceStatus::Funding => "funding",
            InvoiceStatus::Funded => "funded",
            InvoiceStatus::Repaid => "repaid",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        Ok(match s {
            "draft" => InvoiceStatus::Draft,
            "pending_review" => InvoiceStatus::PendingReview,
            "approved" => InvoiceStatus::Approved,
            "rejected" => InvoiceStatus::Rejected,
            "tokenized" => InvoiceStatus::Tokenized,
            "funding" => InvoiceStatus::Funding,
            "funded" => InvoiceStatus::Funded,
            "repaid" => InvoiceStatus::Repaid,
            other => return Err(EngineError::Storage(format!("unknown invoice status: {}", other))),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Rejected | InvoiceStatus::Repaid)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 상태 전이 이벤트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEvent {
    Submit,
    Approve,
    Reject,
    Tokenize,
    StartFunding,
    Disburse,
    Repay,
}

/// 전이 테이블 (from × event → to)
pub fn transition(from: InvoiceStatus, event: InvoiceEvent) -> EngineResult<InvoiceStatus> {
    use InvoiceEvent as E;
    use InvoiceStatus as S;

    let to = match (from, event) {
        (S::Draft, E::Submit) => S::PendingReview,
        (S::PendingReview, E::Approve) => S::Approved,
        (S::PendingReview, E::Reject) => S::Rejected,
        (S::Approved, E::Tokenize) => S::Tokenized,
        (S::Tokenized, E::StartFunding) => S::Funding,
        (S::Funding, E::Disburse) => S::Funded,
        (S::Funded, E::Repay) => S::Repaid,
        (from, event) => {
            return Err(EngineError::InvalidState(format!(
                "invoice cannot {:?} from {}",
                event, from
            )))
        }
    };
    Ok(to)
}

/// 구매자 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    /// ISO 3166-1 alpha-2
    pub country: String,
    pub repeat_buyer: bool,
}

/// 트랜치 구성 (basis point)
///
/// draft 상태에서는 검증되지 않은 값일 수 있음 → 제출 시 `validate()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrancheConfig {
    pub priority_ratio_bps: i32,
    pub catalyst_ratio_bps: i32,
    /// 연이율 (p.a.)
    pub priority_interest_bps: i32,
    pub catalyst_interest_bps: i32,
}

impl TrancheConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.priority_ratio_bps < 0 || self.catalyst_ratio_bps < 0 {
            return Err(EngineError::Validation("tranche ratios must not be negative".to_string()));
        }
        if self.priority_ratio_bps as i64 + self.catalyst_ratio_bps as i64 != Bps::ONE.0 as i64 {
            return Err(EngineError::Validation(format!(
                "tranche ratios must sum to 10000 bps, got {} + {}",
                self.priority_ratio_bps, self.catalyst_ratio_bps
            )));
        }
        if self.priority_interest_bps < 0 || self.catalyst_interest_bps < 0 {
            return Err(EngineError::Validation("interest rates must not be negative".to_string()));
        }
        Ok(())
    }

    /// `validate()` 통과 후에만 호출
    pub fn priority_ratio(&self) -> Bps {
        Bps(self.priority_ratio_bps.max(0) as u32)
    }

    pub fn priority_rate(&self) -> Bps {
        Bps(self.priority_interest_bps.max(0) as u32)
    }

    pub fn catalyst_rate(&self) -> Bps {
        Bps(self.catalyst_interest_bps.max(0) as u32)
    }
}

/// 첨부 서류 (외부 저장소 참조, 내용은 보지 않음)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub reference: String,
}

/// Invoice 생성 요청
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub invoice_number: String,
    #[serde(default)]
    pub description: Option<String>,
    pub buyer: Buyer,
    /// 원 통화 minor unit
    pub original_amount: i64,
    pub original_currency: String,
    /// 원 통화 1 단위 당 IDR (외부 입력, 생성 시 고정)
    pub fx_rate: Decimal,
    pub due_date: DateTime<Utc>,
    pub funding_duration_days: u32,
    pub tranches: TrancheConfig,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
}

/// Invoice
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub owner: UserId,
    pub invoice_number: String,
    pub description: Option<String>,
    pub buyer: Buyer,
    pub original_amount: Money,
    pub fx_rate: Decimal,
    /// `original_amount × fx_rate`, 생성 후 불변
    pub idr_amount: Money,
    pub due_date: DateTime<Utc>,
    pub funding_duration_days: u32,
    pub tranches: TrancheConfig,
    pub status: InvoiceStatus,
    pub grade: Option<Grade>,
    pub grade_suggestion: Option<GradeSuggestion>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub documents: Vec<DocumentRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Draft invoice 생성 (환율 변환은 여기서 단 한 번)
    pub fn create(owner: UserId, req: NewInvoice, now: DateTime<Utc>) -> EngineResult<Self> {
        if req.invoice_number.trim().is_empty() {
            return Err(EngineError::Validation("invoice_number is required".to_string()));
        }
        if req.buyer.name.trim().is_empty() || req.buyer.country.trim().is_empty() {
            return Err(EngineError::Validation("buyer name and country are required".to_string()));
        }
        if req.funding_duration_days == 0 || req.funding_duration_days > MAX_FUNDING_DURATION_DAYS {
            return Err(EngineError::Validation(format!(
                "funding_duration_days must be within 1..={}",
                MAX_FUNDING_DURATION_DAYS
            )));
        }
        if req.due_date <= now {
            return Err(EngineError::Validation("due_date must be in the future".to_string()));
        }

        let currency = Currency::new(&req.original_currency)?;
        let original_amount = Money::new(req.original_amount, currency);
        let idr_amount = convert_to_idr(original_amount, req.fx_rate)?;

        Ok(Self {
            id: InvoiceId::new(),
            owner,
            invoice_number: req.invoice_number.trim().to_string(),
            description: req.description,
            buyer: Buyer {
                country: req.buyer.country.trim().to_ascii_uppercase(),
                ..req.buyer
            },
            original_amount,
            fx_rate: req.fx_rate,
            idr_amount,
            due_date: req.due_date,
            funding_duration_days: req.funding_duration_days,
            tranches: req.tranches,
            status: InvoiceStatus::Draft,
            grade: None,
            grade_suggestion: None,
            review_notes: None,
            rejection_reason: None,
            documents: req.documents,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn signals(&self) -> InvoiceSignals {
        InvoiceSignals {
            buyer_country: self.buyer.country.clone(),
            repeat_buyer: self.buyer.repeat_buyer,
        }
    }

    pub fn document_completeness(&self) -> DocumentCompleteness {
        let kinds: Vec<DocumentKind> = self.documents.iter().map(|d| d.kind).collect();
        DocumentCompleteness::from_kinds(&kinds)
    }

    fn advance(&self, event: InvoiceEvent) -> EngineResult<Invoice> {
        let status = transition(self.status, event)?;
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// draft → pending_review (등급 제안 첨부)
    pub fn submit(&self, suggestion: GradeSuggestion) -> EngineResult<Invoice> {
        // 상태 먼저, 그다음 입력 검증
        transition(self.status, InvoiceEvent::Submit)?;
        self.tranches.validate()?;

        let mut next = self.advance(InvoiceEvent::Submit)?;
        next.grade_suggestion = Some(suggestion);
        Ok(next)
    }

    /// pending_review → approved. 관리자 등급이 authoritative grade가 됨.
    pub fn approve(&self, grade: Grade, notes: Option<String>) -> EngineResult<Invoice> {
        let mut next = self.advance(InvoiceEvent::Approve)?;
        next.grade = Some(grade);
        next.review_notes = notes.filter(|n| !n.trim().is_empty());
        Ok(next)
    }

    /// pending_review → rejected (terminal)
    pub fn reject(&self, reason: &str) -> EngineResult<Invoice> {
        transition(self.status, InvoiceEvent::Reject)?;
        if reason.trim().is_empty() {
            return Err(EngineError::Validation("rejection reason is required".to_string()));
        }
        let mut next = self.advance(InvoiceEvent::Reject)?;
        next.rejection_reason = Some(reason.trim().to_string());
        Ok(next)
    }

    /// approved → tokenized (NFT 발행은 외부)
    pub fn tokenize(&self) -> EngineResult<Invoice> {
        self.advance(InvoiceEvent::Tokenize)
    }

    /// tokenized → funding
    pub fn start_funding(&self) -> EngineResult<Invoice> {
        self.advance(InvoiceEvent::StartFunding)
    }

    /// funding → funded (pool disbursed)
    pub fn mark_funded(&self) -> EngineResult<Invoice> {
        self.advance(InvoiceEvent::Disburse)
    }

    /// funded → repaid (waterfall 완료)
    pub fn mark_repaid(&self) -> EngineResult<Invoice> {
        self.advance(InvoiceEvent::Repay)
    }

    /// 승인된 등급의 funding limit
    pub fn funding_limit(&self) -> EngineResult<Bps> {
        self.grade
            .map(Grade::funding_limit)
            .ok_or_else(|| EngineError::InvalidState("invoice has no approved grade".to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::grading::{self, ExporterHistory};
    use chrono::Duration;

    pub(crate) fn sample_request() -> NewInvoice {
        NewInvoice {
            invoice_number: "INV-2024-001".to_string(),
            description: Some("Coffee beans".to_string()),
            buyer: Buyer {
                name: "Tokyo Trading Co".to_string(),
                country: "jp".to_string(),
                repeat_buyer: true,
            },
            original_amount: 100_000_000,
            original_currency: "IDR".to_string(),
            fx_rate: Decimal::ONE,
            due_date: Utc::now() + Duration::days(90),
            funding_duration_days: 90,
            tranches: TrancheConfig {
                priority_ratio_bps: 8_000,
                catalyst_ratio_bps: 2_000,
                priority_interest_bps: 1_000,
                catalyst_interest_bps: 1_800,
            },
            documents: vec![
                DocumentRef { kind: DocumentKind::Invoice, reference: "doc://inv".to_string() },
                DocumentRef { kind: DocumentKind::PurchaseOrder, reference: "doc://po".to_string() },
                DocumentRef { kind: DocumentKind::BillOfLading, reference: "doc://bl".to_string() },
            ],
        }
    }

    fn draft() -> Invoice {
        Invoice::create(UserId::new(), sample_request(), Utc::now()).unwrap()
    }

    fn suggestion(invoice: &Invoice) -> GradeSuggestion {
        grading::grade(&invoice.signals(), &ExporterHistory::default(), &invoice.document_completeness())
    }

    #[test]
    fn test_create_draft() {
        let invoice = draft();
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.idr_amount, Money::idr(100_000_000));
        assert_eq!(invoice.buyer.country, "JP");
        assert_eq!(invoice.grade, None);
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let mut req = sample_request();
        req.due_date = Utc::now() - Duration::days(1);
        assert!(matches!(Invoice::create(UserId::new(), req, Utc::now()), Err(EngineError::Validation(_))));

        let mut req = sample_request();
        req.funding_duration_days = 0;
        assert!(Invoice::create(UserId::new(), req, Utc::now()).is_err());

        let mut req = sample_request();
        req.original_currency = "ABC".to_string();
        assert!(Invoice::create(UserId::new(), req, Utc::now()).is_err());
    }

    #[test]
    fn test_full_happy_path() {
        let invoice = draft();
        let s = suggestion(&invoice);
        let invoice = invoice.submit(s).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::PendingReview);
        assert_eq!(invoice.grade_suggestion, Some(s));

        let invoice = invoice.approve(Grade::B, Some("override".to_string())).unwrap();
        assert_eq!(invoice.grade, Some(Grade::B));
        assert_eq!(invoice.funding_limit().unwrap(), Bps(8_000));

        let invoice = invoice.tokenize().unwrap().start_funding().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Funding);
        let invoice = invoice.mark_funded().unwrap().mark_repaid().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Repaid);
        assert!(invoice.status.is_terminal());
    }

    #[test]
    fn test_submit_validates_tranches() {
        let mut req = sample_request();
        req.tranches.catalyst_ratio_bps = 2_500;
        let invoice = Invoice::create(UserId::new(), req, Utc::now()).unwrap();
        let err = invoice.submit(suggestion(&invoice)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(invoice.status, InvoiceStatus::Draft);

        let mut req = sample_request();
        req.tranches.catalyst_interest_bps = -1;
        let invoice = Invoice::create(UserId::new(), req, Utc::now()).unwrap();
        assert!(matches!(invoice.submit(suggestion(&invoice)), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_no_skipping_states() {
        let invoice = draft();
        assert!(matches!(invoice.approve(Grade::A, None), Err(EngineError::InvalidState(_))));
        assert!(matches!(invoice.tokenize(), Err(EngineError::InvalidState(_))));
        assert!(matches!(invoice.mark_repaid(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_reject_twice_keeps_first_reason() {
        let invoice = draft();
        let invoice = invoice.submit(suggestion(&invoice)).unwrap();

        assert!(matches!(invoice.reject("  "), Err(EngineError::Validation(_))));

        let rejected = invoice.reject("missing bill of lading").unwrap();
        assert_eq!(rejected.status, InvoiceStatus::Rejected);

        let err = rejected.reject("second reason").unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(rejected.rejection_reason.as_deref(), Some("missing bill of lading"));
    }

    #[test]
    fn test_transition_table_terminal_states() {
        for event in [
            InvoiceEvent::Submit,
            InvoiceEvent::Approve,
            InvoiceEvent::Reject,
            InvoiceEvent::Tokenize,
            InvoiceEvent::StartFunding,
            InvoiceEvent::Disburse,
            InvoiceEvent::Repay,
        ] {
            assert!(transition(InvoiceStatus::Rejected, event).is_err());
            assert!(transition(InvoiceStatus::Repaid, event).is_err());
        }
    }

    #[test]
    fn test_status_names() {
        for status in [InvoiceStatus::PendingReview, InvoiceStatus::Funded] {
            assert_eq!(InvoiceStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
