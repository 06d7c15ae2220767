//! Grading Engine
//!
//! Invoice + exporter 신호로부터 등급(A/B/C), 점수, funding limit을 계산하는 순수 함수.
//!
//! # Scoring
//!
//! ```text
//! grade_score = (30 × country + 40 × history + 30 × documents) / 100
//!
//!   ≥ 80 → A (funding limit 90%)
//!   ≥ 50 → B (funding limit 80%)
//!   else → C (funding limit 65%)
//! ```
//!
//! 동일 입력 → 동일 출력 (admin 재심사, audit replay)

use serde::{Deserialize, Serialize};

use crate::types::Bps;

/// 가중치 (합 = 100)
pub const COUNTRY_WEIGHT: u32 = 30;
pub const HISTORY_WEIGHT: u32 = 40;
pub const DOCUMENT_WEIGHT: u32 = 30;

pub const GRADE_A_MIN_SCORE: u32 = 80;
pub const GRADE_B_MIN_SCORE: u32 = 50;

/// 필수 서류 (존재 여부만 확인, 내용은 보지 않음)
pub const REQUIRED_DOCUMENTS: [DocumentKind; 3] = [
    DocumentKind::Invoice,
    DocumentKind::PurchaseOrder,
    DocumentKind::BillOfLading,
];

/// Invoice 등급
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
}

impl Grade {
    /// 등급별 funding limit (invoice 가치 대비 모집 가능 비율)
    pub fn funding_limit(self) -> Bps {
        match self {
            Grade::A => Bps(9_000),
            Grade::B => Bps(8_000),
            Grade::C => Bps(6_500),
        }
    }

    pub fn from_score(score: u32) -> Self {
        if score >= GRADE_A_MIN_SCORE {
            Grade::A
        } else if score >= GRADE_B_MIN_SCORE {
            Grade::B
        } else {
            Grade::C
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" | "a" => Some(Grade::A),
            "B" | "b" => Some(Grade::B),
            "C" | "c" => Some(Grade::C),
            _ => None,
        }
    }
}

/// 서류 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    PurchaseOrder,
    BillOfLading,
    Other,
}

/// 국가 위험도
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountryRisk {
    Low,
    Medium,
    High,
}

impl CountryRisk {
    pub fn score(self) -> u32 {
        match self {
            CountryRisk::Low => 100,
            CountryRisk::Medium => 60,
            CountryRisk::High => 25,
        }
    }
}

/// 정적 국가 위험 테이블 (ISO 3166-1 alpha-2)
const COUNTRY_RISK_TABLE: &[(&str, CountryRisk)] = &[
    ("US", CountryRisk::Low),
    ("JP", CountryRisk::Low),
    ("SG", CountryRisk::Low),
    ("DE", CountryRisk::Low),
    ("NL", CountryRisk::Low),
    ("GB", CountryRisk::Low),
    ("AU", CountryRisk::Low),
    ("KR", CountryRisk::Low),
    ("FR", CountryRisk::Low),
    ("CA", CountryRisk::Low),
    ("CN", CountryRisk::Medium),
    ("MY", CountryRisk::Medium),
    ("TH", CountryRisk::Medium),
    ("IN", CountryRisk::Medium),
    ("AE", CountryRisk::Medium),
    ("SA", CountryRisk::Medium),
    ("VN", CountryRisk::Medium),
    ("PH", CountryRisk::Medium),
    ("ID", CountryRisk::Medium),
    ("BR", CountryRisk::Medium),
    ("TR", CountryRisk::High),
    ("EG", CountryRisk::High),
    ("NG", CountryRisk::High),
    ("PK", CountryRisk::High),
    ("BD", CountryRisk::High),
];

/// 테이블에 없는 국가는 High로 취급
pub fn country_risk(country: &str) -> CountryRisk {
    let code = country.trim().to_ascii_uppercase();
    COUNTRY_RISK_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, risk)| *risk)
        .unwrap_or(CountryRisk::High)
}

/// Invoice 자체 신호
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSignals {
    pub buyer_country: String,
    pub repeat_buyer: bool,
}

/// Exporter 상환 이력
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterHistory {
    /// 전액 상환된 invoice 수
    pub repaid_in_full: u32,
    /// 상환 부족(shortfall)으로 정산된 invoice 수
    pub defaulted: u32,
}

/// 서류 완결성
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCompleteness {
    pub required: u32,
    pub present: u32,
}

impl DocumentCompleteness {
    /// 첨부 서류 목록에서 필수 서류 존재 여부를 센다
    pub fn from_kinds(kinds: &[DocumentKind]) -> Self {
        let present = REQUIRED_DOCUMENTS
            .iter()
            .filter(|required| kinds.contains(required))
            .count() as u32;
        Self {
            required: REQUIRED_DOCUMENTS.len() as u32,
            present,
        }
    }
}

/// 등급 제안 (파생 값, source of truth 아님)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeSuggestion {
    pub country_score: u32,
    pub history_score: u32,
    pub document_score: u32,
    pub grade_score: u32,
    pub suggested_grade: Grade,
    pub funding_limit: Bps,
}

/// 등급 계산
pub fn grade(
    signals: &InvoiceSignals,
    history: &ExporterHistory,
    documents: &DocumentCompleteness,
) -> GradeSuggestion {
    let country_score = country_risk(&signals.buyer_country).score();
    let history_score = history_score(signals.repeat_buyer, history);
    let document_score = document_score(documents);

    let grade_score = (COUNTRY_WEIGHT * country_score
        + HISTORY_WEIGHT * history_score
        + DOCUMENT_WEIGHT * document_score)
        / 100;

    let suggested_grade = Grade::from_score(grade_score);

    GradeSuggestion {
        country_score,
        history_score,
        document_score,
        grade_score,
        suggested_grade,
        funding_limit: suggested_grade.funding_limit(),
    }
}

fn history_score(repeat_buyer: bool, history: &ExporterHistory) -> u32 {
    let buyer_part = if repeat_buyer { 40 } else { 10 };
    let settled = history.repaid_in_full as u64 + history.defaulted as u64;
    let record_part = if settled == 0 {
        // 신규 exporter
        20
    } else {
        (60 * history.repaid_in_full as u64 / settled) as u32
    };
    (buyer_part + record_part).min(100)
}

fn document_score(documents: &DocumentCompleteness) -> u32 {
    if documents.required == 0 {
        return 100;
    }
    let present = documents.present.min(documents.required);
    100 * present / documents.required
}
