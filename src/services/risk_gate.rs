//! Risk Tier Gate
//!
//! 투자자 위험 성향 설문 → catalyst(후순위) tranche 투자 자격.
//!
//! 설문은 5문항, 각 문항은 0..=3 선택지 (선택지 번호 = 점수).
//! 총점 10점 이상이면 `catalyst_unlocked = true`.
//! `selected_tier`는 투자자의 희망만 기록하고, 자격은 점수로만 결정된다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{Tranche, UserId};

pub const QUESTION_COUNT: usize = 5;
pub const MAX_OPTION: u8 = 3;
pub const CATALYST_PASS_SCORE: u32 = 10;

/// 투자자 위험 프로필
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub investor: UserId,
    pub completed: bool,
    pub selected_tier: Tranche,
    pub catalyst_unlocked: bool,
    pub score: u32,
    pub submitted_at: DateTime<Utc>,
}

impl RiskProfile {
    /// 설문 미제출 투자자 (priority만 허용)
    pub fn not_completed(investor: UserId) -> Self {
        Self {
            investor,
            completed: false,
            selected_tier: Tranche::Priority,
            catalyst_unlocked: false,
            score: 0,
            submitted_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// 해당 tranche에 투자 가능한지
    pub fn permits(&self, tranche: Tranche) -> bool {
        match tranche {
            Tranche::Priority => true,
            Tranche::Catalyst => self.completed && self.catalyst_unlocked,
        }
    }
}

/// 설문 채점 (결정적)
pub fn score_answers(answers: &[u8]) -> EngineResult<u32> {
    if answers.len() != QUESTION_COUNT {
        return Err(EngineError::Validation(format!(
            "questionnaire requires {} answers, got {}",
            QUESTION_COUNT,
            answers.len()
        )));
    }
    if let Some(bad) = answers.iter().find(|a| **a > MAX_OPTION) {
        return Err(EngineError::Validation(format!("answer option {} out of range", bad)));
    }
    Ok(answers.iter().map(|a| *a as u32).sum())
}

/// 설문 제출 → 새 프로필 (재응시 시 덮어씀)
pub fn evaluate(
    investor: UserId,
    answers: &[u8],
    selected_tier: Tranche,
    now: DateTime<Utc>,
) -> EngineResult<RiskProfile> {
    let score = score_answers(answers)?;
    Ok(RiskProfile {
        investor,
        completed: true,
        selected_tier,
        catalyst_unlocked: score >= CATALYST_PASS_SCORE,
        score,
        submitted_at: now,
    })
}
