use crate::models::answer::{ExtractedAnswer, ExtractionMethod};
use serde::{Deserialize, Serialize};

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RegionRefocus,
    NoiseFiltering,
    AlternativeMethod,
    ManualReview,
}

impl RecoveryStrategy {
    /// 优先级，数值越大越优先
    pub fn priority(&self) -> u8 {
        match self {
            RecoveryStrategy::RegionRefocus => 4,
            RecoveryStrategy::NoiseFiltering => 3,
            RecoveryStrategy::AlternativeMethod => 2,
            RecoveryStrategy::ManualReview => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RegionRefocus => "region_refocus",
            RecoveryStrategy::NoiseFiltering => "noise_filtering",
            RecoveryStrategy::AlternativeMethod => "alternative_method",
            RecoveryStrategy::ManualReview => "manual_review",
        }
    }
}

/// 单次尝试的参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryParameters {
    /// 从 0 开始的尝试序号
    pub attempt: usize,
    /// 噪声过滤强度
    pub noise_strength: f32,
    pub method: ExtractionMethod,
}

/// 一次恢复尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    pub parameters: RecoveryParameters,
    pub resulting_confidence: f32,
    pub accepted: bool,
}

/// 单题恢复结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub question_number: u32,
    pub strategy: RecoveryStrategy,
    /// 进入循环时的置信度（noise_filtering 已施加惩罚）
    pub initial_confidence: f32,
    pub attempts: Vec<RecoveryAttempt>,
    /// 目前最好的候选
    pub best: ExtractedAnswer,
    /// 是否有尝试被接受
    pub improved: bool,
    /// 问题是否已解决
    pub resolved: bool,
}

impl RecoveryOutcome {
    pub fn accepted_attempts(&self) -> impl Iterator<Item = &RecoveryAttempt> {
        self.attempts.iter().filter(|a| a.accepted)
    }
}
