use crate::models::answer::ExtractedAnswer;
use crate::models::mark::ClassifiedMark;
use crate::models::recovery::RecoveryOutcome;
use crate::models::routing::{ComplexityScore, FallbackEvent, RoutingPlan};
use crate::models::template::DocumentFormat;
use crate::models::validation::ValidationReport;
use serde::{Deserialize, Serialize};

/// 溯源链中的人工复核标记
pub const MANUAL_REVIEW: &str = "manual_review";

/// 单题最终结果，聚合器输出后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswerRecord {
    pub question_number: u32,
    pub value: Option<String>,
    pub confidence: f32,
    pub validation_passed: bool,
    pub provenance_chain: Vec<String>,
}

impl FinalAnswerRecord {
    /// 溯源链文本，如 `template_aware→handwriting_filtered→recovered`
    pub fn provenance(&self) -> String {
        self.provenance_chain.join("→")
    }

    pub fn needs_manual_review(&self) -> bool {
        self.provenance_chain.iter().any(|p| p == MANUAL_REVIEW)
    }

    /// 交给下游评分的四元组
    pub fn grading_tuple(&self) -> (u32, Option<&str>, f32, bool) {
        (
            self.question_number,
            self.value.as_deref(),
            self.confidence,
            self.validation_passed,
        )
    }
}

/// 文档处理摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub template_id: Option<String>,
    pub template_match_confidence: f32,
    pub format: DocumentFormat,
    pub methods_used: Vec<String>,
    pub fallbacks_triggered: usize,
    pub quality_score: f32,
    pub total_processing_time_ms: u64,
    pub estimated_cost: f64,
    pub cost_savings: f64,
    pub recovery_attempts: usize,
    pub manual_review_count: usize,
}

/// 各阶段的中间结果，用于调试与报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    pub classified_marks: Vec<ClassifiedMark>,
    pub initial_answers: Vec<ExtractedAnswer>,
    pub complexity: Vec<ComplexityScore>,
    pub routing: RoutingPlan,
    pub fallback_events: Vec<FallbackEvent>,
    pub validation: ValidationReport,
    pub recovery: Vec<RecoveryOutcome>,
}

/// 流水线输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub records: Vec<FinalAnswerRecord>,
    pub summary: ProcessingSummary,
    pub diagnostics: PipelineDiagnostics,
}

impl PipelineOutput {
    pub fn record(&self, question_number: u32) -> Option<&FinalAnswerRecord> {
        self.records.iter().find(|r| r.question_number == question_number)
    }
}
