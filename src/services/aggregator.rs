//! 结果聚合器
//!
//! 唯一的写入者：把路由合并后的答案与恢复结果合成最终记录和处理摘要。

use crate::models::answer::ExtractedAnswer;
use crate::models::geometry::clamp_unit;
use crate::models::output::{FinalAnswerRecord, ProcessingSummary, MANUAL_REVIEW};
use crate::models::recovery::RecoveryOutcome;
use crate::models::routing::RoutingPlan;
use crate::models::template::{DocumentFormat, TemplateMatch};
use crate::services::validation::ValidationEngine;
use std::collections::BTreeMap;

/// 聚合所需的阶段结果
pub struct AggregationInput<'a> {
    /// 路由合并后的答案
    pub answers: &'a [ExtractedAnswer],
    pub recovery: &'a [RecoveryOutcome],
    pub template: &'a TemplateMatch,
    /// 实际使用版面的格式
    pub format: DocumentFormat,
    pub plan: &'a RoutingPlan,
    /// 路由阶段的升级次数
    pub tier_fallbacks: usize,
    /// 升级与应急调用产生的额外成本
    pub extra_cost: f64,
    pub elapsed_ms: u64,
}

/// 结果聚合器
pub struct ResultAggregator<'a> {
    engine: &'a ValidationEngine,
}

impl<'a> ResultAggregator<'a> {
    pub fn new(engine: &'a ValidationEngine) -> Self {
        Self { engine }
    }

    /// 生成按题号排序的最终记录与摘要
    ///
    /// # 返回
    /// (最终记录, 摘要, 最终答案)
    pub fn aggregate(&self, input: AggregationInput<'_>) -> (Vec<FinalAnswerRecord>, ProcessingSummary, Vec<ExtractedAnswer>) {
        let outcomes: BTreeMap<u32, &RecoveryOutcome> =
            input.recovery.iter().map(|o| (o.question_number, o)).collect();

        let mut ordered: Vec<&ExtractedAnswer> = input.answers.iter().collect();
        ordered.sort_by_key(|a| a.question_number);

        let mut records = Vec::with_capacity(ordered.len());
        let mut finals = Vec::with_capacity(ordered.len());
        let mut methods_used: Vec<String> = Vec::new();

        for answer in ordered {
            let outcome = outcomes.get(&answer.question_number).copied();
            let final_answer = outcome.map_or(answer, |o| &o.best);
            let chain = provenance_chain(answer, outcome);

            for step in chain.iter().filter(|s| !s.starts_with("recovered") && *s != MANUAL_REVIEW) {
                if !methods_used.contains(step) {
                    methods_used.push(step.clone());
                }
            }
            if let Some(o) = outcome {
                for attempt in &o.attempts {
                    let method = attempt.parameters.method.as_str().to_string();
                    if !methods_used.contains(&method) {
                        methods_used.push(method);
                    }
                }
            }

            records.push(FinalAnswerRecord {
                question_number: answer.question_number,
                value: if final_answer.multiple_marks {
                    None
                } else {
                    final_answer.value.clone()
                },
                confidence: clamp_unit(final_answer.confidence),
                validation_passed: self.engine.question_passed(final_answer),
                provenance_chain: chain,
            });
            finals.push(final_answer.clone());
        }

        let final_report = self.engine.validate(&finals);
        let mean_confidence = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.confidence).sum::<f32>() / records.len() as f32
        };
        let template_confidence = if input.template.is_matched() {
            input.template.confidence
        } else {
            0.0
        };
        let quality_score = clamp_unit((mean_confidence + template_confidence + final_report.pass_rate()) / 3.0);

        let estimated_cost = input.plan.total_cost + input.extra_cost;
        let recovery_runs = input.recovery.iter().filter(|o| !o.attempts.is_empty()).count();
        let summary = ProcessingSummary {
            template_id: input.template.template_id.clone(),
            template_match_confidence: input.template.confidence,
            format: input.format,
            methods_used,
            fallbacks_triggered: input.tier_fallbacks + recovery_runs,
            quality_score,
            total_processing_time_ms: input.elapsed_ms,
            estimated_cost,
            cost_savings: input.plan.baseline_cost - estimated_cost,
            recovery_attempts: input.recovery.iter().map(|o| o.attempts.len()).sum(),
            manual_review_count: records.iter().filter(|r| r.needs_manual_review()).count(),
        };

        (records, summary, finals)
    }
}

/// 溯源链：初始方法 → 手写过滤 → 层级 → 恢复结果
fn provenance_chain(answer: &ExtractedAnswer, outcome: Option<&RecoveryOutcome>) -> Vec<String> {
    let mut chain = vec![answer.extraction_method.as_str().to_string()];
    if answer.noise_filtered || outcome.map_or(false, |o| o.improved && o.best.noise_filtered) {
        chain.push("handwriting_filtered".to_string());
    }
    if let Some(tier) = answer.tier {
        chain.push(tier.as_str().to_string());
    }
    if let Some(outcome) = outcome {
        if !outcome.resolved {
            chain.push(MANUAL_REVIEW.to_string());
        } else if outcome.improved {
            chain.push(format!("recovered:{}", outcome.strategy.as_str()));
        }
    }
    chain
}
