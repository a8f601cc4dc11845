//! 恢复控制器
//!
//! 对校验失败或低置信度的题目做有上限的重试。同一题的尝试严格串行，
//! 不同题目之间并发。最好结果只增不减，用尽次数仍未解决的题目交给人工复核。

use crate::config::PipelineConfig;
use crate::models::answer::{ExtractedAnswer, ExtractionMethod};
use crate::models::recovery::{RecoveryAttempt, RecoveryOutcome, RecoveryParameters, RecoveryStrategy};
use crate::models::validation::{FindingKind, ValidationReport};
use crate::services::validation::{ValidationEngine, INTERFERENCE_CONFIDENCE};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 按参数重新提取单道题
#[async_trait]
pub trait Reprocessor: Send + Sync {
    async fn reprocess(
        &self,
        current: &ExtractedAnswer,
        strategy: RecoveryStrategy,
        params: &RecoveryParameters,
    ) -> ExtractedAnswer;
}

/// 恢复参数
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySettings {
    pub max_retries: usize,
    pub noise_filtering_increment: f32,
    pub fallback_methods: Vec<ExtractionMethod>,
    pub acceptance_confidence: f32,
    pub exclusion_penalty: f32,
}

impl From<&PipelineConfig> for RecoverySettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            noise_filtering_increment: config.noise_filtering_increment,
            fallback_methods: config.fallback_methods.clone(),
            acceptance_confidence: config.acceptance_confidence,
            exclusion_penalty: config.roi_exclusion_penalty,
        }
    }
}

/// 恢复控制器
#[derive(Debug, Clone)]
pub struct RecoveryController {
    settings: RecoverySettings,
}

impl RecoveryController {
    pub fn new(settings: RecoverySettings) -> Self {
        Self { settings }
    }

    /// 为每道受影响的题目选择策略（取失败类别中优先级最高的）
    pub fn select_targets(
        &self,
        report: &ValidationReport,
        answers: &[ExtractedAnswer],
        engine: &ValidationEngine,
    ) -> BTreeMap<u32, RecoveryStrategy> {
        let mut targets: BTreeMap<u32, RecoveryStrategy> = BTreeMap::new();
        let mut propose = |q: u32, strategy: RecoveryStrategy| {
            let entry = targets.entry(q).or_insert(strategy);
            if strategy.priority() > entry.priority() {
                *entry = strategy;
            }
        };

        for finding in report.findings.iter().filter(|f| !f.passed) {
            let Some(q) = finding.question_number else {
                continue;
            };
            match finding.kind {
                FindingKind::Impossibility => propose(q, RecoveryStrategy::RegionRefocus),
                FindingKind::Geometric if finding.correction_suggested || finding.fallback_required => {
                    propose(q, RecoveryStrategy::AlternativeMethod)
                }
                _ => {}
            }
        }

        let interference_failed = report.document_failed(FindingKind::Interference);
        let pattern_failed = report.document_failed(FindingKind::Pattern);
        for answer in answers {
            if interference_failed && engine.is_interfered(answer) {
                propose(answer.question_number, RecoveryStrategy::NoiseFiltering);
            }
            if pattern_failed && engine.is_pattern_anomaly(answer) {
                propose(answer.question_number, RecoveryStrategy::ManualReview);
            }
        }
        targets
    }

    /// 对全部目标执行恢复，题目之间并发
    pub async fn recover(
        &self,
        targets: &BTreeMap<u32, RecoveryStrategy>,
        answers: &[ExtractedAnswer],
        engine: &ValidationEngine,
        reprocessor: &dyn Reprocessor,
    ) -> Vec<RecoveryOutcome> {
        let tasks = answers
            .iter()
            .filter_map(|a| targets.get(&a.question_number).map(|s| (a, *s)))
            .map(|(answer, strategy)| self.recover_question(answer, strategy, engine, reprocessor));
        join_all(tasks).await
    }

    /// 单题恢复循环
    pub async fn recover_question(
        &self,
        answer: &ExtractedAnswer,
        strategy: RecoveryStrategy,
        engine: &ValidationEngine,
        reprocessor: &dyn Reprocessor,
    ) -> RecoveryOutcome {
        let q = answer.question_number;
        let mut best = answer.clone();
        if strategy == RecoveryStrategy::NoiseFiltering {
            best.set_confidence(best.confidence * self.settings.exclusion_penalty);
        }
        let initial_confidence = best.confidence;
        let mut attempts: Vec<RecoveryAttempt> = Vec::new();

        if strategy != RecoveryStrategy::ManualReview {
            for attempt in 0..self.settings.max_retries {
                let params = RecoveryParameters {
                    attempt,
                    noise_strength: self.settings.noise_filtering_increment * (attempt + 1) as f32,
                    method: self.method_for(attempt, &attempts, &best),
                };
                let candidate = reprocessor.reprocess(&best, strategy, &params).await;

                let single = !candidate.multiple_marks;
                let accepted = candidate.confidence > best.confidence
                    && (strategy != RecoveryStrategy::RegionRefocus || single);
                debug!(
                    "[题 {}] 恢复尝试 {} ({} / {}) → {:.2} {}",
                    q,
                    attempt + 1,
                    strategy.as_str(),
                    params.method.as_str(),
                    candidate.confidence,
                    if accepted { "接受" } else { "拒绝" }
                );
                attempts.push(RecoveryAttempt {
                    strategy,
                    parameters: params,
                    resulting_confidence: candidate.confidence,
                    accepted,
                });
                if accepted {
                    best = candidate;
                }
                if best.confidence >= self.settings.acceptance_confidence && is_resolved(&best, engine) {
                    break;
                }
            }
        }

        let improved = attempts.iter().any(|a| a.accepted);
        let resolved = strategy != RecoveryStrategy::ManualReview && is_resolved(&best, engine);
        if !resolved {
            info!("[题 {}] ⚠️ {} 后仍未解决，转人工复核", q, strategy.as_str());
        }

        RecoveryOutcome {
            question_number: q,
            strategy,
            initial_confidence,
            attempts,
            best,
            improved,
            resolved,
        }
    }

    /// 轮换方法；expensive 层级只在已有尝试记录之后使用，且不用于多选题
    fn method_for(&self, attempt: usize, attempts: &[RecoveryAttempt], best: &ExtractedAnswer) -> ExtractionMethod {
        let methods = &self.settings.fallback_methods;
        if methods.is_empty() {
            return ExtractionMethod::TemplateAware;
        }
        let method = methods[attempt % methods.len()];
        if method == ExtractionMethod::ExpensiveTier && (attempts.is_empty() || best.multiple_marks) {
            return methods
                .iter()
                .copied()
                .find(|m| *m != ExtractionMethod::ExpensiveTier)
                .unwrap_or(ExtractionMethod::TemplateAware);
        }
        method
    }
}

/// 单题是否已经解决：单题校验通过且不再受干扰
fn is_resolved(answer: &ExtractedAnswer, engine: &ValidationEngine) -> bool {
    !answer.multiple_marks && answer.confidence >= INTERFERENCE_CONFIDENCE && engine.question_passed(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::answer::{BubbleQuality, QuestionType};
    use crate::services::validation::ValidationSettings;
    use std::sync::Mutex;

    /// 每次返回预设序列中的下一个置信度
    struct Scripted {
        confidences: Mutex<Vec<f32>>,
        multiple: bool,
    }

    #[async_trait]
    impl Reprocessor for Scripted {
        async fn reprocess(
            &self,
            current: &ExtractedAnswer,
            _strategy: RecoveryStrategy,
            _params: &RecoveryParameters,
        ) -> ExtractedAnswer {
            let next = self.confidences.lock().unwrap().remove(0);
            let mut candidate = current.clone().with_confidence(next);
            candidate.multiple_marks = self.multiple;
            if !self.multiple {
                candidate.value = Some("B".to_string());
                candidate.marks.clear();
            }
            candidate
        }
    }

    fn engine() -> ValidationEngine {
        ValidationEngine::new(
            ValidationSettings::from(&PipelineConfig::default()),
            crate::models::template::default_valid_answers(),
        )
    }

    fn controller(max_retries: usize) -> RecoveryController {
        let config = PipelineConfig {
            max_retries,
            ..Default::default()
        };
        RecoveryController::new(RecoverySettings::from(&config))
    }

    fn answer(confidence: f32) -> ExtractedAnswer {
        let mut a = ExtractedAnswer::empty(4, QuestionType::MultipleChoice, ExtractionMethod::TemplateAware)
            .with_confidence(confidence);
        a.value = Some("B".to_string());
        a.bubble_quality = BubbleQuality::Medium;
        a
    }

    #[tokio::test]
    async fn best_confidence_never_decreases() {
        let reprocessor = Scripted {
            confidences: Mutex::new(vec![0.6, 0.4, 0.7, 0.65]),
            multiple: false,
        };
        let outcome = controller(4)
            .recover_question(&answer(0.5), RecoveryStrategy::AlternativeMethod, &engine(), &reprocessor)
            .await;

        assert_eq!(outcome.attempts.len(), 4);
        let accepted: Vec<f32> = outcome.accepted_attempts().map(|a| a.resulting_confidence).collect();
        assert_eq!(accepted, vec![0.6, 0.7]);
        assert!(accepted.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(outcome.best.confidence, 0.7);
    }

    #[tokio::test]
    async fn stops_early_at_acceptance() {
        let reprocessor = Scripted {
            confidences: Mutex::new(vec![0.9, 0.95]),
            multiple: false,
        };
        let outcome = controller(2)
            .recover_question(&answer(0.5), RecoveryStrategy::AlternativeMethod, &engine(), &reprocessor)
            .await;
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.resolved);
    }

    #[tokio::test]
    async fn unresolved_multi_mark_exhausts_budget() {
        let reprocessor = Scripted {
            confidences: Mutex::new(vec![0.9, 0.9]),
            multiple: true,
        };
        let mut start = answer(0.45);
        start.value = None;
        start.multiple_marks = true;
        let outcome = controller(2)
            .recover_question(&start, RecoveryStrategy::RegionRefocus, &engine(), &reprocessor)
            .await;

        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts.iter().all(|a| !a.accepted));
        assert!(!outcome.resolved);
        assert!(outcome.best.value.is_none());
        assert!(outcome
            .attempts
            .iter()
            .all(|a| a.parameters.method != ExtractionMethod::ExpensiveTier));
    }

    #[tokio::test]
    async fn noise_filtering_applies_penalty_first() {
        let reprocessor = Scripted {
            confidences: Mutex::new(vec![0.3]),
            multiple: false,
        };
        let outcome = controller(1)
            .recover_question(&answer(0.6), RecoveryStrategy::NoiseFiltering, &engine(), &reprocessor)
            .await;
        assert!((outcome.initial_confidence - 0.42).abs() < 1e-6);
        assert!(!outcome.improved);
        assert!((outcome.best.confidence - 0.42).abs() < 1e-6);
    }

    #[tokio::test]
    async fn manual_review_makes_no_attempts() {
        let reprocessor = Scripted {
            confidences: Mutex::new(Vec::new()),
            multiple: false,
        };
        let outcome = controller(2)
            .recover_question(&answer(0.9), RecoveryStrategy::ManualReview, &engine(), &reprocessor)
            .await;
        assert!(outcome.attempts.is_empty());
        assert!(!outcome.resolved);
    }

    #[test]
    fn expensive_tier_waits_for_a_recorded_attempt() {
        let config = PipelineConfig {
            fallback_methods: vec![ExtractionMethod::ExpensiveTier, ExtractionMethod::OffsetCorrected],
            ..Default::default()
        };
        let controller = RecoveryController::new(RecoverySettings::from(&config));
        let best = answer(0.5);
        assert_eq!(controller.method_for(0, &[], &best), ExtractionMethod::OffsetCorrected);

        let recorded = RecoveryAttempt {
            strategy: RecoveryStrategy::AlternativeMethod,
            parameters: RecoveryParameters {
                attempt: 0,
                noise_strength: 0.1,
                method: ExtractionMethod::OffsetCorrected,
            },
            resulting_confidence: 0.4,
            accepted: false,
        };
        assert_eq!(controller.method_for(2, &[recorded], &best), ExtractionMethod::ExpensiveTier);
    }

    #[test]
    fn strategy_priority_picks_region_refocus() {
        let engine = engine();
        let mut multi = answer(0.3);
        multi.value = None;
        multi.multiple_marks = true;
        multi.handwriting_overlap = true;
        let mut faint = answer(0.2);
        faint.question_number = 5;
        let mut clean = answer(0.95);
        clean.question_number = 6;
        let answers = vec![multi, faint, clean];
        let report = engine.validate(&answers);
        let targets = controller(2).select_targets(&report, &answers, &engine);

        assert_eq!(targets.get(&4), Some(&RecoveryStrategy::RegionRefocus));
        assert_eq!(targets.get(&5), Some(&RecoveryStrategy::RegionRefocus));
        assert!(!targets.contains_key(&6));
    }
}
