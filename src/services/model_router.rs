//! 批次路由服务
//!
//! ## 职责
//!
//! 1. **分批**：按推荐层级分组，每批不超过 `max_batch_size`
//! 2. **成本**：按工作量估算每批成本和相对全 expensive 的节省
//! 3. **执行**：Semaphore 限制并发，整体受批次超时约束
//! 4. **升级**：cheap 层级失败、缺题或低置信度时升级到 expensive
//! 5. **合并**：按置信度取优，多选题永远不由层级补值

use crate::clients::tier_backend::{TierAnswer, TierBackend, TierItem, TierRequest, TierResponse};
use crate::config::PipelineConfig;
use crate::error::TierError;
use crate::models::answer::{ExtractedAnswer, ExtractionMethod, QuestionType};
use crate::models::routing::{
    ComplexityScore, FallbackEvent, FallbackReason, ProcessingTier, RoutingPlan, TierBatch,
};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// 每种题型的工作量
pub fn work_units(question_type: QuestionType) -> f64 {
    match question_type {
        QuestionType::MultipleChoice => 1.0,
        QuestionType::Text => 2.0,
        QuestionType::Essay => 3.0,
        QuestionType::Unknown => 2.0,
    }
}

/// 路由参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterSettings {
    pub max_batch_size: usize,
    pub cheap_unit_cost: f64,
    pub expensive_unit_cost: f64,
    pub fallback_confidence_threshold: f32,
    pub fallback_min_complexity: f32,
    pub batch_timeout: Duration,
}

impl From<&PipelineConfig> for RouterSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            cheap_unit_cost: config.cheap_unit_cost,
            expensive_unit_cost: config.expensive_unit_cost,
            fallback_confidence_threshold: config.fallback_confidence_threshold,
            fallback_min_complexity: config.fallback_min_complexity,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
        }
    }
}

/// 某个层级给出的单题结果
#[derive(Debug, Clone, PartialEq)]
pub struct TierResult {
    pub tier: ProcessingTier,
    pub answer: TierAnswer,
}

/// 执行结果
#[derive(Debug, Clone, Default)]
pub struct RoutingOutcome {
    pub results: BTreeMap<u32, Vec<TierResult>>,
    /// 经过的最高层级
    pub processed_by: BTreeMap<u32, ProcessingTier>,
    /// expensive 层级也没有给出结果的题目
    pub failed: BTreeSet<u32>,
    pub fallback_events: Vec<FallbackEvent>,
    /// 升级与应急调用产生的额外成本
    pub extra_cost: f64,
}

impl RoutingOutcome {
    fn touch(&mut self, question_number: u32, tier: ProcessingTier) {
        let entry = self.processed_by.entry(question_number).or_insert(tier);
        *entry = (*entry).max(tier);
    }

    fn push_result(&mut self, tier: ProcessingTier, answer: &TierAnswer) {
        self.touch(answer.question_number, tier);
        self.results.entry(answer.question_number).or_default().push(TierResult {
            tier,
            answer: answer.clone(),
        });
    }

    fn record_fallback(&mut self, question_number: u32, from: ProcessingTier, reason: FallbackReason) {
        self.fallback_events.push(FallbackEvent {
            question_number,
            from,
            to: ProcessingTier::Expensive,
            reason,
        });
    }

    pub fn fallback_count(&self) -> usize {
        self.fallback_events.len()
    }
}

/// 批次路由器
pub struct ModelRouter {
    settings: RouterSettings,
    cheap: Arc<dyn TierBackend>,
    expensive: Arc<dyn TierBackend>,
}

impl ModelRouter {
    pub fn new(settings: RouterSettings, cheap: Arc<dyn TierBackend>, expensive: Arc<dyn TierBackend>) -> Self {
        Self {
            settings,
            cheap,
            expensive,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn backend(&self, tier: ProcessingTier) -> &Arc<dyn TierBackend> {
        match tier {
            ProcessingTier::Cheap => &self.cheap,
            ProcessingTier::Expensive => &self.expensive,
        }
    }

    fn unit_cost(&self, tier: ProcessingTier) -> f64 {
        match tier {
            ProcessingTier::Cheap => self.settings.cheap_unit_cost,
            ProcessingTier::Expensive => self.settings.expensive_unit_cost,
        }
    }

    /// 分批规划
    ///
    /// cheap 在前，批内保持题号顺序；每道题恰好出现在一个批次中。
    pub fn plan(&self, answers: &[ExtractedAnswer], scores: &[ComplexityScore]) -> RoutingPlan {
        let types: BTreeMap<u32, QuestionType> = answers
            .iter()
            .map(|a| (a.question_number, a.question_type))
            .collect();
        let units_of = |q: &u32| work_units(types.get(q).copied().unwrap_or(QuestionType::Unknown));

        let mut plan = RoutingPlan::default();
        for tier in [ProcessingTier::Cheap, ProcessingTier::Expensive] {
            let mut questions: Vec<u32> = scores
                .iter()
                .filter(|s| s.recommended_tier == tier)
                .map(|s| s.question_number)
                .collect();
            questions.sort_unstable();
            questions.dedup();

            for chunk in questions.chunks(self.settings.max_batch_size.max(1)) {
                let work_units: f64 = chunk.iter().map(units_of).sum();
                let estimated_cost = self.unit_cost(tier) * work_units;
                let baseline = self.settings.expensive_unit_cost * work_units;
                plan.total_cost += estimated_cost;
                plan.baseline_cost += baseline;
                plan.batches.push(TierBatch {
                    batch_id: plan.batches.len(),
                    tier,
                    questions: chunk.to_vec(),
                    work_units,
                    estimated_cost,
                    cost_savings: baseline - estimated_cost,
                });
            }
        }
        plan
    }

    /// 执行规划
    ///
    /// # 参数
    /// - `plan`: 分批规划
    /// - `items`: 题号 → 发给层级的题目
    /// - `scores`: 复杂度评分（用于低置信度升级判断）
    pub async fn execute(
        &self,
        plan: &RoutingPlan,
        items: &BTreeMap<u32, TierItem>,
        scores: &[ComplexityScore],
    ) -> RoutingOutcome {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_batch_size.max(1)));
        let deadline = tokio::time::Instant::now() + self.settings.batch_timeout;

        let mut pending: FuturesUnordered<_> = plan
            .batches
            .iter()
            .map(|batch| {
                let semaphore = Arc::clone(&semaphore);
                let backend = Arc::clone(self.backend(batch.tier));
                let request = build_request(batch.batch_id, batch.tier, &batch.questions, items);
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => backend.process(&request).await,
                        Err(e) => Err(TierError::request_failed(batch.tier.as_str(), e)),
                    };
                    (batch.batch_id, result)
                }
            })
            .collect();

        let mut completed: BTreeMap<usize, Result<TierResponse, TierError>> = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((batch_id, result))) => {
                    completed.insert(batch_id, result);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "⏱️ 批次超时 ({} ms)，{} 个批次未完成，转入逐题应急处理",
                        self.settings.batch_timeout.as_millis(),
                        plan.batches.len() - completed.len()
                    );
                    break;
                }
            }
        }
        // 丢弃未完成的调用
        drop(pending);

        let complexity: BTreeMap<u32, f32> = scores.iter().map(|s| (s.question_number, s.score)).collect();
        let mut outcome = RoutingOutcome::default();
        let mut escalate: Vec<u32> = Vec::new();
        let mut emergency: Vec<u32> = Vec::new();

        for batch in &plan.batches {
            match completed.remove(&batch.batch_id) {
                None => {
                    for q in &batch.questions {
                        outcome.touch(*q, batch.tier);
                        outcome.record_fallback(*q, batch.tier, FallbackReason::BatchTimeout);
                        emergency.push(*q);
                    }
                }
                Some(Err(e)) => {
                    warn!("批次 {} ({}) 调用失败: {}", batch.batch_id, batch.tier, e);
                    for q in &batch.questions {
                        outcome.touch(*q, batch.tier);
                        match batch.tier {
                            ProcessingTier::Cheap => {
                                outcome.record_fallback(*q, batch.tier, FallbackReason::CallFailed);
                                escalate.push(*q);
                            }
                            ProcessingTier::Expensive => {
                                outcome.failed.insert(*q);
                            }
                        }
                    }
                }
                Some(Ok(response)) => {
                    for q in &batch.questions {
                        outcome.touch(*q, batch.tier);
                        let Some(answer) = response.answer(*q) else {
                            match batch.tier {
                                ProcessingTier::Cheap => {
                                    outcome.record_fallback(*q, batch.tier, FallbackReason::IncompleteResult);
                                    escalate.push(*q);
                                }
                                ProcessingTier::Expensive => {
                                    outcome.failed.insert(*q);
                                }
                            }
                            continue;
                        };
                        outcome.push_result(batch.tier, answer);

                        let score = complexity.get(q).copied().unwrap_or(0.0);
                        if batch.tier == ProcessingTier::Cheap
                            && answer.confidence < self.settings.fallback_confidence_threshold
                            && score > self.settings.fallback_min_complexity
                        {
                            outcome.record_fallback(*q, batch.tier, FallbackReason::LowConfidence);
                            escalate.push(*q);
                        }
                    }
                }
            }
        }

        if !escalate.is_empty() {
            info!("⬆️ {} 道题升级到 expensive 层级", escalate.len());
            let groups: Vec<Vec<u32>> = escalate
                .chunks(self.settings.max_batch_size.max(1))
                .map(|c| c.to_vec())
                .collect();
            self.run_expensive(groups, items, plan.batches.len(), &mut outcome)
                .await;
        }

        if !emergency.is_empty() {
            info!("🚑 {} 道题走逐题应急路径", emergency.len());
            let groups: Vec<Vec<u32>> = emergency.iter().map(|q| vec![*q]).collect();
            let first_id = plan.batches.len() + escalate.len();
            self.run_expensive(groups, items, first_id, &mut outcome).await;
        }

        debug!(
            "路由完成: {} 道题有层级结果，{} 次升级，{} 道题层级失败",
            outcome.results.len(),
            outcome.fallback_count(),
            outcome.failed.len()
        );
        outcome
    }

    /// expensive 层级调用（升级与应急路径共用），每次调用单独受超时约束
    async fn run_expensive(
        &self,
        groups: Vec<Vec<u32>>,
        items: &BTreeMap<u32, TierItem>,
        first_batch_id: usize,
        outcome: &mut RoutingOutcome,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_batch_size.max(1)));
        let timeout = self.settings.batch_timeout;

        let calls = groups.iter().enumerate().map(|(i, questions)| {
            let semaphore = Arc::clone(&semaphore);
            let backend = Arc::clone(&self.expensive);
            let batch_id = first_batch_id + i;
            let request = build_request(batch_id, ProcessingTier::Expensive, questions, items);
            async move {
                let tier = ProcessingTier::Expensive.as_str();
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| TierError::request_failed(tier, e))?;
                match tokio::time::timeout(timeout, backend.process(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TierError::Timeout {
                        tier: tier.to_string(),
                        batch_id,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        });
        let results = join_all(calls).await;

        for (questions, result) in groups.iter().zip(results) {
            let units: f64 = questions
                .iter()
                .map(|q| work_units(items.get(q).map(|i| i.question_type).unwrap_or(QuestionType::Unknown)))
                .sum();
            outcome.extra_cost += self.settings.expensive_unit_cost * units;

            match result {
                Ok(response) => {
                    for q in questions {
                        outcome.touch(*q, ProcessingTier::Expensive);
                        match response.answer(*q) {
                            Some(answer) => outcome.push_result(ProcessingTier::Expensive, answer),
                            None => {
                                outcome.failed.insert(*q);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("expensive 层级调用失败，保留本地候选: {}", e);
                    for q in questions {
                        outcome.touch(*q, ProcessingTier::Expensive);
                        outcome.failed.insert(*q);
                    }
                }
            }
        }
    }
}

fn build_request(
    batch_id: usize,
    tier: ProcessingTier,
    questions: &[u32],
    items: &BTreeMap<u32, TierItem>,
) -> TierRequest {
    TierRequest {
        batch_id,
        tier,
        items: questions.iter().filter_map(|q| items.get(q).cloned()).collect(),
    }
}

fn tier_method(tier: ProcessingTier) -> ExtractionMethod {
    match tier {
        ProcessingTier::Cheap => ExtractionMethod::CheapTier,
        ProcessingTier::Expensive => ExtractionMethod::ExpensiveTier,
    }
}

/// 把层级结果合并进候选答案
///
/// 层级给出的置信度严格更高时才替换；多选题只记录经过的层级。
pub fn merge(answers: &mut [ExtractedAnswer], outcome: &RoutingOutcome) {
    for answer in answers.iter_mut() {
        let q = answer.question_number;
        if let Some(tier) = outcome.processed_by.get(&q) {
            answer.tier = Some(*tier);
        }
        if outcome.failed.contains(&q) {
            answer.tier_failed = true;
        }
        if answer.multiple_marks {
            continue;
        }
        for result in outcome.results.get(&q).into_iter().flatten() {
            let Some(value) = &result.answer.value else {
                continue;
            };
            if result.answer.confidence > answer.confidence {
                answer.format_valid = answer.question_type.accepts_length(value);
                answer.value = Some(value.clone());
                answer.set_confidence(result.answer.confidence);
                answer.extraction_method = tier_method(result.tier);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tier_backend::OfflineTier;
    use crate::services::complexity;
    use async_trait::async_trait;

    struct FailingTier;

    #[async_trait]
    impl TierBackend for FailingTier {
        async fn process(&self, _request: &TierRequest) -> Result<TierResponse, TierError> {
            Err(TierError::EmptyResponse {
                tier: "cheap_tier".to_string(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct SlowTier;

    #[async_trait]
    impl TierBackend for SlowTier {
        async fn process(&self, _request: &TierRequest) -> Result<TierResponse, TierError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TierResponse::default())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// 按请求回显候选值，可指定漏掉的题和统一的置信度
    struct ScriptedTier {
        missing: Option<u32>,
        confidence: f32,
    }

    #[async_trait]
    impl TierBackend for ScriptedTier {
        async fn process(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
            let answers = request
                .items
                .iter()
                .filter(|item| Some(item.question_number) != self.missing)
                .map(|item| TierAnswer {
                    question_number: item.question_number,
                    value: item.candidate.clone(),
                    confidence: self.confidence,
                })
                .collect();
            Ok(TierResponse { answers })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn settings() -> RouterSettings {
        RouterSettings::from(&PipelineConfig::default())
    }

    fn answers(count: u32) -> Vec<ExtractedAnswer> {
        (1..=count)
            .map(|q| {
                let mut a = ExtractedAnswer::empty(q, QuestionType::MultipleChoice, ExtractionMethod::TemplateAware)
                    .with_confidence(0.95);
                a.value = Some("A".to_string());
                a.cross_validated = true;
                a.bubble_quality = crate::models::answer::BubbleQuality::Heavy;
                a
            })
            .collect()
    }

    fn items(answers: &[ExtractedAnswer]) -> BTreeMap<u32, TierItem> {
        let options = vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()];
        answers
            .iter()
            .map(|a| (a.question_number, TierItem::from_answer(a, &options)))
            .collect()
    }

    #[test]
    fn plan_conserves_questions() {
        let mut answers = answers(12);
        answers[3].value = None;
        answers[3].multiple_marks = true;
        answers[8].question_type = QuestionType::Essay;
        let scores = complexity::analyze_all(&answers);
        let router = ModelRouter::new(
            settings(),
            Arc::new(OfflineTier::new(ProcessingTier::Cheap)),
            Arc::new(OfflineTier::new(ProcessingTier::Expensive)),
        );
        let plan = router.plan(&answers, &scores);

        assert_eq!(plan.question_count(), 12);
        let mut seen: Vec<u32> = plan.batches.iter().flat_map(|b| b.questions.clone()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 12);
        assert!(plan.batches.iter().all(|b| b.questions.len() <= 5));
        assert_eq!(plan.tier_of(4), Some(ProcessingTier::Expensive));
        assert_eq!(plan.tier_of(9), Some(ProcessingTier::Expensive));
        // 10 道选择题 cheap，4 号选择题 + 9 号作文 expensive
        assert!((plan.total_cost - (10.0 + 10.0 + 30.0)).abs() < 1e-9);
        assert!((plan.baseline_cost - 140.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_cheap_batch_escalates() {
        let mut answers = answers(3);
        let scores = complexity::analyze_all(&answers);
        let router = ModelRouter::new(
            settings(),
            Arc::new(FailingTier),
            Arc::new(OfflineTier::new(ProcessingTier::Expensive)),
        );
        let plan = router.plan(&answers, &scores);
        let outcome = router.execute(&plan, &items(&answers), &scores).await;

        assert_eq!(outcome.fallback_count(), 3);
        assert!(outcome
            .fallback_events
            .iter()
            .all(|e| e.reason == FallbackReason::CallFailed && e.to == ProcessingTier::Expensive));

        merge(&mut answers, &outcome);
        assert!(answers.iter().all(|a| a.tier == Some(ProcessingTier::Expensive)));
        assert!(answers.iter().all(|a| !a.tier_failed));
    }

    #[tokio::test]
    async fn timeout_routes_to_emergency_path() {
        let mut settings = settings();
        settings.batch_timeout = Duration::from_millis(100);
        let mut answers = answers(2);
        let scores = complexity::analyze_all(&answers);
        let router = ModelRouter::new(settings, Arc::new(SlowTier), Arc::new(SlowTier));
        let plan = router.plan(&answers, &scores);
        let outcome = router.execute(&plan, &items(&answers), &scores).await;

        assert_eq!(outcome.fallback_count(), 2);
        assert!(outcome
            .fallback_events
            .iter()
            .all(|e| e.reason == FallbackReason::BatchTimeout));
        assert_eq!(outcome.failed.len(), 2);

        merge(&mut answers, &outcome);
        assert!(answers.iter().all(|a| a.tier_failed && a.value.as_deref() == Some("A")));
    }

    #[tokio::test]
    async fn missing_answer_escalates_as_incomplete() {
        let answers = answers(3);
        let scores = complexity::analyze_all(&answers);
        let router = ModelRouter::new(
            settings(),
            Arc::new(ScriptedTier {
                missing: Some(2),
                confidence: 0.95,
            }),
            Arc::new(OfflineTier::new(ProcessingTier::Expensive)),
        );
        let plan = router.plan(&answers, &scores);
        let outcome = router.execute(&plan, &items(&answers), &scores).await;

        assert_eq!(outcome.fallback_count(), 1);
        let event = &outcome.fallback_events[0];
        assert_eq!(event.question_number, 2);
        assert_eq!(event.reason, FallbackReason::IncompleteResult);
        assert_eq!(event.to, ProcessingTier::Expensive);
        assert_eq!(outcome.processed_by.get(&2), Some(&ProcessingTier::Expensive));
        assert_eq!(outcome.processed_by.get(&1), Some(&ProcessingTier::Cheap));
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_on_uncertain_question_escalates() {
        let mut answers = answers(2);
        for a in answers.iter_mut() {
            a.cross_validated = false;
        }
        let scores = complexity::analyze_all(&answers);
        // 未交叉验证 16.5 分，仍在 cheap 层级但高于升级门槛
        assert!(scores.iter().all(|s| s.recommended_tier == ProcessingTier::Cheap
            && s.score > settings().fallback_min_complexity));

        let router = ModelRouter::new(
            settings(),
            Arc::new(ScriptedTier {
                missing: None,
                confidence: 0.4,
            }),
            Arc::new(OfflineTier::new(ProcessingTier::Expensive)),
        );
        let plan = router.plan(&answers, &scores);
        let outcome = router.execute(&plan, &items(&answers), &scores).await;

        assert_eq!(outcome.fallback_count(), 2);
        assert!(outcome
            .fallback_events
            .iter()
            .all(|e| e.reason == FallbackReason::LowConfidence && e.to == ProcessingTier::Expensive));
        assert!(outcome.extra_cost > 0.0);
    }

    #[tokio::test]
    async fn low_confidence_on_simple_question_stays_cheap() {
        let answers = answers(2);
        let scores = complexity::analyze_all(&answers);
        assert!(scores.iter().all(|s| s.score <= settings().fallback_min_complexity));

        let router = ModelRouter::new(
            settings(),
            Arc::new(ScriptedTier {
                missing: None,
                confidence: 0.4,
            }),
            Arc::new(OfflineTier::new(ProcessingTier::Expensive)),
        );
        let plan = router.plan(&answers, &scores);
        let outcome = router.execute(&plan, &items(&answers), &scores).await;

        assert_eq!(outcome.fallback_count(), 0);
        assert!(outcome
            .processed_by
            .values()
            .all(|tier| *tier == ProcessingTier::Cheap));
        assert_eq!(outcome.extra_cost, 0.0);
    }

    #[test]
    fn merge_never_fills_multi_mark_question() {
        let mut answers = answers(1);
        answers[0].value = None;
        answers[0].multiple_marks = true;
        answers[0].set_confidence(0.2);
        let mut outcome = RoutingOutcome::default();
        outcome.push_result(
            ProcessingTier::Expensive,
            &TierAnswer {
                question_number: 1,
                value: Some("C".to_string()),
                confidence: 0.99,
            },
        );
        merge(&mut answers, &outcome);

        assert!(answers[0].value.is_none());
        assert_eq!(answers[0].tier, Some(ProcessingTier::Expensive));
    }

    #[test]
    fn merge_keeps_higher_local_confidence() {
        let mut answers = answers(1);
        let mut outcome = RoutingOutcome::default();
        outcome.push_result(
            ProcessingTier::Cheap,
            &TierAnswer {
                question_number: 1,
                value: Some("B".to_string()),
                confidence: 0.5,
            },
        );
        merge(&mut answers, &outcome);
        assert_eq!(answers[0].value.as_deref(), Some("A"));
        assert_eq!(answers[0].extraction_method, ExtractionMethod::TemplateAware);
    }
}
