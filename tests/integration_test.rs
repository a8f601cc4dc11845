use async_trait::async_trait;
use sheet_extract::clients::{TierBackend, TierRequest, TierResponse};
use sheet_extract::error::{DocumentError, TierError};
use sheet_extract::infrastructure::{DocumentImage, MarkDetector, TextReader, TextReading};
use sheet_extract::models::template::{DocumentFormat, GridGeometry, TemplateDefinition, TemplateElement, TextField};
use sheet_extract::models::{
    FallbackReason, FindingKind, Mark, ProcessingTier, QuestionType, Rect, RecoveryStrategy, Severity,
};
use sheet_extract::{AnswerSheetPipeline, AppError, IngestRequest, PipelineConfig, PipelineOutput, TemplateRegistry};
use std::sync::Arc;
use std::time::Duration;

/// 固定返回给定墨迹的检测器
struct FixedMarks(Vec<Mark>);

impl MarkDetector for FixedMarks {
    fn detect(&self, _image: &DocumentImage) -> Vec<Mark> {
        self.0.clone()
    }

    fn name(&self) -> &'static str {
        "fixed_marks"
    }
}

/// 所有作答框都读出同一段文字
struct FixedReader {
    text: &'static str,
    confidence: f32,
}

impl TextReader for FixedReader {
    fn read(&self, _image: &DocumentImage, _region: &Rect, _question_number: u32) -> Option<TextReading> {
        Some(TextReading {
            text: self.text.to_string(),
            confidence: self.confidence,
        })
    }

    fn name(&self) -> &'static str {
        "fixed_reader"
    }
}

/// 永远赶不上批次截止时间的层级
struct SlowTier;

#[async_trait]
impl TierBackend for SlowTier {
    async fn process(&self, _request: &TierRequest) -> Result<TierResponse, TierError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(TierResponse::default())
    }

    fn name(&self) -> &str {
        "slow_tier"
    }
}

const LABELS: [&str; 4] = ["A", "B", "C", "D"];

fn blank_page() -> Vec<u8> {
    DocumentImage::blank(850, 1100).to_png_bytes().expect("空白页编码失败")
}

/// omr_20q_abcd 中第 `question` 题第 `column` 个选项的涂卡
fn bubble(question: u32, column: u32) -> Mark {
    let row = (question - 1) as f32;
    Mark::filled_circle(250.0 + 40.0 * column as f32, 250.0 + 40.0 * row, 10.0, 0.9)
}

fn header_marks() -> Vec<Mark> {
    vec![
        Mark::new(150.0, 90.0, 200.0, 20.0, 0.9, 3000.0),
        Mark::new(120.0, 175.0, 150.0, 20.0, 0.9, 2200.0),
    ]
}

/// 每题涂一个选项，`overrides` 中的题目改为指定的选项列
fn omr_sheet(overrides: &[(u32, Vec<u32>)]) -> Vec<Mark> {
    let mut marks = header_marks();
    for question in 1..=20 {
        match overrides.iter().find(|(q, _)| *q == question) {
            Some((_, columns)) => marks.extend(columns.iter().map(|c| bubble(question, *c))),
            None => marks.push(bubble(question, (question - 1) % 4)),
        }
    }
    marks
}

fn pipeline_with(config: PipelineConfig, marks: Vec<Mark>) -> AnswerSheetPipeline {
    AnswerSheetPipeline::builder(config)
        .mark_detector(Arc::new(FixedMarks(marks)))
        .build()
        .expect("流水线构建失败")
}

fn assert_confidences_in_unit_range(output: &PipelineOutput) {
    for record in &output.records {
        assert!((0.0..=1.0).contains(&record.confidence), "题 {} 置信度越界", record.question_number);
    }
    for answer in &output.diagnostics.initial_answers {
        assert!((0.0..=1.0).contains(&answer.confidence));
    }
    for outcome in &output.diagnostics.recovery {
        assert!((0.0..=1.0).contains(&outcome.best.confidence));
    }
}

/// 接受的尝试置信度单调不减，且不超过重试预算
fn assert_recovery_is_monotonic(output: &PipelineOutput, max_retries: usize) {
    for outcome in &output.diagnostics.recovery {
        assert!(outcome.attempts.len() <= max_retries);
        let mut best = outcome.initial_confidence;
        for attempt in outcome.accepted_attempts() {
            assert!(attempt.resulting_confidence > best);
            best = attempt.resulting_confidence;
        }
        assert!(outcome.best.confidence >= outcome.initial_confidence);
    }
}

#[test]
fn clean_bubble_sheet_stays_on_cheap_tier() {
    let pipeline = pipeline_with(PipelineConfig::default(), omr_sheet(&[]));
    let output = tokio_test::block_on(pipeline.process(IngestRequest::new(blank_page(), "omr_001.png")))
        .expect("处理失败");

    assert_eq!(output.summary.template_id.as_deref(), Some("omr_20q_abcd"));
    assert_eq!(output.summary.format, DocumentFormat::BubbleSheet);
    assert_eq!(output.records.len(), 20);

    for (idx, record) in output.records.iter().enumerate() {
        let question = idx as u32 + 1;
        assert_eq!(record.question_number, question);
        assert_eq!(record.value.as_deref(), Some(LABELS[((question - 1) % 4) as usize]));
        assert!(record.validation_passed);
        assert!(!record.needs_manual_review());
        assert_eq!(record.provenance(), "template_aware→cheap_tier");
    }

    assert!(output
        .diagnostics
        .complexity
        .iter()
        .all(|c| c.recommended_tier == ProcessingTier::Cheap && c.score <= 25.0));
    assert!(output.diagnostics.fallback_events.is_empty());
    assert!(output.diagnostics.recovery.is_empty());
    assert_eq!(output.summary.fallbacks_triggered, 0);
    assert_eq!(output.summary.manual_review_count, 0);
    assert!(output.summary.quality_score >= 0.9);
    assert!((output.summary.estimated_cost - 20.0).abs() < 1e-9);
    assert!((output.summary.cost_savings - 180.0).abs() < 1e-9);
    assert_confidences_in_unit_range(&output);
}

#[tokio::test]
async fn every_question_lands_in_exactly_one_batch() {
    let pipeline = pipeline_with(PipelineConfig::default(), omr_sheet(&[]));
    let output = pipeline
        .process(IngestRequest::new(blank_page(), "omr_002.png"))
        .await
        .expect("处理失败");

    let plan = &output.diagnostics.routing;
    assert_eq!(plan.question_count(), output.diagnostics.initial_answers.len());
    for question in 1..=20 {
        let hits = plan.batches.iter().filter(|b| b.questions.contains(&question)).count();
        assert_eq!(hits, 1, "题 {} 出现在 {} 个批次中", question, hits);
    }
    assert!(plan
        .batches
        .iter()
        .all(|b| b.questions.len() <= pipeline.config().max_batch_size));
}

#[tokio::test]
async fn double_marked_question_goes_to_manual_review() {
    let config = PipelineConfig::default();
    let max_retries = config.max_retries;
    let pipeline = pipeline_with(config, omr_sheet(&[(5, vec![0, 2])]));
    let output = pipeline
        .process(IngestRequest::new(blank_page(), "omr_003.png"))
        .await
        .expect("处理失败");

    let initial = output
        .diagnostics
        .initial_answers
        .iter()
        .find(|a| a.question_number == 5)
        .expect("缺少第 5 题");
    assert!(initial.multiple_marks);
    assert!(initial.value.is_none());
    assert_eq!(output.diagnostics.routing.tier_of(5), Some(ProcessingTier::Expensive));

    let finding = output
        .diagnostics
        .validation
        .for_question(5)
        .find(|f| f.kind == FindingKind::Impossibility)
        .expect("缺少不可能性结论");
    assert!(!finding.passed);
    assert_eq!(finding.severity, Severity::Critical);
    assert!(finding.fallback_required);

    let outcome = output
        .diagnostics
        .recovery
        .iter()
        .find(|o| o.question_number == 5)
        .expect("第 5 题没有进入恢复");
    assert_eq!(outcome.strategy, RecoveryStrategy::RegionRefocus);
    assert_eq!(outcome.attempts.len(), max_retries);
    assert!(!outcome.improved);
    assert!(!outcome.resolved);

    let record = output.record(5).expect("缺少第 5 题记录");
    assert!(record.value.is_none());
    assert!(!record.validation_passed);
    assert!(record.needs_manual_review());
    assert_eq!(output.summary.manual_review_count, 1);

    let neighbour = output.record(4).expect("缺少第 4 题记录");
    assert_eq!(neighbour.value.as_deref(), Some("D"));
    assert!(neighbour.validation_passed);

    assert_confidences_in_unit_range(&output);
    assert_recovery_is_monotonic(&output, max_retries);
}

fn wide_grid_template() -> TemplateDefinition {
    TemplateDefinition {
        id: "wide_5q".to_string(),
        name: "五题宽间距答题卡".to_string(),
        format: DocumentFormat::BubbleSheet,
        grid: Some(GridGeometry {
            rows: 5,
            columns: 4,
            spacing_x: 100.0,
            spacing_y: 100.0,
            start_x: 200.0,
            start_y: 300.0,
            bubble_radius: 10.0,
            first_question: 1,
        }),
        header: None,
        student_id: None,
        text_fields: Vec::new(),
        required_elements: vec![TemplateElement::BubbleGrid],
        valid_answers: LABELS.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn offset_mark_triggers_geometric_correction() {
    let mut registry = TemplateRegistry::new();
    registry.register(wide_grid_template()).expect("模板注册失败");

    let wide = |column: u32, row: u32, dx: f32| {
        Mark::filled_circle(200.0 + 100.0 * column as f32 + dx, 300.0 + 100.0 * row as f32, 10.0, 0.9)
    };
    let marks = vec![wide(0, 0, 0.0), wide(1, 1, 0.0), wide(1, 2, 40.0), wide(2, 3, 0.0), wide(3, 4, 0.0)];

    let pipeline = AnswerSheetPipeline::builder(PipelineConfig::default())
        .registry(Arc::new(registry))
        .mark_detector(Arc::new(FixedMarks(marks)))
        .build()
        .expect("流水线构建失败");
    let output = tokio_test::block_on(pipeline.process(IngestRequest::new(blank_page(), "wide.png")))
        .expect("处理失败");

    assert_eq!(output.summary.template_id.as_deref(), Some("wide_5q"));

    let shifted = output
        .diagnostics
        .initial_answers
        .iter()
        .find(|a| a.question_number == 3)
        .expect("缺少第 3 题");
    assert_eq!(shifted.value.as_deref(), Some("B"));
    assert!(shifted.confidence < 0.95);
    let deviation = shifted.max_deviation().expect("缺少偏差");
    assert!((deviation - 40.0).abs() < 1e-3);

    let finding = output
        .diagnostics
        .validation
        .for_question(3)
        .find(|f| f.kind == FindingKind::Geometric)
        .expect("缺少几何结论");
    assert!(!finding.passed);
    assert!(finding.fallback_required);
    assert!(finding.correction_suggested);

    let outcome = output
        .diagnostics
        .recovery
        .iter()
        .find(|o| o.question_number == 3)
        .expect("第 3 题没有进入恢复");
    assert_eq!(outcome.strategy, RecoveryStrategy::AlternativeMethod);

    for question in [1, 2, 4, 5] {
        let finding = output
            .diagnostics
            .validation
            .for_question(question)
            .find(|f| f.kind == FindingKind::Geometric)
            .expect("缺少几何结论");
        assert!(finding.passed, "题 {} 不应有几何偏差", question);
    }
    assert_confidences_in_unit_range(&output);
}

fn written_template() -> TemplateDefinition {
    TemplateDefinition {
        id: "written_20q".to_string(),
        name: "二十题书写卷".to_string(),
        format: DocumentFormat::TextBased,
        grid: None,
        header: None,
        student_id: None,
        text_fields: (0..20)
            .map(|i| TextField {
                question_number: i + 1,
                question_type: QuestionType::Text,
                rect: Rect::new(100.0, 100.0 + 45.0 * i as f32, 650.0, 40.0),
            })
            .collect(),
        required_elements: vec![TemplateElement::TextAnswerBoxes],
        valid_answers: Vec::new(),
    }
}

#[tokio::test]
async fn known_noise_is_recovered_by_noise_filtering() {
    let mut registry = TemplateRegistry::new();
    registry.register(written_template()).expect("模板注册失败");

    let config = PipelineConfig {
        max_retries: 1,
        ..Default::default()
    };
    let pipeline = AnswerSheetPipeline::builder(config)
        .registry(Arc::new(registry))
        .mark_detector(Arc::new(FixedMarks(vec![Mark::new(
            300.0,
            100.0 + 45.0 * 9.0 + 10.0,
            200.0,
            15.0,
            0.8,
            2000.0,
        )])))
        .text_reader(Arc::new(FixedReader {
            text: "photosynthesis",
            confidence: 0.9,
        }))
        .build()
        .expect("流水线构建失败");

    let noise: Vec<Rect> = (0..7)
        .map(|i| Rect::new(120.0, 100.0 + 45.0 * i as f32 + 10.0, 80.0, 20.0))
        .collect();
    let request = IngestRequest::new(blank_page(), "written_quiz.png").with_known_noise(noise);
    let output = pipeline.process(request).await.expect("处理失败");

    assert_eq!(output.summary.template_id.as_deref(), Some("written_20q"));
    assert_eq!(output.records.len(), 20);

    let interference = output
        .diagnostics
        .validation
        .document_finding(FindingKind::Interference)
        .expect("缺少干扰结论");
    assert!(!interference.passed);
    assert_eq!(interference.severity, Severity::Warning);
    assert!(!interference.fallback_required);
    assert!((output.diagnostics.validation.interference_rate - 0.35).abs() < 1e-6);

    assert_eq!(output.diagnostics.recovery.len(), 7);
    for outcome in &output.diagnostics.recovery {
        assert!(outcome.question_number <= 7);
        assert_eq!(outcome.strategy, RecoveryStrategy::NoiseFiltering);
        assert_eq!(outcome.attempts.len(), 1);
        assert!((outcome.initial_confidence - 0.441).abs() < 1e-4);
        assert!((outcome.best.confidence - 0.72).abs() < 1e-4);
        assert!(outcome.resolved);
    }

    for question in 1..=7 {
        let record = output.record(question).expect("缺少记录");
        assert_eq!(record.value.as_deref(), Some("photosynthesis"));
        assert!(record.provenance_chain.iter().any(|p| p == "handwriting_filtered"));
        assert_eq!(
            record.provenance_chain.last().map(String::as_str),
            Some("recovered:noise_filtering")
        );
    }

    let untouched = output.record(10).expect("缺少第 10 题记录");
    assert!((untouched.confidence - 0.9).abs() < 1e-6);
    assert_eq!(output.summary.manual_review_count, 0);

    assert_confidences_in_unit_range(&output);
    assert_recovery_is_monotonic(&output, 1);
}

#[tokio::test]
async fn stalled_cheap_tier_falls_back_per_question() {
    let config = PipelineConfig {
        batch_timeout_ms: 50,
        ..Default::default()
    };
    let pipeline = AnswerSheetPipeline::builder(config)
        .mark_detector(Arc::new(FixedMarks(omr_sheet(&[]))))
        .cheap_tier(Arc::new(SlowTier))
        .build()
        .expect("流水线构建失败");
    let output = pipeline
        .process(IngestRequest::new(blank_page(), "omr_004.png"))
        .await
        .expect("处理失败");

    assert_eq!(output.diagnostics.fallback_events.len(), 20);
    assert!(output
        .diagnostics
        .fallback_events
        .iter()
        .all(|e| e.reason == FallbackReason::BatchTimeout && e.to == ProcessingTier::Expensive));
    assert!(output.summary.fallbacks_triggered >= 20);
    assert!(output.records.iter().all(|r| r.value.is_some()));
}

#[tokio::test]
async fn sheet_without_template_or_regions_is_fatal() {
    let pipeline = pipeline_with(PipelineConfig::default(), Vec::new());
    let err = pipeline
        .process(IngestRequest::new(blank_page(), "empty.png"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Document(DocumentError::NoExtractableRegions { .. })
    ));

    let err = pipeline
        .process(IngestRequest::new(Vec::new(), "zero.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Document(DocumentError::EmptyDocument { .. })));
}
