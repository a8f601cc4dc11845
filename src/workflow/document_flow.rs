//! 文档处理流程 - 流程层
//!
//! 核心职责：定义"一份答题卡"的完整处理流程
//!
//! 流程顺序：
//! 1. 解码图像 → 检测墨迹 → 识别模板（或推断通用网格）
//! 2. 划定处理区域 → 手写判别 → 噪声区域细化
//! 3. 逐题提取 → 复杂度评分 → 分批路由并合并层级结果
//! 4. 校验 → 有界恢复 → 聚合为最终记录

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::clients::tier_backend::{OfflineTier, TierBackend, TierItem};
use crate::config::PipelineConfig;
use crate::error::{AppError, AppResult, ConfigError, DocumentError};
use crate::infrastructure::document_image::DocumentImage;
use crate::infrastructure::mark_detector::{ConnectedComponentDetector, MarkDetector};
use crate::infrastructure::text_reader::{NoTextReader, TextReader};
use crate::models::answer::ExtractionMethod;
use crate::models::geometry::Rect;
use crate::models::output::{PipelineDiagnostics, PipelineOutput};
use crate::models::registry::TemplateRegistry;
use crate::models::routing::ProcessingTier;
use crate::models::template::SheetLayout;
use crate::services::aggregator::{AggregationInput, ResultAggregator};
use crate::services::answer_extractor::{AnswerExtractor, ExtractionInput, ExtractionParams, TemplateAwareExtractor};
use crate::services::complexity;
use crate::services::handwriting::{self, DiscriminationContext, GeometricDiscriminator, HandwritingDiscriminator};
use crate::services::model_router::{self, ModelRouter, RouterSettings};
use crate::services::recovery::{RecoveryController, RecoverySettings};
use crate::services::roi_manager::RoiManager;
use crate::services::template_recognizer::{self, StructuralTemplateRecognizer, TemplateRecognizer};
use crate::services::validation::{ValidationEngine, ValidationSettings};
use crate::workflow::document_ctx::DocumentCtx;
use crate::workflow::reprocessor::{attach_region_image, SheetReprocessor};

/// 一次处理请求
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// 图像字节（png / jpeg / bmp）
    pub bytes: Vec<u8>,
    /// 文件名，参与格式判断
    pub filename_hint: String,
    /// 期望题目数，限制版面上参与提取的题目
    pub expected_question_count: Option<usize>,
    /// 已知的噪声区域
    pub known_noise: Vec<Rect>,
}

impl IngestRequest {
    pub fn new(bytes: Vec<u8>, filename_hint: impl Into<String>) -> Self {
        Self {
            bytes,
            filename_hint: filename_hint.into(),
            expected_question_count: None,
            known_noise: Vec::new(),
        }
    }

    pub fn with_expected_questions(mut self, count: usize) -> Self {
        self.expected_question_count = Some(count);
        self
    }

    pub fn with_known_noise(mut self, noise: Vec<Rect>) -> Self {
        self.known_noise = noise;
        self
    }
}

/// 答题卡处理流水线
///
/// - 各阶段都是可替换的策略对象
/// - 不持有任何跨文档的可变状态，可以被多个任务同时使用
pub struct AnswerSheetPipeline {
    config: PipelineConfig,
    registry: Arc<TemplateRegistry>,
    detector: Arc<dyn MarkDetector>,
    text_reader: Arc<dyn TextReader>,
    recognizer: Arc<dyn TemplateRecognizer>,
    discriminator: Arc<dyn HandwritingDiscriminator>,
    extractor: Arc<dyn AnswerExtractor>,
    roi: RoiManager,
    router: ModelRouter,
    recovery: RecoveryController,
}

impl AnswerSheetPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// 处理一份文档
    pub async fn process(&self, request: IngestRequest) -> AppResult<PipelineOutput> {
        let ctx = DocumentCtx::new(1, request.filename_hint.clone());
        self.process_document(&ctx, request).await
    }

    /// 处理一份文档（带日志上下文）
    ///
    /// # 返回
    /// 只有图像无法解码或没有可提取区域时返回错误，其余问题降级为单题结果
    pub async fn process_document(&self, ctx: &DocumentCtx, request: IngestRequest) -> AppResult<PipelineOutput> {
        let started = Instant::now();
        let filename = request.filename_hint.as_str();

        if request.bytes.is_empty() {
            return Err(DocumentError::EmptyDocument {
                filename: filename.to_string(),
            }
            .into());
        }
        let image = DocumentImage::from_bytes(&request.bytes).map_err(|e| AppError::image_decode(filename, e))?;

        // ========== 阶段 1: 墨迹与模板 ==========
        let marks = self.detector.detect(&image);
        info!("{} 🔍 {} 检测到 {} 个墨迹", ctx, self.detector.name(), marks.len());

        let (template_match, template) = self.recognizer.recognize(&marks, filename, &self.registry);
        let layout = match &template {
            Some(template) => {
                info!(
                    "{} ✓ 匹配模板 {} (置信度 {:.2})",
                    ctx, template.id, template_match.confidence
                );
                SheetLayout::from_template(template, request.expected_question_count)
            }
            None => {
                warn!(
                    "{} ⚠️ 未匹配到模板 (最高 {:.2})，尝试推断通用网格",
                    ctx, template_match.confidence
                );
                template_recognizer::generic_layout(&marks, template_match.format, request.expected_question_count)
                    .ok_or_else(|| DocumentError::NoExtractableRegions {
                        filename: filename.to_string(),
                    })?
            }
        };
        if layout.questions().is_empty() {
            return Err(DocumentError::NoExtractableRegions {
                filename: filename.to_string(),
            }
            .into());
        }

        // ========== 阶段 2: 区域与手写判别 ==========
        let initial_regions = self.roi.build(&layout, image.dimensions(), &request.known_noise);
        let centers = layout.bubble_centers();
        let classified = self.discriminator.classify_all(
            &marks,
            &DiscriminationContext {
                bubble_centers: &centers,
                bubble_radius: layout.bubble_radius(),
                regions: &initial_regions,
            },
        );
        let noise = handwriting::noise_regions(&classified, &initial_regions);
        let regions = if noise.is_empty() {
            initial_regions
        } else {
            debug!("{} 发现 {} 个手写噪声区域", ctx, noise.len());
            initial_regions.with_noise(&noise)
        };

        // ========== 阶段 3: 提取、评分、路由 ==========
        let input = ExtractionInput {
            layout: &layout,
            regions: &regions,
            classified: &classified,
            image: &image,
            text_reader: self.text_reader.as_ref(),
        };
        let initial_answers = self
            .extractor
            .extract_all(&input, &ExtractionParams::initial(ExtractionMethod::TemplateAware));
        let scores = complexity::analyze_all(&initial_answers);
        let plan = self.router.plan(&initial_answers, &scores);
        info!(
            "{} 📦 {} 道题分为 {} 批，预计成本 {:.1}（节省 {:.1}）",
            ctx,
            plan.question_count(),
            plan.batches.len(),
            plan.total_cost,
            plan.total_savings()
        );

        let wants_images = self.router.backend(ProcessingTier::Cheap).wants_images()
            || self.router.backend(ProcessingTier::Expensive).wants_images();
        let items: BTreeMap<u32, TierItem> = initial_answers
            .iter()
            .map(|answer| {
                let mut item = TierItem::from_answer(answer, &layout.valid_answers);
                if wants_images {
                    attach_region_image(&mut item, &image);
                }
                (answer.question_number, item)
            })
            .collect();

        let outcome = self.router.execute(&plan, &items, &scores).await;
        let mut answers = initial_answers.clone();
        model_router::merge(&mut answers, &outcome);
        if outcome.fallback_count() > 0 {
            info!("{} ⬆️ {} 次升级到 expensive 层级", ctx, outcome.fallback_count());
        }

        // ========== 阶段 4: 校验与恢复 ==========
        let engine = ValidationEngine::new(ValidationSettings::from(&self.config), layout.valid_answers.clone());
        let report = engine.validate(&answers);
        let failed = report.findings.iter().filter(|f| !f.passed).count();
        info!(
            "{} 🧪 校验: {} 项检查，{} 项未通过，干扰率 {:.0}%",
            ctx,
            report.findings.len(),
            failed,
            report.interference_rate * 100.0
        );

        let targets = self.recovery.select_targets(&report, &answers, &engine);
        let recovery = if targets.is_empty() {
            Vec::new()
        } else {
            info!("{} 🔁 {} 道题进入恢复", ctx, targets.len());
            let reprocessor = SheetReprocessor {
                layout: &layout,
                regions: &regions,
                classified: &classified,
                image: &image,
                text_reader: self.text_reader.as_ref(),
                extractor: self.extractor.as_ref(),
                expensive: self.router.backend(ProcessingTier::Expensive),
            };
            self.recovery.recover(&targets, &answers, &engine, &reprocessor).await
        };

        // ========== 阶段 5: 聚合 ==========
        let (records, summary, _) = ResultAggregator::new(&engine).aggregate(AggregationInput {
            answers: &answers,
            recovery: &recovery,
            template: &template_match,
            format: layout.format,
            plan: &plan,
            tier_fallbacks: outcome.fallback_count(),
            extra_cost: outcome.extra_cost,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        info!(
            "{} ✅ 完成: {} 道题，质量 {:.2}，人工复核 {} 道",
            ctx,
            records.len(),
            summary.quality_score,
            summary.manual_review_count
        );

        Ok(PipelineOutput {
            records,
            summary,
            diagnostics: PipelineDiagnostics {
                classified_marks: classified,
                initial_answers,
                complexity: scores,
                routing: plan,
                fallback_events: outcome.fallback_events,
                validation: report,
                recovery,
            },
        })
    }
}

/// 流水线构建器，未指定的阶段使用默认实现
pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: Option<Arc<TemplateRegistry>>,
    detector: Option<Arc<dyn MarkDetector>>,
    text_reader: Option<Arc<dyn TextReader>>,
    recognizer: Option<Arc<dyn TemplateRecognizer>>,
    discriminator: Option<Arc<dyn HandwritingDiscriminator>>,
    extractor: Option<Arc<dyn AnswerExtractor>>,
    cheap: Option<Arc<dyn TierBackend>>,
    expensive: Option<Arc<dyn TierBackend>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: None,
            detector: None,
            text_reader: None,
            recognizer: None,
            discriminator: None,
            extractor: None,
            cheap: None,
            expensive: None,
        }
    }

    pub fn registry(mut self, registry: Arc<TemplateRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn mark_detector(mut self, detector: Arc<dyn MarkDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn text_reader(mut self, reader: Arc<dyn TextReader>) -> Self {
        self.text_reader = Some(reader);
        self
    }

    pub fn recognizer(mut self, recognizer: Arc<dyn TemplateRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn discriminator(mut self, discriminator: Arc<dyn HandwritingDiscriminator>) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn AnswerExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn cheap_tier(mut self, backend: Arc<dyn TierBackend>) -> Self {
        self.cheap = Some(backend);
        self
    }

    pub fn expensive_tier(mut self, backend: Arc<dyn TierBackend>) -> Self {
        self.expensive = Some(backend);
        self
    }

    /// 校验配置并组装流水线
    pub fn build(self) -> Result<AnswerSheetPipeline, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let cheap = self
            .cheap
            .unwrap_or_else(|| Arc::new(OfflineTier::new(ProcessingTier::Cheap)));
        let expensive = self
            .expensive
            .unwrap_or_else(|| Arc::new(OfflineTier::new(ProcessingTier::Expensive)));
        debug!("层级后端: cheap={} expensive={}", cheap.name(), expensive.name());

        Ok(AnswerSheetPipeline {
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(TemplateRegistry::with_builtins())),
            detector: self.detector.unwrap_or_else(|| {
                Arc::new(ConnectedComponentDetector::new(config.ink_threshold, config.min_mark_area))
            }),
            text_reader: self.text_reader.unwrap_or_else(|| Arc::new(NoTextReader)),
            recognizer: self
                .recognizer
                .unwrap_or_else(|| Arc::new(StructuralTemplateRecognizer::new(config.template_min_confidence))),
            discriminator: self.discriminator.unwrap_or_else(|| Arc::new(GeometricDiscriminator)),
            extractor: self.extractor.unwrap_or_else(|| Arc::new(TemplateAwareExtractor)),
            roi: RoiManager::new(config.roi_grid_buffer, config.roi_exclusion_penalty),
            router: ModelRouter::new(RouterSettings::from(&config), cheap, expensive),
            recovery: RecoveryController::new(RecoverySettings::from(&config)),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_invalid_config() {
        let config = PipelineConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(PipelineBuilder::new(config).build().is_err());
    }

    #[test]
    fn builder_fills_default_stages() {
        let pipeline = AnswerSheetPipeline::builder(PipelineConfig::default()).build().unwrap();
        assert!(pipeline.registry().get("omr_20q_abcd").is_some());
        assert_eq!(pipeline.config().max_retries, 2);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_fatal() {
        let pipeline = AnswerSheetPipeline::builder(PipelineConfig::default()).build().unwrap();
        let err = pipeline
            .process(IngestRequest::new(b"not an image".to_vec(), "broken.png"))
            .await
            .unwrap_err();
        assert!(err.is_fatal_document_error());
    }

    #[tokio::test]
    async fn blank_page_has_no_extractable_regions() {
        let pipeline = AnswerSheetPipeline::builder(PipelineConfig::default()).build().unwrap();
        let bytes = DocumentImage::blank(850, 1100).to_png_bytes().unwrap();
        let err = pipeline.process(IngestRequest::new(bytes, "blank.png")).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Document(DocumentError::NoExtractableRegions { .. })
        ));
    }
}
