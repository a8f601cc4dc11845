//! 单题重提取
//!
//! 恢复控制器每次尝试都经由这里：按策略调整提取参数后重新提取，
//! 或者把题目单独交给 expensive 层级。

use crate::clients::tier_backend::{TierBackend, TierItem, TierRequest};
use crate::infrastructure::document_image::DocumentImage;
use crate::infrastructure::text_reader::TextReader;
use crate::models::answer::{ExtractedAnswer, ExtractionMethod};
use crate::models::mark::ClassifiedMark;
use crate::models::recovery::{RecoveryParameters, RecoveryStrategy};
use crate::models::routing::ProcessingTier;
use crate::models::template::{QuestionSpec, SheetLayout};
use crate::services::answer_extractor::{AnswerExtractor, ExtractionInput, ExtractionParams, DEFAULT_TOLERANCE_FACTOR};
use crate::services::recovery::Reprocessor;
use crate::services::roi_manager::ProcessingRegion;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use tracing::warn;

/// region_refocus 每次尝试收紧的容差
const REFOCUS_STEP: f32 = 0.5;
/// 容差下限
const MIN_TOLERANCE_FACTOR: f32 = 0.5;

/// 给层级请求附上题目区域的 PNG
pub(crate) fn attach_region_image(item: &mut TierItem, image: &DocumentImage) {
    let Some(region) = item.region else {
        return;
    };
    match image.encode_png(&region) {
        Ok(png) => item.image_png_base64 = Some(STANDARD.encode(png)),
        Err(e) => warn!("题 {} 区域图像编码失败: {}", item.question_number, e),
    }
}

/// 基于单份文档阶段结果的重提取器
pub struct SheetReprocessor<'a> {
    pub layout: &'a SheetLayout,
    pub regions: &'a ProcessingRegion,
    pub classified: &'a [ClassifiedMark],
    pub image: &'a DocumentImage,
    pub text_reader: &'a dyn TextReader,
    pub extractor: &'a dyn AnswerExtractor,
    pub expensive: &'a Arc<dyn TierBackend>,
}

impl SheetReprocessor<'_> {
    fn params_for(strategy: RecoveryStrategy, params: &RecoveryParameters) -> ExtractionParams {
        let tolerance_factor = match strategy {
            RecoveryStrategy::RegionRefocus => {
                (DEFAULT_TOLERANCE_FACTOR - REFOCUS_STEP * (params.attempt + 1) as f32).max(MIN_TOLERANCE_FACTOR)
            }
            _ => DEFAULT_TOLERANCE_FACTOR,
        };
        ExtractionParams {
            method: params.method,
            noise_strength: params.noise_strength,
            tolerance_factor,
        }
    }

    fn re_extract(&self, current: &ExtractedAnswer, params: ExtractionParams) -> ExtractedAnswer {
        let input = ExtractionInput {
            layout: self.layout,
            regions: self.regions,
            classified: self.classified,
            image: self.image,
            text_reader: self.text_reader,
        };
        let spec = QuestionSpec {
            number: current.question_number,
            question_type: current.question_type,
        };
        let mut candidate = self.extractor.extract(spec, &input, &params);
        candidate.tier = current.tier;
        candidate
    }

    async fn ask_expensive(&self, current: &ExtractedAnswer) -> ExtractedAnswer {
        let mut item = TierItem::from_answer(current, &self.layout.valid_answers);
        if self.expensive.wants_images() {
            attach_region_image(&mut item, self.image);
        }
        let request = TierRequest {
            batch_id: current.question_number as usize,
            tier: ProcessingTier::Expensive,
            items: vec![item],
        };

        let mut candidate = current.clone();
        match self.expensive.process(&request).await {
            Ok(response) => match response.answer(current.question_number) {
                Some(answer) if answer.value.is_some() => {
                    candidate.format_valid = answer
                        .value
                        .as_deref()
                        .map_or(true, |v| current.question_type.accepts_length(v));
                    candidate.value = answer.value.clone();
                    candidate.set_confidence(answer.confidence);
                    candidate.extraction_method = ExtractionMethod::ExpensiveTier;
                    candidate.tier = Some(ProcessingTier::Expensive);
                    candidate.tier_failed = false;
                }
                _ => candidate.tier_failed = true,
            },
            Err(e) => {
                warn!("题 {} expensive 层级重试失败: {}", current.question_number, e);
                candidate.tier_failed = true;
            }
        }
        candidate
    }
}

#[async_trait]
impl<'a> Reprocessor for SheetReprocessor<'a> {
    async fn reprocess(
        &self,
        current: &ExtractedAnswer,
        strategy: RecoveryStrategy,
        params: &RecoveryParameters,
    ) -> ExtractedAnswer {
        if params.method == ExtractionMethod::ExpensiveTier {
            return self.ask_expensive(current).await;
        }
        self.re_extract(current, Self::params_for(strategy, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(attempt: usize) -> RecoveryParameters {
        RecoveryParameters {
            attempt,
            noise_strength: 0.1 * (attempt + 1) as f32,
            method: ExtractionMethod::TemplateAware,
        }
    }

    #[test]
    fn refocus_tightens_tolerance() {
        let first = SheetReprocessor::params_for(RecoveryStrategy::RegionRefocus, &params(0));
        let second = SheetReprocessor::params_for(RecoveryStrategy::RegionRefocus, &params(1));
        let third = SheetReprocessor::params_for(RecoveryStrategy::RegionRefocus, &params(2));
        assert_eq!(first.tolerance_factor, 1.0);
        assert_eq!(second.tolerance_factor, 0.5);
        assert_eq!(third.tolerance_factor, 0.5);
    }

    #[test]
    fn other_strategies_keep_default_tolerance() {
        let p = SheetReprocessor::params_for(RecoveryStrategy::NoiseFiltering, &params(1));
        assert_eq!(p.tolerance_factor, DEFAULT_TOLERANCE_FACTOR);
        assert!((p.noise_strength - 0.2).abs() < 1e-6);
    }
}
