//! 手写判别服务
//!
//! 对每个墨迹计算笔画特征与手写分数，决定保留、降权还是丢弃。

use crate::models::geometry::{clamp_unit, distance, Rect};
use crate::models::mark::{ClassifiedMark, FilterDecision, HandwritingVerdict, Mark, MarkType, StrokeFeatures};
use crate::services::roi_manager::ProcessingRegion;
use std::f32::consts::{FRAC_PI_4, PI};

/// 填涂区域内的判别阈值
pub const BUBBLE_REGION_THRESHOLD: f32 = 0.4;
/// 其他区域的判别阈值
pub const OTHER_REGION_THRESHOLD: f32 = 0.6;
/// 超过该手写置信度直接丢弃
pub const DISCARD_CONFIDENCE: f32 = 0.7;
/// 达到该手写置信度开始降权
pub const PENALTY_CONFIDENCE: f32 = 0.5;
/// 降权系数
pub const HANDWRITING_PENALTY: f32 = 0.8;

/// 判别时需要的版面上下文
#[derive(Debug, Clone, Copy)]
pub struct DiscriminationContext<'a> {
    pub bubble_centers: &'a [(f32, f32)],
    pub bubble_radius: f32,
    pub regions: &'a ProcessingRegion,
}

impl DiscriminationContext<'_> {
    fn expected_area(&self) -> f32 {
        PI * self.bubble_radius * self.bubble_radius
    }

    fn near_bubble(&self, point: (f32, f32)) -> bool {
        let reach = 2.0 * self.bubble_radius;
        self.bubble_centers.iter().any(|c| distance(*c, point) <= reach)
    }
}

/// 手写判别器
pub trait HandwritingDiscriminator: Send + Sync {
    fn classify(&self, mark: &Mark, ctx: &DiscriminationContext<'_>) -> HandwritingVerdict;

    /// 批量判别
    fn classify_all(&self, marks: &[Mark], ctx: &DiscriminationContext<'_>) -> Vec<ClassifiedMark> {
        marks
            .iter()
            .map(|mark| ClassifiedMark {
                mark: *mark,
                verdict: self.classify(mark, ctx),
            })
            .collect()
    }
}

/// 基于几何特征的判别器
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricDiscriminator;

/// 从墨迹计算笔画特征
pub fn stroke_features(mark: &Mark) -> StrokeFeatures {
    let aspect = mark.aspect_ratio();
    let irregularity = if aspect > 0.0 {
        (aspect.max(1.0 / aspect) - 1.0).min(1.0)
    } else {
        1.0
    };
    let perimeter_half = mark.width + mark.height;
    let stroke_width = if perimeter_half > 0.0 {
        2.0 * mark.area / perimeter_half
    } else {
        0.0
    };
    let consistency = clamp_unit(1.0 - (mark.fill_ratio() - FRAC_PI_4).abs() / FRAC_PI_4);

    StrokeFeatures {
        irregularity,
        stroke_width,
        pressure: clamp_unit(mark.intensity),
        consistency,
    }
}

impl HandwritingDiscriminator for GeometricDiscriminator {
    fn classify(&self, mark: &Mark, ctx: &DiscriminationContext<'_>) -> HandwritingVerdict {
        let features = stroke_features(mark);
        let center = mark.center();
        let near = ctx.near_bubble(center);
        let expected = ctx.expected_area();
        let in_band = mark.area >= 0.4 * expected && mark.area <= 1.6 * expected;

        let score = features.irregularity * 0.4
            + (1.0 - features.consistency) * 0.3
            + if near { 0.0 } else { 0.2 }
            + if in_band { 0.0 } else { 0.1 };

        let in_grid = ctx.regions.in_bubble_region(center);
        let threshold = if in_grid {
            BUBBLE_REGION_THRESHOLD
        } else {
            OTHER_REGION_THRESHOLD
        };
        let confidence = clamp_unit(score);
        let is_handwriting = score > threshold;

        let mark_type = resolve_mark_type(mark, &features, near, in_band, expected);
        // 填涂区域内的手写墨迹不能当作答案
        let decision = if in_grid && is_handwriting && mark_type != MarkType::BubbleFill {
            FilterDecision::Discard
        } else {
            filter_decision(mark_type, confidence)
        };

        HandwritingVerdict {
            is_handwriting,
            confidence,
            mark_type,
            stroke_features: features,
            near_bubble: near,
            threshold,
            decision,
        }
    }
}

fn resolve_mark_type(mark: &Mark, f: &StrokeFeatures, near: bool, in_band: bool, expected: f32) -> MarkType {
    if near && f.irregularity < 0.3 && f.consistency >= 0.6 && in_band {
        MarkType::BubbleFill
    } else if f.pressure < 0.35 && mark.area >= 0.8 * expected {
        MarkType::Erasure
    } else if f.irregularity >= 0.5 {
        if mark.area <= 4.0 * expected {
            MarkType::Text
        } else {
            MarkType::ScratchWork
        }
    } else if f.irregularity >= 0.3 && !near {
        MarkType::Doodle
    } else {
        MarkType::Unknown
    }
}

/// 根据类型与手写置信度决定如何处理
pub fn filter_decision(mark_type: MarkType, confidence: f32) -> FilterDecision {
    if mark_type == MarkType::Erasure || confidence > DISCARD_CONFIDENCE {
        FilterDecision::Discard
    } else if confidence >= PENALTY_CONFIDENCE {
        FilterDecision::KeepPenalized {
            penalty: HANDWRITING_PENALTY,
        }
    } else {
        FilterDecision::Keep
    }
}

/// 书写类墨迹在字段区域之外时，作为手写噪声区域交给 ROI 细化
pub fn noise_regions(classified: &[ClassifiedMark], regions: &ProcessingRegion) -> Vec<Rect> {
    classified
        .iter()
        .filter(|c| c.verdict.mark_type.is_writing())
        .filter(|c| !regions.in_field_region(c.mark.center()))
        .map(|c| c.mark.rect())
        .collect()
}
