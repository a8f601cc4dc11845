use crate::models::geometry::{clamp_unit, Rect};
use crate::models::mark::Mark;
use crate::models::routing::ProcessingTier;
use serde::{Deserialize, Serialize};

/// 题型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    Text,
    Essay,
    Unknown,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::MultipleChoice => "multiple_choice",
            QuestionType::Text => "text",
            QuestionType::Essay => "essay",
            QuestionType::Unknown => "unknown",
        }
    }

    /// 文字作答的长度范围（字符数，闭区间）
    pub fn length_bounds(&self) -> Option<(usize, usize)> {
        match self {
            QuestionType::Text => Some((1, 100)),
            QuestionType::Essay => Some((10, 1000)),
            _ => None,
        }
    }

    /// 值的长度是否在范围内
    pub fn accepts_length(&self, value: &str) -> bool {
        match self.length_bounds() {
            Some((min, max)) => {
                let len = value.chars().count();
                len >= min && len <= max
            }
            None => true,
        }
    }
}

/// 提取方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// 基于模板网格的位置映射
    TemplateAware,
    /// 推断网格上的位置映射
    GenericGrid,
    /// 文字识别原语
    TextRecognition,
    /// 先估计整体网格偏移再映射
    OffsetCorrected,
    /// cheap 层级返回
    CheapTier,
    /// expensive 层级返回
    ExpensiveTier,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::TemplateAware => "template_aware",
            ExtractionMethod::GenericGrid => "generic_grid",
            ExtractionMethod::TextRecognition => "text_recognition",
            ExtractionMethod::OffsetCorrected => "offset_corrected",
            ExtractionMethod::CheapTier => "cheap_tier",
            ExtractionMethod::ExpensiveTier => "expensive_tier",
        }
    }
}

/// 气泡填涂质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleQuality {
    Heavy,
    Medium,
    Light,
    Empty,
    Overfilled,
    Unknown,
    /// 非选择题
    NotApplicable,
}

impl BubbleQuality {
    /// 由墨迹深度与面积比例判断
    pub fn classify(intensity: f32, area_ratio: f32) -> Self {
        if area_ratio > 1.6 {
            BubbleQuality::Overfilled
        } else if intensity >= 0.75 {
            BubbleQuality::Heavy
        } else if intensity >= 0.5 {
            BubbleQuality::Medium
        } else if intensity > 0.0 {
            BubbleQuality::Light
        } else {
            BubbleQuality::Unknown
        }
    }
}

/// 已归属到某个选项的墨迹
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributedMark {
    pub mark: Mark,
    pub column: u32,
    pub expected_center: (f32, f32),
    /// 与期望中心的欧氏距离
    pub deviation: f32,
    pub handwriting_confidence: f32,
}

/// 单题提取结果
///
/// 每次恢复尝试都会产生新的候选，只保留置信度最高的一个。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedAnswer {
    pub question_number: u32,
    pub question_type: QuestionType,
    pub value: Option<String>,
    pub confidence: f32,
    pub bounding_box: Option<Rect>,
    pub extraction_method: ExtractionMethod,
    /// 是否经过手写噪声过滤
    pub noise_filtered: bool,
    /// 归属到该题的墨迹（多选时保留全部供校验）
    pub marks: Vec<AttributedMark>,
    pub multiple_marks: bool,
    /// 文字长度是否合规
    pub format_valid: bool,
    pub review_flag: bool,
    pub cross_validated: bool,
    pub bubble_quality: BubbleQuality,
    /// 与排除区域重叠
    pub overlaps_exclusion: bool,
    /// 与手写区域重叠
    pub handwriting_overlap: bool,
    /// 超出容差被拒绝的墨迹数
    pub rejected_marks: usize,
    /// 处理该题的层级
    pub tier: Option<ProcessingTier>,
    /// 层级调用失败，保留原候选
    pub tier_failed: bool,
}

impl ExtractedAnswer {
    /// 空结果（零置信度）
    pub fn empty(question_number: u32, question_type: QuestionType, method: ExtractionMethod) -> Self {
        Self {
            question_number,
            question_type,
            value: None,
            confidence: 0.0,
            bounding_box: None,
            extraction_method: method,
            noise_filtered: false,
            marks: Vec::new(),
            multiple_marks: false,
            format_valid: true,
            review_flag: false,
            cross_validated: false,
            bubble_quality: if question_type == QuestionType::MultipleChoice {
                BubbleQuality::Empty
            } else {
                BubbleQuality::NotApplicable
            },
            overlaps_exclusion: false,
            handwriting_overlap: false,
            rejected_marks: 0,
            tier: None,
            tier_failed: false,
        }
    }

    /// 设置置信度（自动限制在 [0, 1]）
    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = clamp_unit(confidence);
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.set_confidence(confidence);
        self
    }

    /// 最大几何偏差
    pub fn max_deviation(&self) -> Option<f32> {
        self.marks
            .iter()
            .map(|m| m.deviation)
            .fold(None, |acc, d| Some(acc.map_or(d, |a: f32| a.max(d))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_length_bounds() {
        assert!(QuestionType::Text.accepts_length("x"));
        assert!(!QuestionType::Text.accepts_length(""));
        assert!(!QuestionType::Text.accepts_length(&"x".repeat(101)));
        assert!(!QuestionType::Essay.accepts_length("too short"));
        assert!(QuestionType::Essay.accepts_length("long enough answer"));
        assert!(QuestionType::MultipleChoice.accepts_length(""));
    }

    #[test]
    fn set_confidence_clamps() {
        let answer = ExtractedAnswer::empty(1, QuestionType::Text, ExtractionMethod::TextRecognition)
            .with_confidence(1.4);
        assert_eq!(answer.confidence, 1.0);
        assert_eq!(answer.bubble_quality, BubbleQuality::NotApplicable);
    }

    #[test]
    fn bubble_quality_classification() {
        assert_eq!(BubbleQuality::classify(0.9, 1.0), BubbleQuality::Heavy);
        assert_eq!(BubbleQuality::classify(0.6, 1.0), BubbleQuality::Medium);
        assert_eq!(BubbleQuality::classify(0.3, 1.0), BubbleQuality::Light);
        assert_eq!(BubbleQuality::classify(0.9, 2.0), BubbleQuality::Overfilled);
    }
}
