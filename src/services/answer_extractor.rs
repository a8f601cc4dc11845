//! 答案提取服务 - 业务能力层
//!
//! 每次只处理一道题：选择题按网格位置映射墨迹，文字题交给文字识别原语。

use crate::infrastructure::document_image::DocumentImage;
use crate::infrastructure::text_reader::TextReader;
use crate::models::answer::{AttributedMark, BubbleQuality, ExtractedAnswer, ExtractionMethod, QuestionType};
use crate::models::geometry::{clamp_unit, distance, Rect};
use crate::models::mark::{ClassifiedMark, FilterDecision};
use crate::models::template::{GridGeometry, QuestionSpec, SheetLayout};
use crate::services::handwriting::DISCARD_CONFIDENCE;
use crate::services::roi_manager::ProcessingRegion;

/// 默认位置容差（相对选项间距）
pub const DEFAULT_TOLERANCE_FACTOR: f32 = 1.5;

/// 提取参数，恢复阶段会逐次调整
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionParams {
    pub method: ExtractionMethod,
    /// 噪声过滤强度，越大丢弃的可疑墨迹越多、排除区域惩罚越轻
    pub noise_strength: f32,
    /// 位置容差 = tolerance_factor × 选项间距
    pub tolerance_factor: f32,
}

impl ExtractionParams {
    pub fn initial(method: ExtractionMethod) -> Self {
        Self {
            method,
            noise_strength: 0.0,
            tolerance_factor: DEFAULT_TOLERANCE_FACTOR,
        }
    }
}

/// 提取时只读的文档上下文
pub struct ExtractionInput<'a> {
    pub layout: &'a SheetLayout,
    pub regions: &'a ProcessingRegion,
    pub classified: &'a [ClassifiedMark],
    pub image: &'a DocumentImage,
    pub text_reader: &'a dyn TextReader,
}

/// 答案提取器
pub trait AnswerExtractor: Send + Sync {
    fn extract(&self, question: QuestionSpec, input: &ExtractionInput<'_>, params: &ExtractionParams) -> ExtractedAnswer;

    /// 提取版面上的全部题目
    fn extract_all(&self, input: &ExtractionInput<'_>, params: &ExtractionParams) -> Vec<ExtractedAnswer> {
        input
            .layout
            .questions()
            .iter()
            .map(|q| self.extract(*q, input, params))
            .collect()
    }
}

/// 基于版面几何的提取器
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateAwareExtractor;

impl AnswerExtractor for TemplateAwareExtractor {
    fn extract(&self, question: QuestionSpec, input: &ExtractionInput<'_>, params: &ExtractionParams) -> ExtractedAnswer {
        match question.question_type {
            QuestionType::MultipleChoice => extract_choice(question.number, input, params),
            other => extract_text(question.number, other, input, params),
        }
    }
}

/// 偏移校正：取网格内墨迹相对最近期望中心偏移的中位数
pub fn estimate_grid_offset(grid: &GridGeometry, classified: &[ClassifiedMark]) -> (f32, f32) {
    let search = grid.bounds().expand(grid.spacing_x);
    let mut dx = Vec::new();
    let mut dy = Vec::new();
    for c in classified.iter().filter(|c| c.verdict.decision.is_kept()) {
        let center = c.mark.center();
        if !search.contains_point(center) {
            continue;
        }
        let row = grid.nearest_row(center.1);
        let column = nearest_column(grid, center.0);
        let expected = grid.option_center(row, column);
        dx.push(center.0 - expected.0);
        dy.push(center.1 - expected.1);
    }
    (median(&mut dx), median(&mut dy))
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

fn nearest_column(grid: &GridGeometry, x: f32) -> u32 {
    if grid.columns == 0 || grid.spacing_x <= 0.0 {
        return 0;
    }
    let column = ((x - grid.start_x) / grid.spacing_x).round();
    column.clamp(0.0, (grid.columns - 1) as f32) as u32
}

fn extract_choice(number: u32, input: &ExtractionInput<'_>, params: &ExtractionParams) -> ExtractedAnswer {
    let layout = input.layout;
    let method = if layout.generic && params.method == ExtractionMethod::TemplateAware {
        ExtractionMethod::GenericGrid
    } else {
        params.method
    };
    let mut answer = ExtractedAnswer::empty(number, QuestionType::MultipleChoice, method);

    let Some(grid) = layout.grid else {
        return answer;
    };
    let Some(row) = grid.row_of(number) else {
        return answer;
    };

    let offset = if method == ExtractionMethod::OffsetCorrected {
        estimate_grid_offset(&grid, input.classified)
    } else {
        (0.0, 0.0)
    };

    let tolerance = params.tolerance_factor * grid.option_spacing();
    let row_y = grid.option_center(row, 0).1;
    let band = (grid.spacing_y * 0.5).max(grid.bubble_radius);
    let first_x = grid.start_x - 2.0 * tolerance;
    let last_x = grid.option_center(row, grid.columns.saturating_sub(1)).0 + 2.0 * tolerance;

    // 本行附近的全部墨迹（包括被判为噪声的）
    let in_row: Vec<&ClassifiedMark> = input
        .classified
        .iter()
        .filter(|c| {
            let (x, y) = c.mark.center();
            let (x, y) = (x - offset.0, y - offset.1);
            (y - row_y).abs() <= band && x >= first_x && x <= last_x
        })
        .collect();

    let discard_above = DISCARD_CONFIDENCE - params.noise_strength;
    let darkest = in_row.iter().map(|c| c.mark.intensity).fold(0.0f32, f32::max);
    let expected_area = grid.expected_bubble_area();

    let mut filtered_any = params.noise_strength > 0.0;
    let mut penalty = 1.0f32;
    let mut overlaps_exclusion = false;
    let mut handwriting_overlap = false;
    let mut mark_confidences = Vec::new();

    for c in &in_row {
        let kept = c.verdict.decision.is_kept() && c.verdict.confidence <= discard_above;
        if !kept {
            filtered_any = true;
            continue;
        }
        let center = c.mark.center();
        let corrected = (center.0 - offset.0, center.1 - offset.1);
        let column = nearest_column(&grid, corrected.0);
        let expected = grid.option_center(row, column);
        let deviation = distance(corrected, expected);
        if deviation > tolerance {
            answer.rejected_marks += 1;
            continue;
        }

        let rect = c.mark.rect();
        let exclusion = softened_penalty(input.regions, &rect, params.noise_strength);
        if input.regions.overlaps_exclusion(&rect) {
            overlaps_exclusion = true;
        }
        if input.regions.overlaps_handwriting(&rect) {
            handwriting_overlap = true;
        }
        if let FilterDecision::KeepPenalized { penalty: p } = c.verdict.decision {
            penalty = penalty.min(p);
            filtered_any = true;
        }

        let base = (0.5 + 0.5 * clamp_unit(c.mark.intensity)) * (1.0 - 0.5 * deviation / tolerance);
        let confidence = clamp_unit(
            base * layout.base_confidence_factor() * exclusion * c.verdict.decision.penalty(),
        );
        mark_confidences.push(confidence);
        answer.marks.push(AttributedMark {
            mark: c.mark,
            column,
            expected_center: expected,
            deviation,
            handwriting_confidence: c.verdict.confidence,
        });
    }

    answer.noise_filtered = filtered_any;
    answer.overlaps_exclusion = overlaps_exclusion;
    answer.handwriting_overlap = handwriting_overlap;
    answer.review_flag = overlaps_exclusion || penalty < 1.0 || answer.rejected_marks > 0;
    answer.bounding_box = answer
        .marks
        .iter()
        .map(|m| m.mark.rect())
        .reduce(|a, b| a.union(&b))
        .or_else(|| Some(row_rect(&grid, row)));

    let mut columns: Vec<u32> = answer.marks.iter().map(|m| m.column).collect();
    columns.sort_unstable();
    columns.dedup();

    match columns.len() {
        0 => {
            answer.bubble_quality = BubbleQuality::Empty;
            answer.set_confidence(0.0);
        }
        1 => {
            // 同一选项上断开的几块墨迹算一次填涂
            let primary = answer
                .marks
                .iter()
                .copied()
                .min_by(|a, b| a.deviation.total_cmp(&b.deviation));
            if let Some(primary) = primary {
                let fill_area: f32 = answer.marks.iter().map(|m| m.mark.area).sum();
                let intensity = answer.marks.iter().map(|m| m.mark.intensity).fold(0.0f32, f32::max);
                answer.value = layout.option_label(primary.column).map(str::to_string);
                answer.bubble_quality = BubbleQuality::classify(intensity, fill_area / expected_area);
                answer.cross_validated = primary.deviation <= grid.bubble_radius && intensity >= darkest;
                answer.set_confidence(mark_confidences.iter().copied().fold(0.0f32, f32::max));
            }
        }
        _ => {
            // 多个填涂：不挑选，交给校验
            answer.multiple_marks = true;
            let strongest = answer
                .marks
                .iter()
                .max_by(|a, b| a.mark.intensity.total_cmp(&b.mark.intensity))
                .map(|m| BubbleQuality::classify(m.mark.intensity, m.mark.area / expected_area))
                .unwrap_or(BubbleQuality::Unknown);
            answer.bubble_quality = strongest;
            let mean = mark_confidences.iter().sum::<f32>() / mark_confidences.len() as f32;
            answer.set_confidence(mean * 0.5);
        }
    }
    answer
}

fn extract_text(
    number: u32,
    question_type: QuestionType,
    input: &ExtractionInput<'_>,
    params: &ExtractionParams,
) -> ExtractedAnswer {
    let method = match params.method {
        ExtractionMethod::TemplateAware | ExtractionMethod::OffsetCorrected | ExtractionMethod::GenericGrid => {
            ExtractionMethod::TextRecognition
        }
        other => other,
    };
    let mut answer = ExtractedAnswer::empty(number, question_type, method);

    let Some(field) = input.layout.text_field(number) else {
        return answer;
    };
    let rect = field.rect;
    answer.bounding_box = Some(rect);
    answer.overlaps_exclusion = input.regions.overlaps_exclusion(&rect);
    answer.handwriting_overlap = input.regions.overlaps_handwriting(&rect);
    answer.noise_filtered = params.noise_strength > 0.0;

    let penalty = input
        .classified
        .iter()
        .filter(|c| rect.contains_point(c.mark.center()))
        .map(|c| c.verdict.decision)
        .filter_map(|d| match d {
            FilterDecision::KeepPenalized { penalty } => Some(penalty),
            _ => None,
        })
        .fold(1.0f32, f32::min);
    if penalty < 1.0 {
        answer.noise_filtered = true;
    }
    answer.review_flag = answer.overlaps_exclusion || penalty < 1.0;

    if let Some(reading) = input.text_reader.read(input.image, &rect, number) {
        answer.format_valid = question_type.accepts_length(&reading.text);
        answer.value = Some(reading.text);
        let exclusion = softened_penalty(input.regions, &rect, params.noise_strength);
        answer.set_confidence(reading.confidence * exclusion * penalty);
    }
    answer
}

/// 排除区域惩罚；噪声过滤越强惩罚越轻
fn softened_penalty(regions: &ProcessingRegion, rect: &Rect, noise_strength: f32) -> f32 {
    let penalty = regions.exclusion_penalty(rect);
    if penalty < 1.0 {
        (penalty + noise_strength).min(1.0)
    } else {
        penalty
    }
}

fn row_rect(grid: &GridGeometry, row: u32) -> Rect {
    let (x, y) = grid.option_center(row, 0);
    let r = grid.bubble_radius;
    Rect::new(
        x - r,
        y - r,
        grid.columns.saturating_sub(1) as f32 * grid.spacing_x + 2.0 * r,
        2.0 * r,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::text_reader::{NoTextReader, TextReading};
    use crate::models::mark::Mark;
    use crate::models::registry::TemplateRegistry;
    use crate::services::handwriting::{DiscriminationContext, GeometricDiscriminator, HandwritingDiscriminator};
    use crate::services::roi_manager::RoiManager;

    struct FixedReader(String);

    impl TextReader for FixedReader {
        fn read(&self, _image: &DocumentImage, _region: &Rect, _question_number: u32) -> Option<TextReading> {
            Some(TextReading {
                text: self.0.clone(),
                confidence: 0.9,
            })
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn run(template_id: &str, marks: &[Mark], noise: &[Rect], reader: &dyn TextReader, q: u32) -> ExtractedAnswer {
        let registry = TemplateRegistry::with_builtins();
        let template = registry.get(template_id).unwrap();
        let layout = SheetLayout::from_template(&template, None);
        let regions = RoiManager::new(20.0, 0.7).build(&layout, (850.0, 1100.0), noise);
        let centers = layout.bubble_centers();
        let ctx = DiscriminationContext {
            bubble_centers: &centers,
            bubble_radius: layout.bubble_radius(),
            regions: &regions,
        };
        let classified = GeometricDiscriminator.classify_all(marks, &ctx);
        let image = DocumentImage::blank(850, 1100);
        let input = ExtractionInput {
            layout: &layout,
            regions: &regions,
            classified: &classified,
            image: &image,
            text_reader: reader,
        };
        let spec = *layout.questions().iter().find(|s| s.number == q).unwrap();
        TemplateAwareExtractor.extract(spec, &input, &ExtractionParams::initial(ExtractionMethod::TemplateAware))
    }

    #[test]
    fn single_centered_mark_yields_option() {
        // 第 3 题选 C
        let marks = [Mark::filled_circle(330.0, 330.0, 10.0, 0.9)];
        let answer = run("omr_20q_abcd", &marks, &[], &NoTextReader, 3);

        assert_eq!(answer.value.as_deref(), Some("C"));
        assert!(answer.cross_validated);
        assert!(!answer.review_flag);
        assert_eq!(answer.bubble_quality, BubbleQuality::Heavy);
        assert_eq!(answer.max_deviation(), Some(0.0));
        assert!((answer.confidence - 0.95).abs() < 1e-4);
    }

    #[test]
    fn two_marks_yield_no_value() {
        let marks = [
            Mark::filled_circle(250.0, 410.0, 10.0, 0.9),
            Mark::filled_circle(330.0, 410.0, 10.0, 0.9),
        ];
        let answer = run("omr_20q_abcd", &marks, &[], &NoTextReader, 5);

        assert!(answer.multiple_marks);
        assert!(answer.value.is_none());
        assert_eq!(answer.marks.len(), 2);
    }

    #[test]
    fn blank_row_is_empty() {
        let answer = run("omr_20q_abcd", &[], &[], &NoTextReader, 7);
        assert!(answer.value.is_none());
        assert_eq!(answer.bubble_quality, BubbleQuality::Empty);
        assert_eq!(answer.confidence, 0.0);
    }

    #[test]
    fn out_of_tolerance_mark_is_rejected() {
        // 距 D 选项 70 px，超过 1.5 × 40
        let marks = [Mark::filled_circle(440.0, 290.0, 10.0, 0.9)];
        let answer = run("omr_20q_abcd", &marks, &[], &NoTextReader, 2);

        assert!(answer.value.is_none());
        assert_eq!(answer.rejected_marks, 1);
        assert!(answer.review_flag);
    }

    #[test]
    fn text_answer_is_penalized_inside_noise() {
        let noise = [Rect::new(120.0, 210.0, 100.0, 30.0)];
        let answer = run("short_answer_10q", &[], &noise, &FixedReader("photosynthesis".to_string()), 1);

        assert_eq!(answer.value.as_deref(), Some("photosynthesis"));
        assert!(answer.format_valid);
        assert!(answer.handwriting_overlap);
        assert!((answer.confidence - 0.63).abs() < 1e-4);
    }

    #[test]
    fn overlong_text_is_kept_but_invalid() {
        let answer = run("short_answer_10q", &[], &[], &FixedReader("x".repeat(120)), 2);
        assert!(answer.value.is_some());
        assert!(!answer.format_valid);
    }

    #[test]
    fn split_fill_on_one_option_is_single_answer() {
        let marks = [
            Mark::new(319.0, 319.0, 14.0, 14.0, 0.9, 150.0),
            Mark::new(327.0, 327.0, 14.0, 14.0, 0.9, 150.0),
        ];
        let answer = run("omr_20q_abcd", &marks, &[], &NoTextReader, 3);

        assert!(!answer.multiple_marks);
        assert_eq!(answer.value.as_deref(), Some("C"));
        assert_eq!(answer.marks.len(), 2);
        assert!(answer.cross_validated);
    }

    #[test]
    fn handwritten_stroke_on_option_is_not_an_answer() {
        // 第 3 题 B 选项上的细长笔画
        let marks = [Mark::new(275.0, 322.5, 30.0, 15.0, 0.9, 300.0)];
        let answer = run("omr_20q_abcd", &marks, &[], &NoTextReader, 3);

        assert!(answer.value.is_none());
        assert!(answer.marks.is_empty());
        assert!(answer.noise_filtered);
        assert_eq!(answer.bubble_quality, BubbleQuality::Empty);
    }

    #[test]
    fn essay_length_lower_bound() {
        let short = run("mixed_10mc_4text", &[], &[], &FixedReader("x".repeat(9)), 14);
        assert_eq!(short.question_type, QuestionType::Essay);
        assert_eq!(short.value.as_deref(), Some("xxxxxxxxx"));
        assert!(!short.format_valid);

        let enough = run("mixed_10mc_4text", &[], &[], &FixedReader("x".repeat(10)), 14);
        assert!(enough.format_valid);
    }

    #[test]
    fn text_length_lower_bound() {
        let empty = run("short_answer_10q", &[], &[], &FixedReader(String::new()), 3);
        assert_eq!(empty.value.as_deref(), Some(""));
        assert!(!empty.format_valid);

        let single = run("short_answer_10q", &[], &[], &FixedReader("a".to_string()), 3);
        assert!(single.format_valid);
    }

    #[test]
    fn offset_correction_recovers_shifted_grid() {
        let registry = TemplateRegistry::with_builtins();
        let template = registry.get("omr_20q_abcd").unwrap();
        let layout = SheetLayout::from_template(&template, None);
        let grid = layout.grid.unwrap();
        let marks: Vec<Mark> = (0..5)
            .map(|row| {
                let (x, y) = grid.option_center(row, 1);
                Mark::filled_circle(x + 12.0, y + 8.0, 10.0, 0.9)
            })
            .collect();
        let classified: Vec<ClassifiedMark> = {
            let regions = RoiManager::new(20.0, 0.7).build(&layout, (850.0, 1100.0), &[]);
            let centers = layout.bubble_centers();
            let ctx = DiscriminationContext {
                bubble_centers: &centers,
                bubble_radius: 10.0,
                regions: &regions,
            };
            GeometricDiscriminator.classify_all(&marks, &ctx)
        };
        let (dx, dy) = estimate_grid_offset(&grid, &classified);
        assert_eq!((dx, dy), (12.0, 8.0));
    }
}
