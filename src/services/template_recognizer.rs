//! 模板识别服务 - 业务能力层
//!
//! 先根据粗粒度结构线索判断主格式，再在模板库中为该格式挑选最匹配的模板。
//! 匹配不上时不报错，而是交给 `generic_layout` 推断一个低置信度的通用版面。

use crate::models::mark::Mark;
use crate::models::registry::TemplateRegistry;
use crate::models::template::{
    default_valid_answers, DocumentFormat, GridGeometry, SheetLayout, TemplateDefinition, TemplateElement,
    TemplateMatch,
};
use phf::phf_map;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// 文件名关键字 → 主格式
static FORMAT_KEYWORDS: phf::Map<&'static str, DocumentFormat> = phf_map! {
    "omr" => DocumentFormat::BubbleSheet,
    "bubble" => DocumentFormat::BubbleSheet,
    "scantron" => DocumentFormat::BubbleSheet,
    "essay" => DocumentFormat::TextBased,
    "written" => DocumentFormat::TextBased,
    "text" => DocumentFormat::TextBased,
    "mixed" => DocumentFormat::MixedFormat,
    "hybrid" => DocumentFormat::MixedFormat,
};

/// 模板元素判定时对网格外扩的像素
const GRID_SEARCH_BUFFER: f32 = 20.0;
/// 格式不一致时的匹配折扣
const FORMAT_MISMATCH_FACTOR: f32 = 0.85;
/// 文件名包含模板 ID 时的加分
const HINT_BONUS: f32 = 0.05;

/// 文件名分词
static TOKEN_SPLITTER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").ok());

/// 结构线索
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StructuralCues {
    pub bubble_like: usize,
    pub text_like: usize,
    pub total: usize,
}

impl StructuralCues {
    pub fn from_marks(marks: &[Mark]) -> Self {
        let bubble_like = marks.iter().filter(|m| m.is_bubble_like()).count();
        Self {
            bubble_like,
            text_like: marks.len() - bubble_like,
            total: marks.len(),
        }
    }

    pub fn bubble_share(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.bubble_like as f32 / self.total as f32
        }
    }
}

/// 根据结构线索与文件名判断主格式
pub fn classify_format(cues: StructuralCues, filename_hint: &str) -> Option<DocumentFormat> {
    let hinted = format_from_hint(filename_hint);

    // 墨迹太少时以文件名为准
    if cues.total < 4 {
        return hinted;
    }

    let share = cues.bubble_share();
    if share >= 0.7 && cues.bubble_like >= 4 {
        Some(DocumentFormat::BubbleSheet)
    } else if share <= 0.2 {
        Some(DocumentFormat::TextBased)
    } else {
        Some(DocumentFormat::MixedFormat)
    }
}

fn format_from_hint(filename_hint: &str) -> Option<DocumentFormat> {
    let splitter = TOKEN_SPLITTER.as_ref()?;
    let lowered = filename_hint.to_lowercase();
    let found = splitter
        .split(&lowered)
        .find_map(|token| FORMAT_KEYWORDS.get(token).copied());
    found
}

/// 候选模板：与主格式一致，或混合格式作为次选；格式未知时全部参与
fn is_candidate(template: &TemplateDefinition, format: Option<DocumentFormat>) -> bool {
    match format {
        Some(format) => template.format == format || template.format == DocumentFormat::MixedFormat,
        None => true,
    }
}

/// 模板识别器
pub trait TemplateRecognizer: Send + Sync {
    fn recognize(
        &self,
        marks: &[Mark],
        filename_hint: &str,
        registry: &TemplateRegistry,
    ) -> (TemplateMatch, Option<Arc<TemplateDefinition>>);
}

/// 基于必需元素比例的模板识别器
#[derive(Debug, Clone, Copy)]
pub struct StructuralTemplateRecognizer {
    pub min_confidence: f32,
}

impl StructuralTemplateRecognizer {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// 计算单个模板的匹配置信度与找到的元素
    pub fn score_template(
        &self,
        template: &TemplateDefinition,
        marks: &[Mark],
        format: Option<DocumentFormat>,
        filename_hint: &str,
    ) -> (f32, Vec<TemplateElement>) {
        let found: Vec<TemplateElement> = template
            .required_elements
            .iter()
            .copied()
            .filter(|element| element_present(template, *element, marks))
            .collect();

        let mut confidence = found.len() as f32 / template.required_elements.len().max(1) as f32;
        // 混合格式模板作为次选时打折
        if format.is_some_and(|f| f != template.format && template.format == DocumentFormat::MixedFormat) {
            confidence *= FORMAT_MISMATCH_FACTOR;
        }
        if !filename_hint.is_empty()
            && filename_hint
                .to_lowercase()
                .contains(&template.id.to_lowercase())
        {
            confidence += HINT_BONUS;
        }

        (confidence.clamp(0.0, 1.0), found)
    }
}

impl TemplateRecognizer for StructuralTemplateRecognizer {
    fn recognize(
        &self,
        marks: &[Mark],
        filename_hint: &str,
        registry: &TemplateRegistry,
    ) -> (TemplateMatch, Option<Arc<TemplateDefinition>>) {
        let cues = StructuralCues::from_marks(marks);
        let format = classify_format(cues, filename_hint);
        debug!(
            "结构线索: 气泡 {} / 其他 {} → 格式 {:?}",
            cues.bubble_like, cues.text_like, format
        );

        let mut best: Option<(f32, Vec<TemplateElement>, &Arc<TemplateDefinition>)> = None;
        for template in registry.iter().filter(|t| is_candidate(t, format)) {
            let (confidence, found) = self.score_template(template, marks, format, filename_hint);
            debug!("模板 {} 匹配度 {:.2}", template.id, confidence);
            // 同分时保留模板库顺序中靠前的
            if best.as_ref().map_or(true, |(c, _, _)| confidence > *c) {
                best = Some((confidence, found, template));
            }
        }

        match best {
            Some((confidence, found, template)) if confidence >= self.min_confidence => (
                TemplateMatch {
                    template_id: Some(template.id.clone()),
                    confidence,
                    detected_elements: found,
                    format: format.or(Some(template.format)),
                },
                Some(Arc::clone(template)),
            ),
            Some((confidence, _, _)) => (TemplateMatch::unmatched(format, confidence), None),
            None => (TemplateMatch::unmatched(format, 0.0), None),
        }
    }
}

fn element_present(template: &TemplateDefinition, element: TemplateElement, marks: &[Mark]) -> bool {
    match element {
        TemplateElement::BubbleGrid => template.grid.map_or(false, |grid| {
            let area = grid.bounds().expand(GRID_SEARCH_BUFFER);
            marks
                .iter()
                .any(|m| m.is_bubble_like() && area.contains_point(m.center()))
        }),
        TemplateElement::HeaderRegion => template
            .header
            .map_or(false, |rect| marks.iter().any(|m| m.rect().intersects(&rect))),
        TemplateElement::StudentIdRegion => template
            .student_id
            .map_or(false, |rect| marks.iter().any(|m| m.rect().intersects(&rect))),
        TemplateElement::TextAnswerBoxes => template
            .text_fields
            .iter()
            .any(|field| marks.iter().any(|m| m.rect().intersects(&field.rect))),
    }
}

/// 没有模板时，根据气泡状墨迹推断通用网格
///
/// 行、列由墨迹中心按半径聚类得到，间距取相邻聚类差值的中位数。
pub fn generic_layout(
    marks: &[Mark],
    format: Option<DocumentFormat>,
    expected_question_count: Option<usize>,
) -> Option<SheetLayout> {
    let bubbles: Vec<&Mark> = marks.iter().filter(|m| m.is_bubble_like()).collect();
    if bubbles.is_empty() {
        return None;
    }

    let mut radii: Vec<f32> = bubbles.iter().map(|m| (m.width + m.height) / 4.0).collect();
    let radius = median(&mut radii)?;
    let default_spacing = radius * 4.0;

    let rows = cluster_positions(bubbles.iter().map(|m| m.center().1).collect(), radius);
    let columns = cluster_positions(bubbles.iter().map(|m| m.center().0).collect(), radius);

    let spacing_y = median_gap(&rows).unwrap_or(default_spacing);
    let spacing_x = median_gap(&columns).unwrap_or(default_spacing);
    let start_x = *columns.first()?;
    let start_y = *rows.first()?;
    let end_x = *columns.last()?;
    let end_y = *rows.last()?;

    let mut valid_answers = default_valid_answers();
    valid_answers.push("E".to_string());
    let column_count = (((end_x - start_x) / spacing_x).round() as u32 + 1).clamp(4, 5);
    valid_answers.truncate(column_count as usize);

    let observed_rows = ((end_y - start_y) / spacing_y).round() as u32 + 1;
    let row_count = expected_question_count
        .map(|n| (n as u32).max(observed_rows))
        .unwrap_or(observed_rows);

    let grid = GridGeometry {
        rows: row_count,
        columns: column_count,
        spacing_x,
        spacing_y,
        start_x,
        start_y,
        bubble_radius: radius,
        first_question: 1,
    };

    Some(SheetLayout::generic(
        format.unwrap_or(DocumentFormat::BubbleSheet),
        grid,
        valid_answers,
        expected_question_count,
    ))
}

/// 一维聚类：相距不超过 tolerance 的位置合并为一个聚类中心
fn cluster_positions(mut values: Vec<f32>, tolerance: f32) -> Vec<f32> {
    values.sort_by(|a, b| a.total_cmp(b));
    let mut clusters: Vec<(f32, usize)> = Vec::new();
    for v in values {
        match clusters.last_mut() {
            Some((sum, count)) if v - *sum / *count as f32 <= tolerance => {
                *sum += v;
                *count += 1;
            }
            _ => clusters.push((v, 1)),
        }
    }
    clusters.into_iter().map(|(sum, count)| sum / count as f32).collect()
}

fn median_gap(positions: &[f32]) -> Option<f32> {
    let mut gaps: Vec<f32> = positions.windows(2).map(|w| w[1] - w[0]).collect();
    median(&mut gaps)
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}
