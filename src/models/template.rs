//! 答题卡模板定义
//!
//! 模板在启动时加载一次，之后只读。`SheetLayout` 是单份文档实际使用的版面：
//! 匹配到模板时由模板生成，否则由识别器根据墨迹推断（generic）。

use crate::models::answer::QuestionType;
use crate::models::geometry::Rect;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// 文档主格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    BubbleSheet,
    TextBased,
    MixedFormat,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::BubbleSheet => "bubble_sheet",
            DocumentFormat::TextBased => "text_based",
            DocumentFormat::MixedFormat => "mixed_format",
        }
    }
}

/// 填涂网格几何
///
/// 每一行对应一道选择题，每一列对应一个选项。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub rows: u32,
    pub columns: u32,
    pub spacing_x: f32,
    pub spacing_y: f32,
    pub start_x: f32,
    pub start_y: f32,
    pub bubble_radius: f32,
    #[serde(default = "default_first_question")]
    pub first_question: u32,
}

fn default_first_question() -> u32 {
    1
}

impl GridGeometry {
    /// 第 row 行第 column 列气泡的中心
    pub fn option_center(&self, row: u32, column: u32) -> (f32, f32) {
        (
            self.start_x + column as f32 * self.spacing_x,
            self.start_y + row as f32 * self.spacing_y,
        )
    }

    /// 网格外接矩形（含气泡半径）
    pub fn bounds(&self) -> Rect {
        let r = self.bubble_radius;
        let width = self.columns.saturating_sub(1) as f32 * self.spacing_x + 2.0 * r;
        let height = self.rows.saturating_sub(1) as f32 * self.spacing_y + 2.0 * r;
        Rect::new(self.start_x - r, self.start_y - r, width, height)
    }

    /// 选项间距，用作位置容差的基准
    pub fn option_spacing(&self) -> f32 {
        self.spacing_x
    }

    /// 单个气泡的期望面积
    pub fn expected_bubble_area(&self) -> f32 {
        PI * self.bubble_radius * self.bubble_radius
    }

    pub fn question_number(&self, row: u32) -> u32 {
        self.first_question + row
    }

    /// 题号对应的行
    pub fn row_of(&self, question_number: u32) -> Option<u32> {
        question_number
            .checked_sub(self.first_question)
            .filter(|row| *row < self.rows)
    }

    /// y 坐标最近的行
    pub fn nearest_row(&self, y: f32) -> u32 {
        if self.rows == 0 || self.spacing_y <= 0.0 {
            return 0;
        }
        let row = ((y - self.start_y) / self.spacing_y).round();
        row.clamp(0.0, (self.rows - 1) as f32) as u32
    }

    /// 所有期望气泡中心
    pub fn bubble_centers(&self) -> Vec<(f32, f32)> {
        let mut centers = Vec::with_capacity((self.rows * self.columns) as usize);
        for row in 0..self.rows {
            for column in 0..self.columns {
                centers.push(self.option_center(row, column));
            }
        }
        centers
    }
}

/// 模板要求的版面元素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateElement {
    BubbleGrid,
    HeaderRegion,
    StudentIdRegion,
    TextAnswerBoxes,
}

/// 文字作答框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    pub question_number: u32,
    pub question_type: QuestionType,
    pub rect: Rect,
}

/// 模板定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub id: String,
    pub name: String,
    pub format: DocumentFormat,
    #[serde(default)]
    pub grid: Option<GridGeometry>,
    #[serde(default)]
    pub header: Option<Rect>,
    #[serde(default)]
    pub student_id: Option<Rect>,
    #[serde(default)]
    pub text_fields: Vec<TextField>,
    pub required_elements: Vec<TemplateElement>,
    #[serde(default = "default_valid_answers")]
    pub valid_answers: Vec<String>,
}

pub fn default_valid_answers() -> Vec<String> {
    ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect()
}

impl TemplateDefinition {
    /// 校验模板定义是否自洽
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id 不能为空".to_string());
        }
        if self.required_elements.is_empty() {
            return Err("required_elements 不能为空".to_string());
        }
        for element in &self.required_elements {
            let present = match element {
                TemplateElement::BubbleGrid => self.grid.is_some(),
                TemplateElement::HeaderRegion => self.header.is_some(),
                TemplateElement::StudentIdRegion => self.student_id.is_some(),
                TemplateElement::TextAnswerBoxes => !self.text_fields.is_empty(),
            };
            if !present {
                return Err(format!("必需元素 {:?} 缺少几何定义", element));
            }
        }
        if let Some(grid) = &self.grid {
            if grid.columns as usize > self.valid_answers.len() {
                return Err(format!(
                    "网格列数 {} 超过有效选项数 {}",
                    grid.columns,
                    self.valid_answers.len()
                ));
            }
            if grid.rows == 0 || grid.columns == 0 || grid.spacing_x <= 0.0 || grid.bubble_radius <= 0.0 {
                return Err("网格尺寸必须为正".to_string());
            }
        }
        let mut numbers = self.question_numbers();
        let total = numbers.len();
        numbers.dedup();
        if numbers.len() != total {
            return Err("题号重复".to_string());
        }
        Ok(())
    }

    /// 所有题号（升序）
    pub fn question_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .grid
            .iter()
            .flat_map(|g| (0..g.rows).map(move |row| g.question_number(row)))
            .chain(self.text_fields.iter().map(|f| f.question_number))
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

/// 模板匹配结果，每份文档生成一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMatch {
    pub template_id: Option<String>,
    /// [0, 1]
    pub confidence: f32,
    pub detected_elements: Vec<TemplateElement>,
    /// 结构线索判定的主格式
    pub format: Option<DocumentFormat>,
}

impl TemplateMatch {
    /// 未匹配到模板
    pub fn unmatched(format: Option<DocumentFormat>, confidence: f32) -> Self {
        Self {
            template_id: None,
            confidence,
            detected_elements: Vec::new(),
            format,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.template_id.is_some()
    }
}

/// 单道题的规格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub number: u32,
    pub question_type: QuestionType,
}

/// 单份文档实际使用的版面
#[derive(Debug, Clone)]
pub struct SheetLayout {
    pub template_id: Option<String>,
    pub format: DocumentFormat,
    pub grid: Option<GridGeometry>,
    pub header: Option<Rect>,
    pub student_id: Option<Rect>,
    pub text_fields: Vec<TextField>,
    pub valid_answers: Vec<String>,
    /// 是否为推断出的通用版面
    pub generic: bool,
    questions: Vec<QuestionSpec>,
}

impl SheetLayout {
    /// 由模板生成版面，`expected_question_count` 限制题目数量
    pub fn from_template(template: &TemplateDefinition, expected_question_count: Option<usize>) -> Self {
        Self::build(
            Some(template.id.clone()),
            template.format,
            template.grid,
            template.header,
            template.student_id,
            template.text_fields.clone(),
            template.valid_answers.clone(),
            false,
            expected_question_count,
        )
    }

    /// 推断出的通用版面（只有填涂网格）
    pub fn generic(
        format: DocumentFormat,
        grid: GridGeometry,
        valid_answers: Vec<String>,
        expected_question_count: Option<usize>,
    ) -> Self {
        Self::build(
            None,
            format,
            Some(grid),
            None,
            None,
            Vec::new(),
            valid_answers,
            true,
            expected_question_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        template_id: Option<String>,
        format: DocumentFormat,
        grid: Option<GridGeometry>,
        header: Option<Rect>,
        student_id: Option<Rect>,
        text_fields: Vec<TextField>,
        valid_answers: Vec<String>,
        generic: bool,
        expected_question_count: Option<usize>,
    ) -> Self {
        let mut questions: Vec<QuestionSpec> = grid
            .iter()
            .flat_map(|g| {
                (0..g.rows).map(move |row| QuestionSpec {
                    number: g.question_number(row),
                    question_type: QuestionType::MultipleChoice,
                })
            })
            .chain(text_fields.iter().map(|f| QuestionSpec {
                number: f.question_number,
                question_type: f.question_type,
            }))
            .collect();
        questions.sort_by_key(|q| q.number);
        if let Some(limit) = expected_question_count {
            questions.truncate(limit);
        }
        Self {
            template_id,
            format,
            grid,
            header,
            student_id,
            text_fields,
            valid_answers,
            generic,
            questions,
        }
    }

    /// 参与提取的题目（按题号升序）
    pub fn questions(&self) -> &[QuestionSpec] {
        &self.questions
    }

    pub fn question_type(&self, number: u32) -> Option<QuestionType> {
        self.questions
            .iter()
            .find(|q| q.number == number)
            .map(|q| q.question_type)
    }

    pub fn text_field(&self, number: u32) -> Option<&TextField> {
        self.text_fields.iter().find(|f| f.question_number == number)
    }

    /// 所有期望气泡中心
    pub fn bubble_centers(&self) -> Vec<(f32, f32)> {
        self.grid.map(|g| g.bubble_centers()).unwrap_or_default()
    }

    /// 期望气泡半径（无网格时取常见值）
    pub fn bubble_radius(&self) -> f32 {
        self.grid.map(|g| g.bubble_radius).unwrap_or(10.0)
    }

    /// 选项标签
    pub fn option_label(&self, column: u32) -> Option<&str> {
        self.valid_answers.get(column as usize).map(|s| s.as_str())
    }

    /// 通用版面的基础置信度系数
    pub fn base_confidence_factor(&self) -> f32 {
        if self.generic {
            0.8
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridGeometry {
        GridGeometry {
            rows: 10,
            columns: 4,
            spacing_x: 40.0,
            spacing_y: 50.0,
            start_x: 200.0,
            start_y: 300.0,
            bubble_radius: 10.0,
            first_question: 1,
        }
    }

    #[test]
    fn option_centers_follow_spacing() {
        let g = grid();
        assert_eq!(g.option_center(0, 0), (200.0, 300.0));
        assert_eq!(g.option_center(2, 3), (320.0, 400.0));
        assert_eq!(g.nearest_row(402.0), 2);
        assert_eq!(g.row_of(11), None);
    }

    #[test]
    fn grid_bounds_include_radius() {
        let b = grid().bounds();
        assert_eq!(b.x, 190.0);
        assert_eq!(b.width, 140.0);
        assert_eq!(b.height, 470.0);
    }

    #[test]
    fn layout_truncates_to_expected_count() {
        let template = TemplateDefinition {
            id: "t".to_string(),
            name: "t".to_string(),
            format: DocumentFormat::BubbleSheet,
            grid: Some(grid()),
            header: None,
            student_id: None,
            text_fields: Vec::new(),
            required_elements: vec![TemplateElement::BubbleGrid],
            valid_answers: default_valid_answers(),
        };
        assert!(template.validate().is_ok());
        let layout = SheetLayout::from_template(&template, Some(6));
        assert_eq!(layout.questions().len(), 6);
        assert_eq!(layout.questions()[5].number, 6);
    }
}
