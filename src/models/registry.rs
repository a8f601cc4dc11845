//! 模板库
//!
//! 模板 ID → 模板定义的只读映射。启动时装入内置模板与目录中的 TOML 模板，
//! 之后以 `Arc` 在所有文档间共享。

use crate::error::TemplateError;
use crate::models::answer::QuestionType;
use crate::models::geometry::Rect;
use crate::models::template::{
    default_valid_answers, DocumentFormat, GridGeometry, TemplateDefinition, TemplateElement, TextField,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// 模板库
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<TemplateDefinition>>,
}

impl TemplateRegistry {
    /// 空模板库
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置模板的模板库
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            // 内置模板已知合法且 ID 唯一
            registry
                .templates
                .insert(template.id.clone(), Arc::new(template));
        }
        registry
    }

    /// 注册模板（校验定义并拒绝重复 ID）
    pub fn register(&mut self, template: TemplateDefinition) -> Result<(), TemplateError> {
        template.validate().map_err(|reason| TemplateError::Invalid {
            id: template.id.clone(),
            reason,
        })?;
        if self.templates.contains_key(&template.id) {
            return Err(TemplateError::DuplicateId { id: template.id });
        }
        self.templates.insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<TemplateDefinition>> {
        self.templates.get(id).cloned()
    }

    /// 按 ID 顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TemplateDefinition>> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// 内置模板（以 100 dpi 的 Letter 纸 850×1100 为基准）
pub fn builtin_templates() -> Vec<TemplateDefinition> {
    let header = Rect::new(100.0, 60.0, 650.0, 80.0);
    let student_id = Rect::new(100.0, 160.0, 300.0, 50.0);

    vec![
        TemplateDefinition {
            id: "omr_20q_abcd".to_string(),
            name: "20 题四选项填涂卡".to_string(),
            format: DocumentFormat::BubbleSheet,
            grid: Some(GridGeometry {
                rows: 20,
                columns: 4,
                spacing_x: 40.0,
                spacing_y: 40.0,
                start_x: 250.0,
                start_y: 250.0,
                bubble_radius: 10.0,
                first_question: 1,
            }),
            header: Some(header),
            student_id: Some(student_id),
            text_fields: Vec::new(),
            required_elements: vec![
                TemplateElement::BubbleGrid,
                TemplateElement::HeaderRegion,
                TemplateElement::StudentIdRegion,
            ],
            valid_answers: default_valid_answers(),
        },
        TemplateDefinition {
            id: "omr_50q_abcde".to_string(),
            name: "50 题五选项填涂卡".to_string(),
            format: DocumentFormat::BubbleSheet,
            grid: Some(GridGeometry {
                rows: 50,
                columns: 5,
                spacing_x: 30.0,
                spacing_y: 15.0,
                start_x: 250.0,
                start_y: 240.0,
                bubble_radius: 6.0,
                first_question: 1,
            }),
            header: Some(header),
            student_id: Some(student_id),
            text_fields: Vec::new(),
            required_elements: vec![TemplateElement::BubbleGrid, TemplateElement::HeaderRegion],
            valid_answers: ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect(),
        },
        TemplateDefinition {
            id: "short_answer_10q".to_string(),
            name: "10 题简答卷".to_string(),
            format: DocumentFormat::TextBased,
            grid: None,
            header: Some(header),
            student_id: None,
            text_fields: (0..10)
                .map(|i| TextField {
                    question_number: i + 1,
                    question_type: QuestionType::Text,
                    rect: Rect::new(100.0, 200.0 + i as f32 * 80.0, 650.0, 60.0),
                })
                .collect(),
            required_elements: vec![TemplateElement::HeaderRegion, TemplateElement::TextAnswerBoxes],
            valid_answers: Vec::new(),
        },
        TemplateDefinition {
            id: "mixed_10mc_4text".to_string(),
            name: "10 道选择 + 3 道简答 + 1 道作文".to_string(),
            format: DocumentFormat::MixedFormat,
            grid: Some(GridGeometry {
                rows: 10,
                columns: 4,
                spacing_x: 40.0,
                spacing_y: 40.0,
                start_x: 250.0,
                start_y: 220.0,
                bubble_radius: 10.0,
                first_question: 1,
            }),
            header: Some(header),
            student_id: None,
            text_fields: vec![
                TextField {
                    question_number: 11,
                    question_type: QuestionType::Text,
                    rect: Rect::new(100.0, 640.0, 650.0, 60.0),
                },
                TextField {
                    question_number: 12,
                    question_type: QuestionType::Text,
                    rect: Rect::new(100.0, 720.0, 650.0, 60.0),
                },
                TextField {
                    question_number: 13,
                    question_type: QuestionType::Text,
                    rect: Rect::new(100.0, 800.0, 650.0, 60.0),
                },
                TextField {
                    question_number: 14,
                    question_type: QuestionType::Essay,
                    rect: Rect::new(100.0, 880.0, 650.0, 120.0),
                },
            ],
            required_elements: vec![
                TemplateElement::BubbleGrid,
                TemplateElement::HeaderRegion,
                TemplateElement::TextAnswerBoxes,
            ],
            valid_answers: default_valid_answers(),
        },
    ]
}
