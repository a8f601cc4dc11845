//! 处理层级后端
//!
//! 一次调用处理一个批次。cheap / expensive 两个层级可以挂不同的实现。

use crate::error::TierError;
use crate::models::answer::{ExtractedAnswer, QuestionType};
use crate::models::geometry::Rect;
use crate::models::routing::ProcessingTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 批次中的一道题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierItem {
    pub question_number: u32,
    pub question_type: QuestionType,
    /// 本地提取的候选值
    pub candidate: Option<String>,
    pub candidate_confidence: f32,
    pub multiple_marks: bool,
    pub region: Option<Rect>,
    /// 可选项（选择题）
    pub options: Vec<String>,
    /// 题目区域的 PNG（base64），只有需要图像的后端才会填充
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_png_base64: Option<String>,
}

impl TierItem {
    pub fn from_answer(answer: &ExtractedAnswer, options: &[String]) -> Self {
        Self {
            question_number: answer.question_number,
            question_type: answer.question_type,
            candidate: answer.value.clone(),
            candidate_confidence: answer.confidence,
            multiple_marks: answer.multiple_marks,
            region: answer.bounding_box,
            options: if answer.question_type == QuestionType::MultipleChoice {
                options.to_vec()
            } else {
                Vec::new()
            },
            image_png_base64: None,
        }
    }
}

/// 一次批次请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRequest {
    pub batch_id: usize,
    pub tier: ProcessingTier,
    pub items: Vec<TierItem>,
}

/// 单题返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAnswer {
    pub question_number: u32,
    pub value: Option<String>,
    pub confidence: f32,
}

/// 批次返回
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierResponse {
    pub answers: Vec<TierAnswer>,
}

impl TierResponse {
    pub fn answer(&self, question_number: u32) -> Option<&TierAnswer> {
        self.answers.iter().find(|a| a.question_number == question_number)
    }
}

/// 处理层级后端
#[async_trait]
pub trait TierBackend: Send + Sync {
    async fn process(&self, request: &TierRequest) -> Result<TierResponse, TierError>;

    fn name(&self) -> &str;

    /// 是否需要题目区域图像
    fn wants_images(&self) -> bool {
        false
    }
}

/// 本地后端：复核本地提取结果，不发起网络请求
///
/// 没有候选值的题目不会出现在返回中。
#[derive(Debug, Clone, Copy)]
pub struct OfflineTier {
    pub tier: ProcessingTier,
}

impl OfflineTier {
    pub fn new(tier: ProcessingTier) -> Self {
        Self { tier }
    }
}

#[async_trait]
impl TierBackend for OfflineTier {
    async fn process(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        let answers = request
            .items
            .iter()
            .filter(|item| item.candidate.is_some())
            .map(|item| TierAnswer {
                question_number: item.question_number,
                value: item.candidate.clone(),
                confidence: item.candidate_confidence,
            })
            .collect();
        Ok(TierResponse { answers })
    }

    fn name(&self) -> &str {
        self.tier.as_str()
    }
}
