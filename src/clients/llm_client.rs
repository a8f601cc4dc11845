//! 视觉大模型层级
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 题目区域以 base64 PNG data URL 的形式附加到用户消息
//! - 兼容 OpenAI API 的服务（自定义 API 端点和模型）

use crate::clients::tier_backend::{TierAnswer, TierBackend, TierItem, TierRequest, TierResponse};
use crate::config::Config;
use crate::error::TierError;
use crate::models::geometry::clamp_unit;
use crate::models::routing::ProcessingTier;
use crate::utils::logging::truncate_text;
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "你是一个答题卡识别助手。你会收到若干道题目的区域截图和本地识别的候选答案，\
                             请逐题给出你读到的答案和置信度。选择题只能从给定选项中选择一个；\
                             如果一道选择题同时涂了多个选项或没有作答，value 返回 null。";

/// 视觉大模型层级
pub struct VisionLlmTier {
    client: Client<OpenAIConfig>,
    model_name: String,
    tier: ProcessingTier,
}

/// 模型返回的单题结果
#[derive(Debug, Deserialize)]
struct LlmAnswer {
    #[serde(alias = "question")]
    question_number: u32,
    value: Option<String>,
    #[serde(default)]
    confidence: f32,
}

impl VisionLlmTier {
    /// 创建新的视觉层级
    pub fn new(config: &Config, tier: ProcessingTier) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            tier,
        }
    }

    /// 发送一次聊天请求
    ///
    /// # 参数
    /// - `user_message`: 用户消息内容
    /// - `images`: 图片 data URL，会追加到用户消息中
    ///
    /// # 返回
    /// 返回模型的响应内容
    async fn send_to_llm(&self, user_message: &str, images: &[String]) -> Result<String, TierError> {
        let tier = self.tier.as_str();
        debug!("调用视觉模型，模型: {}，图片 {} 张", self.model_name, images.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()
            .map_err(|e| TierError::request_failed(tier, e))?;

        let mut parts = vec![ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText {
                text: user_message.to_string(),
            },
        )];
        for url in images {
            parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: url.clone(),
                        detail: Some(ImageDetail::High),
                    },
                },
            ));
        }
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(parts))
            .build()
            .map_err(|e| TierError::request_failed(tier, e))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.0)
            .max_tokens(1024u32)
            .build()
            .map_err(|e| TierError::request_failed(tier, e))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("视觉模型调用失败: {}", e);
            TierError::request_failed(tier, e)
        })?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| TierError::EmptyResponse { tier: tier.to_string() })
    }
}

/// 构建用户消息：每道题的编号、题型、选项与本地候选
fn build_user_message(items: &[TierItem]) -> String {
    let questions: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            serde_json::json!({
                "question_number": item.question_number,
                "question_type": item.question_type.as_str(),
                "options": item.options,
                "local_candidate": item.candidate,
                "local_multiple_marks": item.multiple_marks,
            })
        })
        .collect();
    let questions_json = serde_json::to_string_pretty(&questions).unwrap_or_default();

    format!(
        r#"以下题目的截图按顺序附在后面（没有截图的题目请根据候选判断）：
{}

只返回一个 JSON 数组，不要返回任何其他内容，格式：
[{{"question_number": 1, "value": "B", "confidence": 0.92}}]"#,
        questions_json
    )
}

/// 从模型响应中解析 JSON 答案数组
pub(crate) fn parse_answers(tier: &str, response: &str) -> Result<Vec<TierAnswer>, TierError> {
    let array = Regex::new(r"(?s)\[.*\]")
        .map_err(|e| TierError::malformed(tier, e.to_string()))?
        .find(response)
        .ok_or_else(|| TierError::malformed(tier, "响应中没有 JSON 数组"))?;

    let parsed: Vec<LlmAnswer> =
        serde_json::from_str(array.as_str()).map_err(|e| TierError::malformed(tier, e.to_string()))?;

    Ok(parsed
        .into_iter()
        .map(|a| TierAnswer {
            question_number: a.question_number,
            value: a.value.filter(|v| !v.trim().is_empty()),
            confidence: clamp_unit(a.confidence),
        })
        .collect())
}

#[async_trait]
impl TierBackend for VisionLlmTier {
    async fn process(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        let images: Vec<String> = request
            .items
            .iter()
            .filter_map(|item| item.image_png_base64.as_ref())
            .map(|b64| format!("data:image/png;base64,{}", b64))
            .collect();

        let response = self
            .send_to_llm(&build_user_message(&request.items), &images)
            .await?;
        debug!("视觉模型响应: {}", truncate_text(&response, 200));
        let answers = parse_answers(self.tier.as_str(), &response)?;
        debug!("批次 {} 返回 {} 道题", request.batch_id, answers.len());

        Ok(TierResponse { answers })
    }

    fn name(&self) -> &str {
        &self.model_name
    }

    fn wants_images(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_wrapped_in_text() {
        let response = "好的，结果如下：\n```json\n[{\"question_number\": 3, \"value\": \"C\", \"confidence\": 0.9},\n {\"question\": 4, \"value\": null, \"confidence\": 1.4}]\n```";
        let answers = parse_answers("expensive_tier", response).unwrap();

        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].value.as_deref(), Some("C"));
        assert_eq!(answers[1].question_number, 4);
        assert!(answers[1].value.is_none());
        assert_eq!(answers[1].confidence, 1.0);
    }

    #[test]
    fn rejects_response_without_array() {
        let err = parse_answers("expensive_tier", "无法识别").unwrap_err();
        assert!(matches!(err, TierError::MalformedResponse { .. }));
    }

    #[test]
    fn user_message_lists_questions() {
        let item = TierItem {
            question_number: 7,
            question_type: crate::models::answer::QuestionType::MultipleChoice,
            candidate: Some("B".to_string()),
            candidate_confidence: 0.4,
            multiple_marks: false,
            region: None,
            options: vec!["A".to_string(), "B".to_string()],
            image_png_base64: None,
        };
        let message = build_user_message(&[item]);
        assert!(message.contains("\"question_number\": 7"));
        assert!(message.contains("multiple_choice"));
    }
}
