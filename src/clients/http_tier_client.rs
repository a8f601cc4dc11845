//! HTTP 层级客户端
//!
//! 把批次请求以 JSON POST 到外部识别服务，服务返回 `TierResponse` 结构的 JSON。

use crate::clients::tier_backend::{TierBackend, TierRequest, TierResponse};
use crate::error::TierError;
use crate::models::geometry::clamp_unit;
use crate::models::routing::ProcessingTier;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP 层级客户端
pub struct HttpTier {
    client: reqwest::Client,
    endpoint: String,
    tier: ProcessingTier,
}

impl HttpTier {
    /// 创建新的 HTTP 层级客户端
    ///
    /// # 参数
    /// - `endpoint`: 服务地址
    /// - `tier`: 该服务承担的层级
    /// - `timeout`: 单次请求超时
    pub fn new(endpoint: impl Into<String>, tier: ProcessingTier, timeout: Duration) -> Result<Self, TierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TierError::request_failed(tier.as_str(), e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            tier,
        })
    }
}

#[async_trait]
impl TierBackend for HttpTier {
    async fn process(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        let tier = self.tier.as_str();
        debug!("POST {} 批次 {}（{} 道题）", self.endpoint, request.batch_id, request.items.len());

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!("层级服务请求失败: {}", e);
                TierError::request_failed(tier, e)
            })?
            .error_for_status()
            .map_err(|e| TierError::request_failed(tier, e))?;

        let mut body: TierResponse = response
            .json()
            .await
            .map_err(|e| TierError::malformed(tier, e.to_string()))?;

        for answer in &mut body.answers {
            answer.confidence = clamp_unit(answer.confidence);
        }
        Ok(body)
    }

    fn name(&self) -> &str {
        &self.endpoint
    }

    fn wants_images(&self) -> bool {
        true
    }
}
