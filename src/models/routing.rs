use serde::{Deserialize, Serialize};

/// 处理层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingTier {
    /// 便宜、快速
    Cheap,
    /// 昂贵、准确
    Expensive,
}

impl ProcessingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingTier::Cheap => "cheap_tier",
            ProcessingTier::Expensive => "expensive_tier",
        }
    }
}

impl std::fmt::Display for ProcessingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 复杂度构成项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub name: String,
    pub points: f32,
}

/// 单题复杂度评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub question_number: u32,
    /// [0, 100]
    pub score: f32,
    pub recommended_tier: ProcessingTier,
    /// [50, 100]
    pub decision_confidence: f32,
    pub contributing_factors: Vec<ContributingFactor>,
}

/// 同一层级的一批题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBatch {
    pub batch_id: usize,
    pub tier: ProcessingTier,
    pub questions: Vec<u32>,
    pub work_units: f64,
    pub estimated_cost: f64,
    /// 相对全部走 expensive 层级节省的成本
    pub cost_savings: f64,
}

/// 分批与成本规划
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub batches: Vec<TierBatch>,
    pub total_cost: f64,
    pub baseline_cost: f64,
}

impl RoutingPlan {
    pub fn total_savings(&self) -> f64 {
        self.baseline_cost - self.total_cost
    }

    pub fn question_count(&self) -> usize {
        self.batches.iter().map(|b| b.questions.len()).sum()
    }

    pub fn tier_of(&self, question_number: u32) -> Option<ProcessingTier> {
        self.batches
            .iter()
            .find(|b| b.questions.contains(&question_number))
            .map(|b| b.tier)
    }
}

/// 升级原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// 调用出错
    CallFailed,
    /// 返回缺少该题
    IncompleteResult,
    /// 置信度过低且题目较复杂
    LowConfidence,
    /// 批次超时，走逐题应急路径
    BatchTimeout,
}

/// 一次升级事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub question_number: u32,
    pub from: ProcessingTier,
    pub to: ProcessingTier,
    pub reason: FallbackReason,
}
