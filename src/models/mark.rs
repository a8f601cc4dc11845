use crate::models::geometry::Rect;
use serde::{Deserialize, Serialize};

/// 一个墨迹连通块
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    /// 左上角 x
    pub x: f32,
    /// 左上角 y
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// 平均墨迹深度，0 为纸白，1 为纯黑
    pub intensity: f32,
    /// 墨迹像素数
    pub area: f32,
}

impl Mark {
    pub fn new(x: f32, y: f32, width: f32, height: f32, intensity: f32, area: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            intensity,
            area,
        }
    }

    /// 以中心和半径构造一个实心圆形填涂（测试与通用推断常用）
    pub fn filled_circle(cx: f32, cy: f32, radius: f32, intensity: f32) -> Self {
        let d = radius * 2.0;
        Self::new(
            cx - radius,
            cy - radius,
            d,
            d,
            intensity,
            std::f32::consts::PI * radius * radius,
        )
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn center(&self) -> (f32, f32) {
        self.rect().center()
    }

    /// 宽高比
    pub fn aspect_ratio(&self) -> f32 {
        if self.height <= 0.0 {
            return 0.0;
        }
        self.width / self.height
    }

    /// 墨迹像素占外接矩形的比例
    pub fn fill_ratio(&self) -> f32 {
        let box_area = self.width * self.height;
        if box_area <= 0.0 {
            return 0.0;
        }
        (self.area / box_area).clamp(0.0, 1.0)
    }

    /// 是否像一个填涂气泡（近圆、较实）
    pub fn is_bubble_like(&self) -> bool {
        let aspect = self.aspect_ratio();
        (0.75..=1.33).contains(&aspect) && self.fill_ratio() >= 0.55
    }
}

/// 墨迹类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkType {
    BubbleFill,
    Erasure,
    Text,
    Doodle,
    ScratchWork,
    Unknown,
}

impl MarkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkType::BubbleFill => "bubble_fill",
            MarkType::Erasure => "erasure",
            MarkType::Text => "text",
            MarkType::Doodle => "doodle",
            MarkType::ScratchWork => "scratch_work",
            MarkType::Unknown => "unknown",
        }
    }

    /// 是否属于书写类噪声（可用于细化排除区域）
    pub fn is_writing(&self) -> bool {
        matches!(self, MarkType::Text | MarkType::ScratchWork | MarkType::Doodle)
    }
}

/// 笔画特征
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokeFeatures {
    /// 偏离圆形的程度 [0, 1]
    pub irregularity: f32,
    /// 估算笔画宽度（像素）
    pub stroke_width: f32,
    /// 估算压力 [0, 1]
    pub pressure: f32,
    /// 填充一致性 [0, 1]
    pub consistency: f32,
}

/// 过滤决定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FilterDecision {
    /// 保留为提取候选
    Keep,
    /// 保留，但对提取置信度施加惩罚系数
    KeepPenalized { penalty: f32 },
    /// 丢弃
    Discard,
}

impl FilterDecision {
    pub fn is_kept(&self) -> bool {
        !matches!(self, FilterDecision::Discard)
    }

    pub fn penalty(&self) -> f32 {
        match self {
            FilterDecision::Keep => 1.0,
            FilterDecision::KeepPenalized { penalty } => *penalty,
            FilterDecision::Discard => 0.0,
        }
    }
}

/// 手写判别结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandwritingVerdict {
    pub is_handwriting: bool,
    /// 手写置信度 [0, 1]
    pub confidence: f32,
    pub mark_type: MarkType,
    pub stroke_features: StrokeFeatures,
    /// 是否靠近某个期望气泡
    pub near_bubble: bool,
    /// 使用的判别阈值
    pub threshold: f32,
    pub decision: FilterDecision,
}

/// 经过判别的墨迹
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedMark {
    pub mark: Mark,
    pub verdict: HandwritingVerdict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_circle_is_bubble_like() {
        let mark = Mark::filled_circle(100.0, 100.0, 10.0, 0.9);
        assert!(mark.is_bubble_like());
        assert_eq!(mark.center(), (100.0, 100.0));
    }

    #[test]
    fn horizontal_stroke_is_not_bubble_like() {
        let mark = Mark::new(0.0, 0.0, 80.0, 6.0, 0.8, 300.0);
        assert!(!mark.is_bubble_like());
    }
}
