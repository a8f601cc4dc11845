//! 感兴趣区域（ROI）管理
//!
//! 软遮罩：排除区域内的墨迹不会被丢弃，只在提取时乘以惩罚系数。

use crate::models::geometry::Rect;
use crate::models::template::SheetLayout;
use serde::{Deserialize, Serialize};

/// 左右页边占宽度的比例
pub const MARGIN_FRACTION: f32 = 0.05;
/// 底部条带占高度的比例
pub const BOTTOM_FRACTION: f32 = 0.08;

/// 区域类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Header,
    StudentId,
    BubbleGrid,
    TextAnswer,
    LeftMargin,
    RightMargin,
    BottomBand,
    Handwriting,
}

/// 一个区域
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub kind: RegionKind,
    pub rect: Rect,
    pub confidence: f32,
}

impl Region {
    pub fn new(kind: RegionKind, rect: Rect, confidence: f32) -> Self {
        Self {
            kind,
            rect,
            confidence: crate::models::geometry::clamp_unit(confidence),
        }
    }
}

/// 包含/排除区域集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRegion {
    pub include: Vec<Region>,
    pub exclude: Vec<Region>,
    /// 与排除区域重叠时的惩罚系数
    pub exclusion_penalty: f32,
}

impl ProcessingRegion {
    /// 矩形与任一排除区域重叠时返回惩罚系数，否则 1.0
    pub fn exclusion_penalty(&self, rect: &Rect) -> f32 {
        if self.overlaps_exclusion(rect) {
            self.exclusion_penalty
        } else {
            1.0
        }
    }

    pub fn overlaps_exclusion(&self, rect: &Rect) -> bool {
        self.exclude.iter().any(|r| r.rect.intersects(rect))
    }

    /// 是否与手写排除区域重叠
    pub fn overlaps_handwriting(&self, rect: &Rect) -> bool {
        self.exclude
            .iter()
            .any(|r| r.kind == RegionKind::Handwriting && r.rect.intersects(rect))
    }

    /// 点是否在填涂网格包含区域内
    pub fn in_bubble_region(&self, point: (f32, f32)) -> bool {
        self.include
            .iter()
            .any(|r| r.kind == RegionKind::BubbleGrid && r.rect.contains_point(point))
    }

    /// 点是否在表头、学号或文字作答框内
    pub fn in_field_region(&self, point: (f32, f32)) -> bool {
        self.include.iter().any(|r| {
            matches!(
                r.kind,
                RegionKind::Header | RegionKind::StudentId | RegionKind::TextAnswer
            ) && r.rect.contains_point(point)
        })
    }

    /// 追加手写噪声排除区域，返回新的区域集合
    pub fn with_noise(&self, noise: &[Rect]) -> Self {
        let mut refined = self.clone();
        for rect in noise {
            let duplicate = refined
                .exclude
                .iter()
                .any(|r| r.kind == RegionKind::Handwriting && r.rect == *rect);
            if !duplicate {
                refined
                    .exclude
                    .push(Region::new(RegionKind::Handwriting, *rect, 1.0));
            }
        }
        refined
    }

    pub fn handwriting_regions(&self) -> impl Iterator<Item = &Region> {
        self.exclude.iter().filter(|r| r.kind == RegionKind::Handwriting)
    }
}

/// ROI 管理器
#[derive(Debug, Clone, Copy)]
pub struct RoiManager {
    pub grid_buffer: f32,
    pub exclusion_penalty: f32,
}

impl RoiManager {
    pub fn new(grid_buffer: f32, exclusion_penalty: f32) -> Self {
        Self {
            grid_buffer,
            exclusion_penalty,
        }
    }

    /// 根据版面、图像尺寸和已知噪声生成区域集合
    ///
    /// # 参数
    /// - `layout`: 模板或推断的版面
    /// - `dims`: 图像宽高
    /// - `known_noise`: 已知手写区域
    pub fn build(&self, layout: &SheetLayout, dims: (f32, f32), known_noise: &[Rect]) -> ProcessingRegion {
        let (width, height) = dims;
        let mut include = Vec::new();

        if let Some(rect) = layout.header {
            include.push(Region::new(RegionKind::Header, rect, 1.0));
        }
        if let Some(rect) = layout.student_id {
            include.push(Region::new(RegionKind::StudentId, rect, 1.0));
        }
        if let Some(grid) = layout.grid {
            let confidence = layout.base_confidence_factor();
            let rect = grid.bounds().expand(self.grid_buffer).clip_to(width, height);
            include.push(Region::new(RegionKind::BubbleGrid, rect, confidence));
        }
        for field in &layout.text_fields {
            include.push(Region::new(RegionKind::TextAnswer, field.rect, 1.0));
        }

        let margin = width * MARGIN_FRACTION;
        let band = height * BOTTOM_FRACTION;
        let strips = [
            (RegionKind::LeftMargin, Rect::new(0.0, 0.0, margin, height)),
            (RegionKind::RightMargin, Rect::new(width - margin, 0.0, margin, height)),
            (RegionKind::BottomBand, Rect::new(0.0, height - band, width, band)),
        ];

        let protected: Vec<Rect> = include
            .iter()
            .filter(|r| matches!(r.kind, RegionKind::BubbleGrid | RegionKind::TextAnswer))
            .map(|r| r.rect)
            .collect();

        let mut exclude = Vec::new();
        for (kind, strip) in strips {
            if let Some(clipped) = clip_strip(kind, strip, &protected) {
                exclude.push(Region::new(kind, clipped, 1.0));
            }
        }

        let region = ProcessingRegion {
            include,
            exclude,
            exclusion_penalty: self.exclusion_penalty,
        };
        region.with_noise(known_noise)
    }
}

/// 裁剪排除条带，使其不覆盖网格与文字作答框
fn clip_strip(kind: RegionKind, strip: Rect, protected: &[Rect]) -> Option<Rect> {
    let mut clipped = strip;
    for rect in protected {
        if !clipped.intersects(rect) {
            continue;
        }
        clipped = match kind {
            RegionKind::LeftMargin => {
                let right = rect.x.min(clipped.right());
                Rect::new(clipped.x, clipped.y, right - clipped.x, clipped.height)
            }
            RegionKind::RightMargin => {
                let left = rect.right().max(clipped.x);
                Rect::new(left, clipped.y, clipped.right() - left, clipped.height)
            }
            _ => {
                let top = rect.bottom().max(clipped.y);
                Rect::new(clipped.x, top, clipped.width, clipped.bottom() - top)
            }
        };
    }
    (clipped.area() > 0.0).then_some(clipped)
}
