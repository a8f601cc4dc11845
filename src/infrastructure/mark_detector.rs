//! 墨迹检测 - 基础设施层
//!
//! 外部原语：给定同一张图像，输出必须确定。

use crate::infrastructure::document_image::DocumentImage;
use crate::models::mark::Mark;
use std::collections::VecDeque;

/// 墨迹检测原语
pub trait MarkDetector: Send + Sync {
    /// 检测图像中的所有墨迹块，按 (y, x) 顺序返回
    fn detect(&self, image: &DocumentImage) -> Vec<Mark>;

    fn name(&self) -> &'static str;
}

/// 阈值 + 四连通区域的墨迹检测
#[derive(Debug, Clone, Copy)]
pub struct ConnectedComponentDetector {
    /// 灰度小于该值视为墨迹
    pub ink_threshold: u8,
    /// 小于该像素数的连通块视为噪点
    pub min_area: u32,
}

impl Default for ConnectedComponentDetector {
    fn default() -> Self {
        Self {
            ink_threshold: 128,
            min_area: 12,
        }
    }
}

impl ConnectedComponentDetector {
    pub fn new(ink_threshold: u8, min_area: u32) -> Self {
        Self {
            ink_threshold,
            min_area,
        }
    }
}

impl MarkDetector for ConnectedComponentDetector {
    fn detect(&self, image: &DocumentImage) -> Vec<Mark> {
        let gray = image.gray();
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let mut visited = vec![false; width * height];
        let mut queue = VecDeque::new();
        let mut marks = Vec::new();

        let is_ink = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32)[0] < self.ink_threshold;

        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                if visited[idx] || !is_ink(x, y) {
                    continue;
                }

                visited[idx] = true;
                queue.push_back((x, y));
                let (mut min_x, mut min_y, mut max_x, mut max_y) = (x, y, x, y);
                let mut pixels = 0u32;
                let mut darkness = 0.0f32;

                while let Some((cx, cy)) = queue.pop_front() {
                    pixels += 1;
                    darkness += 1.0 - gray.get_pixel(cx as u32, cy as u32)[0] as f32 / 255.0;
                    min_x = min_x.min(cx);
                    min_y = min_y.min(cy);
                    max_x = max_x.max(cx);
                    max_y = max_y.max(cy);

                    let neighbours = [
                        (cx.wrapping_sub(1), cy),
                        (cx + 1, cy),
                        (cx, cy.wrapping_sub(1)),
                        (cx, cy + 1),
                    ];
                    for (nx, ny) in neighbours {
                        if nx >= width || ny >= height {
                            continue;
                        }
                        let nidx = ny * width + nx;
                        if !visited[nidx] && is_ink(nx, ny) {
                            visited[nidx] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }

                if pixels >= self.min_area {
                    marks.push(Mark::new(
                        min_x as f32,
                        min_y as f32,
                        (max_x - min_x + 1) as f32,
                        (max_y - min_y + 1) as f32,
                        darkness / pixels as f32,
                        pixels as f32,
                    ));
                }
            }
        }

        marks
    }

    fn name(&self) -> &'static str {
        "connected_component"
    }
}
