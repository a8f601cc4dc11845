//! 文字识别原语 - 基础设施层

use crate::infrastructure::document_image::DocumentImage;
use crate::models::geometry::Rect;

/// 一次文字识别结果
#[derive(Debug, Clone, PartialEq)]
pub struct TextReading {
    pub text: String,
    /// [0, 1]
    pub confidence: f32,
}

/// 文字识别原语
///
/// 对同一图像区域必须给出相同结果。
pub trait TextReader: Send + Sync {
    fn read(&self, image: &DocumentImage, region: &Rect, question_number: u32) -> Option<TextReading>;

    fn name(&self) -> &'static str;
}

/// 本地不做文字识别，文字题交给 expensive 层级
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTextReader;

impl TextReader for NoTextReader {
    fn read(&self, _image: &DocumentImage, _region: &Rect, _question_number: u32) -> Option<TextReading> {
        None
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
