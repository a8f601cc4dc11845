//! 文档图像 - 基础设施层
//!
//! 持有解码后的灰度图像，只暴露尺寸、裁剪与编码能力。

use crate::models::geometry::Rect;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::Cursor;

/// 解码后的灰度文档图像
#[derive(Debug, Clone)]
pub struct DocumentImage {
    gray: GrayImage,
}

impl DocumentImage {
    /// 从 PNG / JPEG / BMP 字节解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self {
            gray: decoded.to_luma8(),
        })
    }

    pub fn from_gray(gray: GrayImage) -> Self {
        Self { gray }
    }

    /// 纯白图像
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            gray: GrayImage::from_pixel(width, height, Luma([255])),
        }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn dimensions(&self) -> (f32, f32) {
        (self.gray.width() as f32, self.gray.height() as f32)
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// 裁剪区域（自动限制在图像范围内）
    pub fn crop(&self, rect: &Rect) -> GrayImage {
        let (w, h) = self.dimensions();
        let clipped = rect.clip_to(w, h);
        image::imageops::crop_imm(
            &self.gray,
            clipped.x as u32,
            clipped.y as u32,
            clipped.width.max(1.0) as u32,
            clipped.height.max(1.0) as u32,
        )
        .to_image()
    }

    /// 裁剪并编码为 PNG
    pub fn encode_png(&self, rect: &Rect) -> Result<Vec<u8>, image::ImageError> {
        let crop = DynamicImage::ImageLuma8(self.crop(rect));
        let mut buffer = Vec::new();
        crop.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
        Ok(buffer)
    }

    /// 整张图像编码为 PNG
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Vec::new();
        DynamicImage::ImageLuma8(self.gray.clone()).write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
        Ok(buffer)
    }
}
