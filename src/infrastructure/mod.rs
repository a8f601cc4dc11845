//! 基础设施层：图像与像素级原语

pub mod document_image;
pub mod mark_detector;
pub mod text_reader;

pub use document_image::DocumentImage;
pub use mark_detector::{ConnectedComponentDetector, MarkDetector};
pub use text_reader::{NoTextReader, TextReader, TextReading};
