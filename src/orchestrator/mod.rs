//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，只做调度和统计，不做具体业务判断。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量文档处理器
//! - 管理应用生命周期（初始化、运行）
//! - 扫描输入目录，分批并发处理（Semaphore）
//! - 选择层级后端并组装流水线
//! - 输出全局统计信息
//!
//! ### `document_processor` - 单份文档处理器
//! - 读取图像，交给流水线处理
//! - 写结果 JSON 与人工复核清单
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<PathBuf>)
//!     ↓
//! document_processor (处理单个文件)
//!     ↓
//! workflow::AnswerSheetPipeline (处理单份答题卡)
//!     ↓
//! services (能力层：识别 / 判别 / 提取 / 路由 / 校验 / 恢复 / 聚合)
//!     ↓
//! infrastructure (原语：图像、墨迹检测、文字识别)
//! ```

pub mod batch_processor;
pub mod document_processor;

// 重新导出主要类型
pub use batch_processor::App;
pub use document_processor::{process_document, DocumentStats};
