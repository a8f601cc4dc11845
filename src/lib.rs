//! # Sheet Extract
//!
//! 答题卡（填涂 / 文字 / 混合）答案提取与校验流水线
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 图像解码、墨迹检测、文字识别等原语，只暴露能力
//!
//! ### ② 业务能力层（Services / Clients）
//! - `services/` - 每个阶段一个能力：模板识别、区域划分、手写判别、答案提取、
//!   复杂度评分、分批路由、校验、恢复、聚合
//! - `clients/` - cheap / expensive 处理层级的后端实现
//!
//! ### ③ 流程层（Workflow）
//! - `DocumentCtx` - 上下文封装（文档序号 + 文件名）
//! - `AnswerSheetPipeline` - 单份答题卡的完整流程
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量文档处理器，管理资源和并发
//! - `orchestrator/document_processor` - 单份文档处理器，负责结果落盘
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, PipelineConfig};
pub use error::{AppError, AppResult};
pub use models::{FinalAnswerRecord, PipelineOutput, TemplateRegistry};
pub use orchestrator::App;
pub use workflow::{AnswerSheetPipeline, DocumentCtx, IngestRequest, PipelineBuilder};
