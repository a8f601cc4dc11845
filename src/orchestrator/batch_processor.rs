//! 批量文档处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量答题卡的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、模板库、层级后端、流水线
//! 2. **批量加载**：扫描输入目录中的图像文件
//! 3. **并发控制**：使用 Semaphore 限制并发数量
//! 4. **分批处理**：每批完成后再开始下一批
//! 5. **全局统计**：汇总所有文档的处理结果
//!
//! 单份文档的致命错误只记录和计数，不会中断整个运行。

use crate::clients::{HttpTier, OfflineTier, TierBackend, VisionLlmTier};
use crate::config::Config;
use crate::models::routing::ProcessingTier;
use crate::orchestrator::document_processor::{self, DocumentStats};
use crate::utils::logging::{
    init_log_file, log_batch_complete, log_batch_start, log_documents_loaded, log_startup, print_final_stats,
    FinalStats,
};
use crate::workflow::AnswerSheetPipeline;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 支持的图像扩展名
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 应用主结构
pub struct App {
    config: Config,
    pipeline: Arc<AnswerSheetPipeline>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        init_log_file(&config.output_log_file)?;

        log_startup(config.max_concurrent_documents);

        let registry = crate::models::load_registry(&config.template_folder)
            .await
            .context("模板库加载失败")?;
        info!("📚 模板库共 {} 个模板", registry.len());

        let expensive = expensive_backend(&config)?;
        let pipeline = AnswerSheetPipeline::builder(config.pipeline.clone())
            .registry(Arc::new(registry))
            .cheap_tier(Arc::new(OfflineTier::new(ProcessingTier::Cheap)))
            .expensive_tier(expensive)
            .build()?;

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        let documents = scan_documents(&self.config.input_folder)?;

        if documents.is_empty() {
            warn!("⚠️ 没有找到待处理的答题卡图像，程序结束");
            return Ok(());
        }

        let max_concurrent = self.config.max_concurrent_documents.max(1);
        log_documents_loaded(documents.len(), max_concurrent);

        let stats = self.process_all_documents(documents).await?;

        print_final_stats(&stats, &self.config.output_log_file);

        Ok(())
    }

    /// 分批处理所有文档
    async fn process_all_documents(&self, documents: Vec<PathBuf>) -> Result<FinalStats> {
        let max_concurrent = self.config.max_concurrent_documents.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let total = documents.len();
        let mut stats = FinalStats {
            total,
            ..Default::default()
        };

        for batch_start in (0..total).step_by(max_concurrent) {
            let batch_end = (batch_start + max_concurrent).min(total);
            let batch_num = (batch_start / max_concurrent) + 1;
            let total_batches = total.div_ceil(max_concurrent);

            log_batch_start(batch_num, total_batches, batch_start + 1, batch_end, total);

            let results = self
                .process_batch(&documents[batch_start..batch_end], batch_start, semaphore.clone())
                .await?;

            let success = results.iter().filter(|r| r.is_some()).count();
            for document in results.into_iter().flatten() {
                stats.questions += document.questions;
                stats.manual_review += document.manual_review;
                stats.fallbacks += document.fallbacks;
                stats.estimated_cost += document.estimated_cost;
            }
            stats.success += success;
            stats.failed += batch_end - batch_start - success;

            log_batch_complete(batch_num, success, batch_end - batch_start);
        }

        Ok(stats)
    }

    /// 处理单个批次，失败的文档对应 None
    async fn process_batch(
        &self,
        batch: &[PathBuf],
        batch_start: usize,
        semaphore: Arc<Semaphore>,
    ) -> Result<Vec<Option<DocumentStats>>> {
        let mut handles = Vec::new();

        for (idx, path) in batch.iter().enumerate() {
            let document_index = batch_start + idx + 1;
            let permit = semaphore.clone().acquire_owned().await?;

            let pipeline = Arc::clone(&self.pipeline);
            let config = self.config.clone();
            let path = path.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                match document_processor::process_document(&pipeline, &path, document_index, &config).await {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        error!("[文档 {}] ❌ 处理过程中发生错误: {:#}", document_index, e);
                        None
                    }
                }
            });
            handles.push((document_index, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (document_index, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("[文档 {}] 任务执行失败: {}", document_index, e);
                    results.push(None);
                }
            }
        }

        Ok(results)
    }
}

/// 选择 expensive 层级：HTTP 服务 > 视觉大模型 > 本地复核
fn expensive_backend(config: &Config) -> Result<Arc<dyn TierBackend>> {
    if let Some(url) = config.tier_service_url.as_deref().filter(|u| !u.is_empty()) {
        info!("🌐 expensive 层级使用 HTTP 服务: {}", url);
        let timeout = Duration::from_millis(config.pipeline.batch_timeout_ms);
        return Ok(Arc::new(HttpTier::new(url, ProcessingTier::Expensive, timeout)?));
    }
    if !config.llm_api_key.is_empty() {
        info!("🤖 expensive 层级使用视觉大模型: {}", config.llm_model_name);
        return Ok(Arc::new(VisionLlmTier::new(config, ProcessingTier::Expensive)));
    }
    warn!("⚠️ 未配置 expensive 层级服务，使用本地复核");
    Ok(Arc::new(OfflineTier::new(ProcessingTier::Expensive)))
}

/// 扫描输入目录中的图像文件（按文件名排序）
pub fn scan_documents(folder: &str) -> Result<Vec<PathBuf>> {
    info!("\n📁 正在扫描待处理的答题卡...");
    let dir = Path::new(folder);
    if !dir.exists() {
        warn!("输入目录不存在: {}", folder);
        return Ok(Vec::new());
    }

    let mut documents: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("无法读取目录: {}", folder))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    documents.sort();
    Ok(documents)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_image_extensions() {
        assert!(is_image(Path::new("a/sheet.PNG")));
        assert!(is_image(Path::new("sheet.jpeg")));
        assert!(!is_image(Path::new("sheet.toml")));
        assert!(!is_image(Path::new("sheet")));
    }

    #[test]
    fn missing_input_folder_yields_nothing() {
        let documents = scan_documents("definitely/not/a/folder").unwrap();
        assert!(documents.is_empty());
    }

    #[test]
    fn offline_backend_without_services() {
        let config = Config {
            llm_api_key: String::new(),
            tier_service_url: None,
            ..Default::default()
        };
        let backend = expensive_backend(&config).unwrap();
        assert_eq!(backend.name(), "expensive_tier");
    }
}
