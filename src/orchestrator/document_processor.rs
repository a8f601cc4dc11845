//! 单份文档处理器 - 编排层
//!
//! ## 职责
//!
//! 1. **读取文件**：把图像文件读成字节
//! 2. **流程调度**：交给 `AnswerSheetPipeline` 处理
//! 3. **结果落盘**：写 `<name>.json`，人工复核题目追加到复核文件
//! 4. **统计输出**：记录单份文档的题目数与复核数

use crate::config::Config;
use crate::models::output::PipelineOutput;
use crate::services::ReviewWriter;
use crate::workflow::{AnswerSheetPipeline, DocumentCtx, IngestRequest};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 单份文档处理统计
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DocumentStats {
    pub questions: usize,
    pub manual_review: usize,
    pub fallbacks: usize,
    pub estimated_cost: f64,
}

/// 处理单份文档
///
/// # 参数
/// - `pipeline`: 共享的流水线
/// - `path`: 图像文件路径
/// - `document_index`: 文档索引（用于日志）
/// - `config`: 配置
///
/// # 返回
/// 返回该文档的统计；图像无法解码等致命错误以 Err 返回
pub async fn process_document(
    pipeline: &AnswerSheetPipeline,
    path: &Path,
    document_index: usize,
    config: &Config,
) -> Result<DocumentStats> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("文件名不能为空")?;
    let ctx = DocumentCtx::new(document_index, filename.clone());
    info!("{} 📄 开始处理 {}", ctx, filename);

    let bytes = fs::read(path).with_context(|| format!("无法读取文件: {}", path.display()))?;
    let output = pipeline
        .process_document(&ctx, IngestRequest::new(bytes, filename.clone()))
        .await?;

    let output_path = write_output(&config.output_folder, path, &output)?;
    if config.verbose_logging {
        for record in &output.records {
            info!(
                "{} 题 {:>3}: {:<8} {:.2} {}",
                ctx,
                record.question_number,
                record.value.as_deref().unwrap_or("-"),
                record.confidence,
                record.provenance()
            );
        }
    }

    let review_writer = ReviewWriter::with_path(config.review_file.clone());
    let flagged = review_writer.write(&filename, &output.records)?;
    if flagged > 0 {
        warn!("{} ⚠️ {} 道题需要人工复核，已写入 {}", ctx, flagged, review_writer.path());
    }
    info!("{} 💾 结果已保存至 {}", ctx, output_path.display());

    Ok(DocumentStats {
        questions: output.records.len(),
        manual_review: output.summary.manual_review_count,
        fallbacks: output.summary.fallbacks_triggered,
        estimated_cost: output.summary.estimated_cost,
    })
}

/// 写入 `<name>.json`
fn write_output(output_folder: &str, source: &Path, output: &PipelineOutput) -> Result<PathBuf> {
    fs::create_dir_all(output_folder).with_context(|| format!("无法创建输出目录: {}", output_folder))?;
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let output_path = Path::new(output_folder).join(format!("{}.json", stem));
    let json = serde_json::to_string_pretty(output)?;
    fs::write(&output_path, json).with_context(|| format!("无法写入结果: {}", output_path.display()))?;
    Ok(output_path)
}
