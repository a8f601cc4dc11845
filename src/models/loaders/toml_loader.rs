use crate::models::registry::TemplateRegistry;
use crate::models::template::TemplateDefinition;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载单个模板定义
pub async fn load_template_file(toml_file_path: &Path) -> Result<TemplateDefinition> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取模板文件: {}", toml_file_path.display()))?;

    let template: TemplateDefinition = toml::from_str(&content)
        .with_context(|| format!("无法解析模板文件: {}", toml_file_path.display()))?;

    Ok(template)
}

/// 从文件夹中加载所有 TOML 模板
///
/// 单个文件加载失败只记录警告，不影响其他模板。
pub async fn load_all_template_files(folder_path: &str) -> Result<Vec<TemplateDefinition>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    // 保证加载顺序稳定
    paths.sort();

    let mut templates = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载模板: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );
        match load_template_file(&path).await {
            Ok(template) => templates.push(template),
            Err(e) => tracing::warn!("加载模板失败 {}: {:#}", path.display(), e),
        }
    }

    Ok(templates)
}

/// 构建模板库：内置模板 + 目录中的模板（目录不存在时只用内置模板）
pub async fn load_registry(folder_path: &str) -> Result<TemplateRegistry> {
    let mut registry = TemplateRegistry::with_builtins();

    if !Path::new(folder_path).exists() {
        tracing::info!("模板目录 {} 不存在，仅使用内置模板", folder_path);
        return Ok(registry);
    }

    for template in load_all_template_files(folder_path).await? {
        let id = template.id.clone();
        match registry.register(template) {
            Ok(()) => tracing::info!("✓ 已注册模板 {}", id),
            Err(e) => tracing::warn!("跳过模板 {}: {}", id, e),
        }
    }

    Ok(registry)
}
