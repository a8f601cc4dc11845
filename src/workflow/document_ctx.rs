//! 文档处理上下文
//!
//! 封装"我正在处理第几份文档、文件名是什么"这一信息

use std::fmt::Display;

/// 文档处理上下文
#[derive(Debug, Clone)]
pub struct DocumentCtx {
    /// 文档索引（仅用于日志显示，从1开始）
    pub document_index: usize,

    /// 文件名，同时作为格式提示
    pub filename: String,
}

impl DocumentCtx {
    /// 创建新的文档上下文
    pub fn new(document_index: usize, filename: impl Into<String>) -> Self {
        Self {
            document_index,
            filename: filename.into(),
        }
    }
}

impl Display for DocumentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[文档 {}]", self.document_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_document_index() {
        let ctx = DocumentCtx::new(3, "sheet_03.png");
        assert_eq!(ctx.to_string(), "[文档 3]");
        assert_eq!(ctx.filename, "sheet_03.png");
    }
}
