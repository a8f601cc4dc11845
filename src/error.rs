use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 文档级错误（致命）
    #[error("文档错误: {0}")]
    Document(#[from] DocumentError),
    /// 处理层级调用错误
    #[error("处理层级错误: {0}")]
    Tier(#[from] TierError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 模板库错误
    #[error("模板错误: {0}")]
    Template(#[from] TemplateError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 文档级错误
///
/// 只有这一类错误会中断整份文档的处理，其余问题都降级为单题的低置信度结果。
#[derive(Debug, Error)]
pub enum DocumentError {
    /// 图像无法解码
    #[error("无法解码文档图像 ({filename}): {source}")]
    ImageDecode {
        filename: String,
        #[source]
        source: image::ImageError,
    },
    /// 既没有匹配到模板，也没有可提取的区域
    #[error("文档 {filename} 没有匹配的模板，也没有可提取的答题区域")]
    NoExtractableRegions { filename: String },
    /// 文档为空
    #[error("文档 {filename} 内容为空")]
    EmptyDocument { filename: String },
}

/// 处理层级（cheap / expensive）调用错误
#[derive(Debug, Error)]
pub enum TierError {
    /// 网络请求失败
    #[error("层级 {tier} 请求失败: {source}")]
    RequestFailed {
        tier: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 批次超时
    #[error("层级 {tier} 批次 {batch_id} 超时 ({timeout_ms} ms)")]
    Timeout {
        tier: String,
        batch_id: usize,
        timeout_ms: u64,
    },
    /// 返回内容无法解析
    #[error("层级 {tier} 返回内容无法解析: {message}")]
    MalformedResponse { tier: String, message: String },
    /// 返回为空
    #[error("层级 {tier} 返回为空")]
    EmptyResponse { tier: String },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 序列化失败
    #[error("JSON 序列化失败: {0}")]
    Json(#[from] serde_json::Error),
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

/// 模板库错误
#[derive(Debug, Error)]
pub enum TemplateError {
    /// TOML 解析失败
    #[error("模板 TOML 解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 模板定义不合法
    #[error("模板 {id} 定义不合法: {reason}")]
    Invalid { id: String, reason: String },
    /// 模板 ID 重复
    #[error("模板 ID 重复: {id}")]
    DuplicateId { id: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 取值超出范围
    #[error("配置项 {key} 的值 {value} 超出范围: {expected}")]
    OutOfRange {
        key: String,
        value: String,
        expected: String,
    },
    /// 配置文件解析失败
    #[error("配置文件解析失败 ({path}): {source}")]
    FileParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 从常见错误类型转换 ==========
// anyhow 已经为所有实现了 std::error::Error 的类型提供了转换

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::File(FileError::Json(err))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Template(TemplateError::TomlParseFailed {
            path: String::new(), // TOML错误通常不包含路径信息
            source: err,
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建图像解码错误
    pub fn image_decode(filename: impl Into<String>, source: image::ImageError) -> Self {
        AppError::Document(DocumentError::ImageDecode {
            filename: filename.into(),
            source,
        })
    }

    /// 是否为文档级致命错误
    pub fn is_fatal_document_error(&self) -> bool {
        matches!(self, AppError::Document(_))
    }
}

impl TierError {
    /// 创建请求失败错误
    pub fn request_failed(
        tier: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TierError::RequestFailed {
            tier: tier.into(),
            source: Box::new(source),
        }
    }

    /// 创建解析失败错误
    pub fn malformed(tier: impl Into<String>, message: impl Into<String>) -> Self {
        TierError::MalformedResponse {
            tier: tier.into(),
            message: message.into(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
