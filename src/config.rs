//! 程序配置
//!
//! 配置来源按优先级：环境变量 > TOML 配置文件 > 默认值。

use crate::error::ConfigError;
use crate::models::answer::ExtractionMethod;
use serde::Deserialize;
use std::path::Path;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时处理的文档数量
    pub max_concurrent_documents: usize,
    /// 待处理答题卡图像目录
    pub input_folder: String,
    /// 结果 JSON 输出目录
    pub output_folder: String,
    /// 额外模板（TOML）目录
    pub template_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    /// 人工复核清单文件
    pub review_file: String,
    // --- expensive 层级（视觉大模型）配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    /// 可选的 HTTP 识别服务地址，优先于大模型
    pub tier_service_url: Option<String>,
    /// 流水线参数
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_documents: 4,
            input_folder: "input_sheets".to_string(),
            output_folder: "output_results".to_string(),
            template_folder: "templates".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            review_file: "review.txt".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o".to_string(),
            tier_service_url: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// 从默认值出发，叠加环境变量
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载，缺失的键保留默认值，再叠加环境变量
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::FileParseFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config = config.with_env_overrides();
        config.pipeline.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        let default = self;
        let p = &default.pipeline;
        let pipeline = PipelineConfig {
            max_batch_size: env_parse("MAX_BATCH_SIZE").unwrap_or(p.max_batch_size),
            fallback_confidence_threshold: env_parse("FALLBACK_CONFIDENCE_THRESHOLD")
                .unwrap_or(p.fallback_confidence_threshold),
            fallback_min_complexity: env_parse("FALLBACK_MIN_COMPLEXITY").unwrap_or(p.fallback_min_complexity),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(p.max_retries),
            noise_filtering_increment: env_parse("NOISE_FILTERING_INCREMENT").unwrap_or(p.noise_filtering_increment),
            geometric_max_deviation: env_parse("GEOMETRIC_MAX_DEVIATION").unwrap_or(p.geometric_max_deviation),
            interference_warning_threshold: env_parse("INTERFERENCE_WARNING_THRESHOLD")
                .unwrap_or(p.interference_warning_threshold),
            interference_critical_threshold: env_parse("INTERFERENCE_CRITICAL_THRESHOLD")
                .unwrap_or(p.interference_critical_threshold),
            batch_timeout_ms: env_parse("BATCH_TIMEOUT_MS").unwrap_or(p.batch_timeout_ms),
            ..p.clone()
        };
        Self {
            max_concurrent_documents: env_parse("MAX_CONCURRENT_DOCUMENTS").unwrap_or(default.max_concurrent_documents),
            input_folder: std::env::var("INPUT_FOLDER").unwrap_or(default.input_folder),
            output_folder: std::env::var("OUTPUT_FOLDER").unwrap_or(default.output_folder),
            template_folder: std::env::var("TEMPLATE_FOLDER").unwrap_or(default.template_folder),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            review_file: std::env::var("REVIEW_FILE").unwrap_or(default.review_file),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            tier_service_url: std::env::var("TIER_SERVICE_URL").ok().or(default.tier_service_url),
            pipeline,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// 流水线参数
///
/// 每份文档独立持有一份拷贝，处理过程中只读。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 单个批次最多包含的题目数，同时也是层级调用的并发上限
    pub max_batch_size: usize,
    /// cheap 层级结果低于该置信度时考虑升级
    pub fallback_confidence_threshold: f32,
    /// 只有复杂度高于该值的题目才会因低置信度升级
    pub fallback_min_complexity: f32,
    /// 每道题最多的恢复尝试次数
    pub max_retries: usize,
    /// 每次尝试增加的噪声过滤强度
    pub noise_filtering_increment: f32,
    /// 允许的最大几何偏差（像素）
    pub geometric_max_deviation: f32,
    /// 干扰率警告阈值
    pub interference_warning_threshold: f32,
    /// 干扰率严重阈值
    pub interference_critical_threshold: f32,
    /// 模式异常比例阈值
    pub pattern_anomaly_threshold: f32,
    /// 恢复循环提前结束的置信度
    pub acceptance_confidence: f32,
    /// 最低填涂置信度
    pub min_fill_confidence: f32,
    /// 模板匹配最低置信度
    pub template_min_confidence: f32,
    /// 与排除区域重叠时的置信度惩罚系数
    pub roi_exclusion_penalty: f32,
    /// 答题网格缓冲边距（像素）
    pub roi_grid_buffer: f32,
    /// cheap 层级单位成本
    pub cheap_unit_cost: f64,
    /// expensive 层级单位成本
    pub expensive_unit_cost: f64,
    /// 批次超时（毫秒）
    pub batch_timeout_ms: u64,
    /// 恢复时轮换使用的提取方法
    pub fallback_methods: Vec<ExtractionMethod>,
    /// 墨迹灰度阈值（小于该值视为墨迹）
    pub ink_threshold: u8,
    /// 最小墨迹面积（像素）
    pub min_mark_area: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            fallback_confidence_threshold: 0.7,
            fallback_min_complexity: 10.0,
            max_retries: 2,
            noise_filtering_increment: 0.1,
            geometric_max_deviation: 15.0,
            interference_warning_threshold: 0.3,
            interference_critical_threshold: 0.4,
            pattern_anomaly_threshold: 0.2,
            acceptance_confidence: 0.85,
            min_fill_confidence: 0.3,
            template_min_confidence: 0.5,
            roi_exclusion_penalty: 0.7,
            roi_grid_buffer: 20.0,
            cheap_unit_cost: 1.0,
            expensive_unit_cost: 10.0,
            batch_timeout_ms: 30_000,
            fallback_methods: vec![
                ExtractionMethod::TemplateAware,
                ExtractionMethod::OffsetCorrected,
                ExtractionMethod::ExpensiveTier,
            ],
            ink_threshold: 128,
            min_mark_area: 12,
        }
    }
}

impl PipelineConfig {
    /// 校验参数取值
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(out_of_range("max_batch_size", self.max_batch_size, ">= 1"));
        }
        for (key, value) in [
            ("fallback_confidence_threshold", self.fallback_confidence_threshold),
            ("interference_warning_threshold", self.interference_warning_threshold),
            ("interference_critical_threshold", self.interference_critical_threshold),
            ("pattern_anomaly_threshold", self.pattern_anomaly_threshold),
            ("acceptance_confidence", self.acceptance_confidence),
            ("min_fill_confidence", self.min_fill_confidence),
            ("template_min_confidence", self.template_min_confidence),
            ("roi_exclusion_penalty", self.roi_exclusion_penalty),
            ("noise_filtering_increment", self.noise_filtering_increment),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(out_of_range(key, value, "[0, 1]"));
            }
        }
        if self.interference_warning_threshold > self.interference_critical_threshold {
            return Err(out_of_range(
                "interference_warning_threshold",
                self.interference_warning_threshold,
                "<= interference_critical_threshold",
            ));
        }
        if self.geometric_max_deviation <= 0.0 {
            return Err(out_of_range("geometric_max_deviation", self.geometric_max_deviation, "> 0"));
        }
        if !(0.0..=100.0).contains(&self.fallback_min_complexity) {
            return Err(out_of_range("fallback_min_complexity", self.fallback_min_complexity, "[0, 100]"));
        }
        if self.fallback_methods.is_empty() {
            return Err(out_of_range("fallback_methods", "[]", "至少一个方法"));
        }
        Ok(())
    }
}

fn out_of_range(key: &str, value: impl ToString, expected: &str) -> ConfigError {
    ConfigError::OutOfRange {
        key: key.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}
