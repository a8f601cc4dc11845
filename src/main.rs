use anyhow::Result;
use sheet_extract::utils::logging;
use sheet_extract::{App, Config};
use std::path::Path;

/// 默认配置文件
const CONFIG_FILE: &str = "sheet_extract.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 配置文件路径取第一个命令行参数；文件不存在时只用环境变量与默认值
    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_FILE.to_string());
    let config = if Path::new(&config_path).exists() {
        Config::from_toml_file(Path::new(&config_path))?
    } else {
        Config::from_env()
    };

    // 初始化并运行应用
    App::initialize(config).await?.run().await?;

    Ok(())
}
