//! Configuration management for powerall
//! powerall 的配置管理
//!
//! Configuration is layered, highest precedence first:
//! 配置分层，优先级从高到低：
//! 1. Command line arguments / 命令行参数
//! 2. Environment variables / 环境变量
//! 3. Default values / 默认值
//!
//! There is deliberately no configuration file layer.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{Layer, Registry};

/// Base configuration shared by all applications / 所有应用程序共享的基础配置
pub mod base;
pub use base::*;

/// Base configuration trait / 基础配置特征
pub trait AppConfig: for<'de> Deserialize<'de> + Serialize + Clone + std::fmt::Debug {
    /// Environment variable prefix, nested keys are split on `__`
    /// 环境变量前缀，嵌套键以 `__` 分隔
    const ENV_PREFIX: &'static str;

    /// Get default configuration values / 获取默认配置值
    fn default_config() -> Self;

    /// Defaults merged with the environment / 默认值与环境变量合并
    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default_config()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Load defaults and environment / 加载默认值和环境变量
    fn load() -> Result<Self> {
        Self::figment()
            .extract()
            .context("Failed to load configuration")
    }

    /// Validate the configuration / 验证配置
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Common logging configuration / 通用日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) / 日志级别
    pub level: String,
    /// Log format (json, compact, pretty) / 日志格式
    pub format: String,
    /// Enable file logging / 启用文件日志
    pub file_enabled: bool,
    /// Log file path / 日志文件路径
    pub file_path: Option<PathBuf>,
}

static FILE_LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: &str, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(ansi)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(writer);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

/// Initialize tracing based on logging configuration
/// 基于日志配置初始化跟踪
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.trim().is_empty() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(config.level.clone())
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![format_layer(&config.format, std::io::stdout, true)];

    if config.file_enabled {
        if let Some(path) = config.file_path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file: {}", path.display()))?;
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_LOG_GUARD.set(guard);
            // Files always get single-line records.
            let file_format = if config.format == "json" { "json" } else { "compact" };
            layers.push(format_layer(file_format, file_writer, false));
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("tracing subscriber already initialized")?;

    Ok(())
}
