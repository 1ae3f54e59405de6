//! powerall agent configuration / powerall 代理配置

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::config::base::{LogConfig, ServerConfig};
use crate::config::{AppConfig, LoggingConfig};
use crate::constants::backend;

/// powerall command line arguments / powerall 命令行参数
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "powerall",
    version = "0.1.0",
    about = "powerall - per-node power telemetry and control agent\npowerall - 单节点功耗遥测与控制代理"
)]
pub struct CliArgs {
    /// HTTP bind host / HTTP绑定地址
    #[arg(short = 's', long = "server", value_name = "HOST", help = "Bind host / 绑定地址")]
    pub host: Option<String>,

    /// HTTP listen port / HTTP监听端口
    #[arg(short, long, value_name = "PORT", help = "Metrics port / 指标端口")]
    pub port: Option<u16>,

    /// Force debug logging / 强制调试日志
    #[arg(long, help = "Enable debug mode / 启用调试模式")]
    pub debug: Option<bool>,

    /// Cluster label exported with every scrape / 每次抓取导出的集群标签
    #[arg(long, value_name = "NAME")]
    pub cluster: Option<String>,

    /// Log level / 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error) / 日志级别"
    )]
    pub log_level: Option<String>,

    /// Log format / 日志格式
    #[arg(long, value_name = "FORMAT", help = "Log format (json, compact, pretty) / 日志格式")]
    pub log_format: Option<String>,

    /// Log file / 日志文件
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<String>,

    #[arg(long, value_name = "N")]
    pub max_blocking_threads: Option<usize>,

    #[arg(long, value_name = "SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, value_name = "BOOL")]
    pub cpu_enable: Option<bool>,

    #[arg(long, value_name = "BOOL")]
    pub nvgpu_enable: Option<bool>,

    /// Accelerator backend / 加速器后端
    #[arg(long, value_name = "BACKEND", help = "Accelerator backend (nvml) / 加速器后端")]
    pub nvgpu_config: Option<String>,

    #[arg(long, value_name = "BOOL")]
    pub bmc_enable: Option<bool>,

    /// Management controller address / 管理控制器地址
    #[arg(long, value_name = "HOST")]
    pub bmc_host: Option<String>,

    #[arg(long, value_name = "USER")]
    pub bmc_user: Option<String>,

    #[arg(long, value_name = "PASSWORD")]
    pub bmc_passwd: Option<String>,

    /// Board vendor profile / 主板厂商配置
    #[arg(long, value_name = "VENDOR", help = "BMC vendor config (Inspur-NF5280M6) / BMC厂商配置")]
    pub bmc_config: Option<String>,

    #[arg(long, value_name = "BOOL")]
    pub bmc_verify_tls: Option<bool>,
}

/// Processor frequency component settings / 处理器频率组件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub enable: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Accelerator component settings / 加速器组件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NvgpuConfig {
    pub enable: bool,
    /// Backend variant / 后端类型
    pub config: String,
}

impl Default for NvgpuConfig {
    fn default() -> Self {
        Self {
            enable: true,
            config: backend::NVML.to_string(),
        }
    }
}

/// Board management component settings / 基板管理组件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    pub enable: bool,
    pub host: String,
    pub user: String,
    pub passwd: String,
    /// Vendor profile / 厂商配置
    pub config: String,
    /// Verify the controller's TLS certificate / 校验控制器TLS证书
    pub verify_tls: bool,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".to_string(),
            user: "admin".to_string(),
            passwd: "admin".to_string(),
            config: backend::INSPUR_NF5280M6.to_string(),
            // Management controllers ship self-signed certificates.
            verify_tls: false,
        }
    }
}

/// Agent configuration / 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// HTTP server / HTTP服务器
    pub http: ServerConfig,
    /// Force debug logging / 强制调试日志
    pub debug: bool,
    /// Cluster label / 集群标签
    pub cluster: String,
    /// Logging / 日志
    pub logging: LogConfig,
    /// Upper bound of the blocking pool serving component calls
    /// 处理组件调用的阻塞线程池上限
    pub max_blocking_threads: usize,
    pub cpu: CpuConfig,
    pub nvgpu: NvgpuConfig,
    pub bmc: BmcConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http: ServerConfig::default(),
            debug: false,
            cluster: "powerall".to_string(),
            logging: LogConfig::default(),
            max_blocking_threads: 64,
            cpu: CpuConfig::default(),
            nvgpu: NvgpuConfig::default(),
            bmc: BmcConfig::default(),
        }
    }
}

impl AppConfig for AgentConfig {
    const ENV_PREFIX: &'static str = "POWERALL_";

    fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.http.host.trim().is_empty() {
            bail!("http host must not be empty");
        }
        if self.cluster.trim().is_empty() {
            bail!("cluster label must not be empty");
        }
        if self.max_blocking_threads == 0 {
            bail!("max_blocking_threads must be at least 1");
        }
        if !matches!(self.logging.format.as_str(), "json" | "compact" | "pretty") {
            bail!("unknown log format: {}", self.logging.format);
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Load configuration with CLI arguments / 使用CLI参数加载配置
    ///
    /// Defaults, then `POWERALL_*` environment variables, then CLI flags.
    pub fn load_with_cli(args: &CliArgs) -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    /// Apply explicitly given CLI flags / 应用显式给出的命令行参数
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(v) = &args.host {
            self.http.host = v.clone();
        }
        if let Some(v) = args.port {
            self.http.port = v;
        }
        if let Some(v) = args.debug {
            self.debug = v;
        }
        if let Some(v) = &args.cluster {
            self.cluster = v.clone();
        }
        if let Some(v) = &args.log_level {
            self.logging.level = v.clone();
        }
        if let Some(v) = &args.log_format {
            self.logging.format = v.clone();
        }
        if let Some(v) = &args.log_file {
            self.logging.file = Some(v.clone());
        }
        if let Some(v) = args.max_blocking_threads {
            self.max_blocking_threads = v;
        }
        if let Some(v) = args.request_timeout_secs {
            self.http.request_timeout_secs = v;
        }
        if let Some(v) = args.cpu_enable {
            self.cpu.enable = v;
        }
        if let Some(v) = args.nvgpu_enable {
            self.nvgpu.enable = v;
        }
        if let Some(v) = &args.nvgpu_config {
            self.nvgpu.config = v.clone();
        }
        if let Some(v) = args.bmc_enable {
            self.bmc.enable = v;
        }
        if let Some(v) = &args.bmc_host {
            self.bmc.host = v.clone();
        }
        if let Some(v) = &args.bmc_user {
            self.bmc.user = v.clone();
        }
        if let Some(v) = &args.bmc_passwd {
            self.bmc.passwd = v.clone();
        }
        if let Some(v) = &args.bmc_config {
            self.bmc.config = v.clone();
        }
        if let Some(v) = args.bmc_verify_tls {
            self.bmc.verify_tls = v;
        }
    }

    /// Logging settings with the debug flag applied / 应用调试标志后的日志配置
    pub fn logging_config(&self) -> LoggingConfig {
        let mut logging = self.logging.to_logging_config();
        if self.debug {
            logging.level = "debug".to_string();
        }
        logging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.http.host, "127.0.0.1");
        assert_eq!(cfg.http.port, 8082);
        assert_eq!(cfg.cluster, "powerall");
        assert!(!cfg.debug);
        assert!(cfg.cpu.enable && cfg.nvgpu.enable && cfg.bmc.enable);
        assert_eq!(cfg.nvgpu.config, "nvml");
        assert_eq!(cfg.bmc.config, "Inspur-NF5280M6");
        assert_eq!(cfg.bmc.user, "admin");
        assert!(!cfg.bmc.verify_tls);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("POWERALL_CLUSTER", "hpc-a");
            jail.set_env("POWERALL_HTTP__PORT", "9100");
            jail.set_env("POWERALL_BMC__HOST", "10.0.0.7");
            jail.set_env("POWERALL_NVGPU__ENABLE", "false");

            let cfg = AgentConfig::load_with_cli(&CliArgs::default()).expect("load");
            assert_eq!(cfg.cluster, "hpc-a");
            assert_eq!(cfg.http.port, 9100);
            assert_eq!(cfg.bmc.host, "10.0.0.7");
            assert!(!cfg.nvgpu.enable);
            assert_eq!(cfg.bmc.user, "admin");
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_env() {
        Jail::expect_with(|jail| {
            jail.set_env("POWERALL_CLUSTER", "from-env");
            jail.set_env("POWERALL_HTTP__PORT", "9100");

            let args = CliArgs::parse_from([
                "powerall",
                "--cluster",
                "from-cli",
                "--bmc-config",
                "Other-Board",
                "--cpu-enable",
                "false",
            ]);
            let cfg = AgentConfig::load_with_cli(&args).expect("load");
            assert_eq!(cfg.cluster, "from-cli");
            assert_eq!(cfg.http.port, 9100);
            assert_eq!(cfg.bmc.config, "Other-Board");
            assert!(!cfg.cpu.enable);
            Ok(())
        });
    }

    #[test]
    fn test_cli_short_flags() {
        let args = CliArgs::parse_from(["powerall", "-s", "0.0.0.0", "-p", "8090"]);
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(8090));
        assert!(args.debug.is_none());
    }

    #[test]
    fn test_debug_forces_debug_level() {
        let mut cfg = AgentConfig::default();
        assert_eq!(cfg.logging_config().level, "info");
        cfg.debug = true;
        assert_eq!(cfg.logging_config().level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = AgentConfig::default();
        cfg.max_blocking_threads = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.logging.format = "xml".to_string();
        assert!(cfg.validate().is_err());
    }
}
