//! Base configuration structures and utilities
//! 基础配置结构和工具

use serde::{Deserialize, Serialize};

/// Base server configuration / 基础服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind host / 服务器绑定地址
    pub host: String,
    /// Server listen port / 服务器监听端口
    pub port: u16,
    /// Transport request timeout in seconds, 0 disables it
    /// 传输层请求超时（秒），0 表示不启用
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8082,
            request_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// `host:port` string accepted by `TcpListener::bind`
    pub fn bind_target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Base logging configuration / 基础日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level / 日志级别
    pub level: String,
    /// Log format / 日志格式
    pub format: String,
    /// Log output file / 日志输出文件
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    /// Convert to the common LoggingConfig used by init_tracing
    /// 转换为init_tracing使用的通用LoggingConfig
    pub fn to_logging_config(&self) -> crate::config::LoggingConfig {
        crate::config::LoggingConfig {
            level: self.level.clone(),
            format: self.format.clone(),
            file_enabled: self.file.is_some(),
            file_path: self.file.as_ref().map(std::path::PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_target() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_target(), "127.0.0.1:8082");
        let v6 = ServerConfig {
            host: "::1".to_string(),
            ..Default::default()
        };
        assert_eq!(v6.bind_target(), "[::1]:8082");
    }

    #[test]
    fn test_log_config_conversion() {
        let cfg = LogConfig {
            file: Some("/var/log/powerall.log".to_string()),
            ..Default::default()
        };
        let logging = cfg.to_logging_config();
        assert!(logging.file_enabled);
        assert_eq!(logging.level, "info");
    }
}
