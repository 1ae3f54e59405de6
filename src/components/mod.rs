//! Pluggable hardware components
//! 可插拔硬件组件
//!
//! A component is a named unit of telemetry and control. Hardware specifics
//! live in a [`Driver`]; the [`guard::Guarded`] wrapper adds the lifecycle
//! and locking every driver shares, and the result is served to the HTTP
//! layer as a [`Component`] trait object through the [`registry`].
//! 组件是遥测与控制的命名单元。硬件细节在 Driver 中实现，Guarded 提供统一的生命周期与加锁。

pub mod bmc;
pub mod cpu;
pub mod guard;
pub mod nvgpu;
pub mod range_spec;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::config::AgentConfig;
use crate::backends::BackendError;
use crate::metrics::MetricSample;

pub use guard::Guarded;
pub use range_spec::{RangeSpec, RangeSpecError, Selector};
pub use registry::ComponentRegistry;

/// Attribute query result / 属性查询结果
pub type AttrMap = serde_json::Map<String, Value>;

/// Outcome of a control command / 控制命令的结果
///
/// Serialized as a single-key object: `{"success": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlResult {
    Success(String),
    Error(String),
}

impl ControlResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::Error(m) => m,
        }
    }
}

/// Why setup left a component disabled / 启动后组件被禁用的原因
#[derive(Error, Debug)]
pub enum SetupError {
    /// Turned off in configuration / 配置中关闭
    #[error("disabled by configuration")]
    Disabled,

    /// Configured backend variant is not known / 未知的后端类型
    #[error("unsupported backend variant `{0}`")]
    UnsupportedBackend(String),

    /// Backend discovery failed / 后端发现失败
    #[error("backend discovery failed: {0}")]
    Discovery(#[from] BackendError),
}

/// Lifecycle phase of a component / 组件生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Serving,
    Disabled,
    TornDown,
}

/// Hardware-specific implementation of the component operations
/// 组件操作的硬件相关实现
///
/// Drivers are never called concurrently; [`Guarded`] serializes every
/// call. Read failures are logged and the affected samples omitted, write
/// failures become [`ControlResult::Error`].
pub trait Driver: Send {
    /// Name exposed over HTTP / 通过HTTP暴露的名称
    const NAME: &'static str;

    /// One-time discovery / 一次性发现
    fn setup(&mut self, config: &AgentConfig) -> Result<(), SetupError>;

    /// Release backend resources. Only called after a successful setup.
    fn teardown(&self);

    fn get_attrs(&self, names: &[String]) -> AttrMap;

    /// Collect the current samples / 采集当前样本
    fn update(&self) -> Vec<MetricSample>;

    fn control(&self, tokens: &[String]) -> ControlResult;
}

/// Object-safe component served by the registry / 注册表提供的组件接口
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    fn setup(&mut self, config: &AgentConfig);

    fn teardown(&self);

    fn phase(&self) -> Phase;

    fn is_enabled(&self) -> bool {
        self.phase() == Phase::Serving
    }

    /// Prometheus text exposition bytes, empty when there is nothing to report
    /// Prometheus 文本格式字节，无数据时为空
    fn update(&self) -> Vec<u8>;

    fn get_attrs(&self, names: &[String]) -> AttrMap;

    fn control(&self, tokens: &[String]) -> ControlResult;
}

/// Left-to-right cursor over control tokens / 从左到右的控制标记游标
#[derive(Debug)]
pub struct CommandTokens<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> CommandTokens<'a> {
    pub fn new(tokens: &'a [String]) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Next operation token, `None` once the input is consumed.
    pub fn next_op(&mut self) -> Option<&'a str> {
        let op = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(op.as_str())
    }

    /// Take exactly `n` positional arguments, `None` on short input.
    pub fn args(&mut self, n: usize) -> Option<&'a [String]> {
        let end = self.pos.checked_add(n)?;
        let args = self.tokens.get(self.pos..end)?;
        self.pos = end;
        Some(args)
    }
}
