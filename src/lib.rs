//! powerall - per-node power telemetry and control agent
//! powerall - 单节点功耗遥测与控制代理
//!
//! The agent serves a Prometheus scrape endpoint and a small command API
//! over a set of pluggable hardware components (CPU frequency scaling,
//! NVIDIA accelerators, baseboard management controllers).
//! 代理通过可插拔的硬件组件提供 Prometheus 抓取端点和命令接口。

pub mod agent;
pub mod backends;
pub mod components;
pub mod config;
pub mod constants;
pub mod metrics;
