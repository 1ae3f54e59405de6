//! powerall agent: configuration and HTTP surface
//! powerall 代理：配置与HTTP接口

pub mod config;
pub mod http_gateway;
