//! HTTP gateway for the agent
//! 代理的HTTP网关
//!
//! Routes:
//! - `GET /metrics` scrape endpoint / 抓取端点
//! - `GET /api/control/{component}` ordered query values as control tokens
//! - `GET /api/get/{component}` ordered query values as attribute names
//! - `GET /api/components` registered component names / 已注册组件名称

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::Value;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::agent::config::AgentConfig;
use crate::components::{AttrMap, ComponentRegistry, ControlResult};
use crate::metrics::{self, InfoFamily};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const NOT_SUPPORTED: &str = "Not support component";

/// HTTP gateway server / HTTP网关服务器
pub struct HttpGateway {
    config: Arc<AgentConfig>,
    registry: Arc<ComponentRegistry>,
}

/// Application state / 应用状态
#[derive(Clone)]
pub struct AppState {
    registry: Arc<ComponentRegistry>,
    /// Pre-encoded `in_which_cluster_info` block / 预编码的集群标识块
    identity: Arc<Vec<u8>>,
}

impl AppState {
    pub fn new(registry: Arc<ComponentRegistry>, cluster: &str) -> Self {
        Self {
            registry,
            identity: Arc::new(identity_block(cluster)),
        }
    }
}

/// Process identity metric prefixed to every scrape / 每次抓取前置的进程标识指标
pub fn identity_block(cluster: &str) -> Vec<u8> {
    let family = InfoFamily::new("in_which_cluster", "Indicates job in which cluster", &[]);
    let sample = family.sample::<&str>(&[], &[("cluster", cluster.to_string())]);
    match metrics::encode(&[sample]) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to encode cluster identity");
            Vec::new()
        }
    }
}

/// Query values in order of appearance, keys ignored / 按出现顺序的查询值，忽略键
pub fn query_values(query: Option<&str>) -> Vec<String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(_, v)| v.into_owned())
                .collect()
        })
        .unwrap_or_default()
}

pub fn build_router(state: AppState, request_timeout: Option<Duration>) -> Router {
    let app = Router::new()
        .route("/metrics", get(scrape_metrics))
        .route("/api/control/{component}", get(control_component))
        .route("/api/get/{component}", get(get_component_attrs))
        .route("/api/components", get(list_components))
        .with_state(state);

    match request_timeout {
        Some(timeout) => app.layer(TimeoutLayer::new(timeout)),
        None => app,
    }
}

impl HttpGateway {
    /// Create new HTTP gateway / 创建新的HTTP网关
    pub fn new(config: Arc<AgentConfig>, registry: Arc<ComponentRegistry>) -> Self {
        Self { config, registry }
    }

    /// Start HTTP gateway server / 启动HTTP网关服务器
    pub async fn start(self) -> Result<()> {
        let (listener, app) = self.prepare().await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start HTTP gateway with shutdown signal / 使用关闭信号启动HTTP网关
    pub async fn start_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (listener, app) = self.prepare().await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    async fn prepare(self) -> Result<(tokio::net::TcpListener, Router)> {
        let target = self.config.http.bind_target();
        info!("Starting HTTP gateway on {}", target);

        let state = AppState::new(self.registry, &self.config.cluster);
        let timeout = match self.config.http.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let app = build_router(state, timeout);

        let listener = tokio::net::TcpListener::bind(&target)
            .await
            .with_context(|| format!("failed to bind {target}"))?;
        info!("HTTP gateway listening on {}", listener.local_addr()?);
        Ok((listener, app))
    }
}

async fn scrape_metrics(State(state): State<AppState>) -> Response {
    let registry = state.registry.clone();
    let mut body = state.identity.as_ref().clone();
    match tokio::task::spawn_blocking(move || registry.scrape()).await {
        Ok(bytes) => body.extend_from_slice(&bytes),
        Err(e) => error!(error = %e, "scrape task failed"),
    }
    ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response()
}

async fn control_component(
    State(state): State<AppState>,
    Path(component): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<ControlResult>, StatusCode> {
    let tokens = query_values(query.as_deref());
    debug!(%component, ?tokens, "control request");
    let registry = state.registry.clone();
    let result = tokio::task::spawn_blocking(move || {
        registry.get(&component).map(|c| c.control(&tokens))
    })
    .await
    .map_err(|e| {
        error!(error = %e, "control task failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(result.unwrap_or_else(|| {
        warn!("{}", NOT_SUPPORTED);
        ControlResult::error(NOT_SUPPORTED)
    })))
}

async fn get_component_attrs(
    State(state): State<AppState>,
    Path(component): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, StatusCode> {
    let names = query_values(query.as_deref());
    let registry = state.registry.clone();
    let attrs = tokio::task::spawn_blocking(move || {
        registry.get(&component).map(|c| c.get_attrs(&names))
    })
    .await
    .map_err(|e| {
        error!(error = %e, "get attrs task failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let attrs = attrs.unwrap_or_else(|| {
        warn!("{}", NOT_SUPPORTED);
        let mut error = AttrMap::new();
        error.insert("error".to_string(), Value::from(NOT_SUPPORTED));
        error
    });
    Ok(Json(Value::Object(attrs)))
}

async fn list_components(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.registry.names())
}
