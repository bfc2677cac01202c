//! relaycast 服务入口
//!
//! 配置文件路径通过 `RELAYCAST_CONFIG` 指定，否则依次查找
//! `./config.yaml` 与 `~/.relaycast/config.yaml`。

use relaycast_lib::config::load_config;
use relaycast_lib::providers::HttpTransport;
use relaycast_lib::server::{build_router, AppState};
use relaycast_lib::services::AdapterService;
use relaycast_lib::telemetry::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// 上游连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None)?;
    init_tracing(&config.logging);

    info!("relaycast v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(HttpTransport::new(CONNECT_TIMEOUT)?);
    let adapter = Arc::new(AdapterService::from_config(&config, transport)?);

    // 后台清理空闲会话，服务退出时随之结束
    let _sweeper = adapter
        .sessions()
        .spawn_sweeper(config.session.idle_ttl(), config.session.sweep_interval());

    let state = AppState::new(adapter, config.server.access_key.clone());
    let auth_enabled = state.access_key.is_some();
    let router = build_router(state, config.server.max_body_bytes);

    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "[SERVER] 监听 http://{}/v1/chat/completions (鉴权: {})",
        addr,
        if auth_enabled { "开启" } else { "关闭" }
    );

    axum::serve(listener, router).await?;
    Ok(())
}
