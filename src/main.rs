use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tunnel_socks::logger::{init_from_env, init_logger};
use tunnel_socks::{Config, InterfaceStack, Socks5Server};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::load(&config_path)?;

    // 配置里没有 log 段时按 RUST_LOG 输出
    match &config.log {
        Some(log_settings) => {
            init_logger(log_settings.to_log_config())
                .map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;
            log::info!("=== 隧道 SOCKS5 服务启动 ===");
            log::info!("日志级别: {}", log_settings.level);
            log::info!("日志输出: {}", log_settings.output);
            if log_settings.enable_rotation {
                log::info!(
                    "日志轮转: 启用 ({}MB per file, {} backups)",
                    log_settings.max_size_mb,
                    log_settings.max_backups
                );
            }
        }
        None => {
            init_from_env()?;
            log::info!("=== 隧道 SOCKS5 服务启动 ===");
            log::info!("日志: 按 RUST_LOG 输出");
        }
    }
    log::info!("配置文件: {}", config_path);

    let listen_addr = config.listen_addr()?;
    let tunnel_ip = config.tunnel_ip()?;
    log::info!("监听地址: {}", listen_addr);
    match &config.tunnel.interface {
        Some(interface) => log::info!("隧道: {} ({})", tunnel_ip, interface),
        None => log::info!("隧道: {} (未指定网卡，仅按源地址绑定)", tunnel_ip),
    }

    let repo = Arc::new(config.build_repository());
    let tunnel = Arc::new(InterfaceStack::new(tunnel_ip, config.tunnel.interface.clone()));

    let mut server = Socks5Server::new(listen_addr, tunnel_ip, repo, tunnel)
        .with_settings(config.server_settings());
    if let Some(max_connections) = config.max_connections {
        server = server.with_max_connections(max_connections);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => log::error!("监听退出信号失败: {}", e),
        }
    });

    log::info!("=== 服务器准备就绪 ===");
    server.run_with_shutdown(Some(shutdown_rx)).await?;

    Ok(())
}
