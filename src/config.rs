use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{ingest_dns_data, ingest_resource};
use crate::logger::{LogConfig, LogLevel, LogOutput};
use crate::rules::RuleRepository;
use crate::server::ServerSettings;

/// 配置文件
#[derive(Debug, Deserialize)]
pub struct Config {
    /// 本地 SOCKS5 监听地址
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub tunnel: TunnelConfig,
    /// TCP 空闲超时（秒），0 表示不限制
    #[serde(default = "default_timeout_secs")]
    pub tcp_timeout_secs: u64,
    /// UDP 空闲超时（秒），0 表示不限制
    #[serde(default = "default_timeout_secs")]
    pub udp_timeout_secs: u64,
    #[serde(default)]
    pub limit_udp: bool,
    /// 不设置时按 CPU 核心数自适应
    pub max_connections: Option<usize>,
    /// 主、备 DNS 服务器，只能经隧道访问；`0.0.0.0` 表示未配置
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// `id:domain:ip;` 格式的 DNS 数据
    pub dns_data: Option<String>,
    #[serde(default)]
    pub dns_overrides: BTreeMap<String, String>,
    pub log: Option<LogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    /// 隧道分配的本地 IPv4 地址
    pub local_ip: String,
    /// 隧道网卡名，例如 tun0
    pub interface: Option<String>,
}

/// 一组资源，`host` 与 `port` 都是 `;` 分隔并按位置对应
#[derive(Debug, Deserialize)]
pub struct ResourceConfig {
    pub host: String,
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// stdout / file / both
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file_path: Option<String>,
    #[serde(default)]
    pub enable_rotation: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            enable_rotation: false,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl LogSettings {
    pub fn to_log_config(&self) -> LogConfig {
        let path = || {
            PathBuf::from(
                self.file_path
                    .clone()
                    .unwrap_or_else(|| "logs/tunnel-socks.log".to_string()),
            )
        };

        let output = match self.output.as_str() {
            "file" | "both" if self.enable_rotation => LogOutput::RotatingFile {
                path: path(),
                max_size: self.max_size_mb * 1024 * 1024,
                max_backups: self.max_backups,
            },
            "file" => LogOutput::File(path()),
            "both" => LogOutput::Both(path()),
            _ => LogOutput::Stdout,
        };

        LogConfig::new(self.level)
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color)
            .with_output(output)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("解析配置文件失败")
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("无效的监听地址: {}", self.listen_addr))
    }

    pub fn tunnel_ip(&self) -> Result<Ipv4Addr> {
        self.tunnel
            .local_ip
            .parse()
            .with_context(|| format!("无效的隧道地址: {}", self.tunnel.local_ip))
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            tcp_timeout: Duration::from_secs(self.tcp_timeout_secs),
            udp_timeout: Duration::from_secs(self.udp_timeout_secs),
            limit_udp: self.limit_udp,
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        self.log.clone().unwrap_or_default()
    }

    /// 把配置里的规则导入新的规则仓库，无效条目跳过
    pub fn build_repository(&self) -> RuleRepository {
        let repo = RuleRepository::new();

        if self.dns_servers.len() > 2 {
            warn!("只使用前两个 DNS 服务器，忽略 {:?}", &self.dns_servers[2..]);
        }
        repo.append_dns_servers(self.dns_servers.iter().take(2).cloned());

        let mut accepted = 0;
        for resource in &self.resources {
            accepted += ingest_resource(&repo, &resource.host, &resource.port);
        }
        info!("导入了 {} 条资源规则", accepted);

        if let Some(data) = &self.dns_data {
            ingest_dns_data(&repo, data);
        }
        for (domain, ip) in &self.dns_overrides {
            if !repo.append_dns_override(domain, ip) {
                warn!("跳过无效的 DNS 覆盖: {:?} -> {:?}", domain, ip);
            }
        }

        repo
    }
}
