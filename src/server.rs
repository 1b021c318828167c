use anyhow::Result;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::decision::should_proxy;
use crate::dns::Resolver;
use crate::error::RelayError;
use crate::metrics::{ConnectionGuard, Metrics};
use crate::nat::{AssociationKey, Associations, NatTable};
use crate::proxy::relay;
use crate::rules::RuleRepository;
use crate::socks5::{
    negotiate, read_request, write_reply, TargetAddr, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT,
    CMD_UDP_ASSOCIATE, REP_ADDR_TYPE_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_SUCCEEDED,
};
use crate::stack::{HostDialer, Outbound, VirtualStack};
use crate::udp::serve_udp;

/// 协商和读取请求的超时时间
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// 关闭时等待活跃连接的最长时间（秒）
const SHUTDOWN_GRACE_SECS: u64 = 30;

/// 转发相关的可调参数
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// TCP 转发的空闲超时，为 0 时不限制
    pub tcp_timeout: Duration,
    /// UDP 会话的空闲超时，为 0 时不限制
    pub udp_timeout: Duration,
    /// 只接受已通过 UDP ASSOCIATE 登记的来源
    pub limit_udp: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(60),
            udp_timeout: Duration::from_secs(60),
            limit_udp: false,
        }
    }
}

/// 一次分流的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub addr: SocketAddrV4,
    pub via_tunnel: bool,
}

/// 所有连接共享的状态
pub struct RelayContext {
    pub repo: Arc<RuleRepository>,
    pub resolver: Resolver,
    pub tunnel: Arc<dyn VirtualStack>,
    pub direct: Arc<dyn VirtualStack>,
    pub tunnel_ip: Ipv4Addr,
    pub settings: ServerSettings,
    pub metrics: Metrics,
    pub nat: NatTable,
    pub associations: Associations,
    /// 服务关闭时取消，所有 UDP 关联都是它的子 token
    pub shutdown: CancellationToken,
}

impl RelayContext {
    /// 解析目标并决定走隧道还是直连
    pub async fn route(&self, target: &TargetAddr) -> Result<Route, RelayError> {
        let (host, ip) = match target {
            TargetAddr::Ip(SocketAddr::V4(addr)) => (addr.ip().to_string(), *addr.ip()),
            TargetAddr::Ip(SocketAddr::V6(_)) => {
                return Err(RelayError::UnsupportedAddressType(ATYP_IPV6));
            }
            TargetAddr::Domain(domain, _) => (domain.clone(), self.resolver.resolve(domain).await?),
        };

        let via_tunnel = should_proxy(&self.repo, &host, ip, target.port());
        if via_tunnel {
            self.metrics.inc_tunnel_requests();
        } else {
            self.metrics.inc_direct_requests();
        }

        Ok(Route {
            addr: SocketAddrV4::new(ip, target.port()),
            via_tunnel,
        })
    }

    pub fn stack_for(&self, route: &Route) -> &dyn VirtualStack {
        if route.via_tunnel {
            self.tunnel.as_ref()
        } else {
            self.direct.as_ref()
        }
    }

    /// CONNECT：解析、分流并建立出站连接
    pub async fn connect(&self, target: &TargetAddr) -> Result<Outbound, RelayError> {
        let route = self.route(target).await?;
        let bind = if route.via_tunnel {
            SocketAddrV4::new(self.tunnel_ip, 0)
        } else {
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        };

        self.stack_for(&route)
            .dial_tcp(bind, route.addr)
            .await
            .map_err(|source| RelayError::Dial {
                target: route.addr.to_string(),
                source,
            })
    }
}

/// 本地 SOCKS5 服务
pub struct Socks5Server {
    /// 监听地址
    listen_addr: SocketAddr,
    /// 隧道分配的本地地址
    tunnel_ip: Ipv4Addr,
    repo: Arc<RuleRepository>,
    tunnel: Arc<dyn VirtualStack>,
    direct: Arc<dyn VirtualStack>,
    settings: ServerSettings,
    /// 最大并发连接数
    max_connections: usize,
    metrics: Metrics,
}

impl Socks5Server {
    pub fn new(
        listen_addr: SocketAddr,
        tunnel_ip: Ipv4Addr,
        repo: Arc<RuleRepository>,
        tunnel: Arc<dyn VirtualStack>,
    ) -> Self {
        Self {
            listen_addr,
            tunnel_ip,
            repo,
            tunnel,
            direct: Arc::new(HostDialer),
            settings: ServerSettings::default(),
            max_connections: adaptive_max_connections(),
            metrics: Metrics::new(),
        }
    }

    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tcp_timeout(mut self, tcp_timeout: Duration) -> Self {
        self.settings.tcp_timeout = tcp_timeout;
        self
    }

    pub fn with_udp_timeout(mut self, udp_timeout: Duration) -> Self {
        self.settings.udp_timeout = udp_timeout;
        self
    }

    pub fn with_limit_udp(mut self, limit_udp: bool) -> Self {
        self.settings.limit_udp = limit_udp;
        self
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// 替换直连使用的拨号器
    pub fn with_direct_stack(mut self, direct: Arc<dyn VirtualStack>) -> Self {
        self.direct = direct;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn repo(&self) -> &Arc<RuleRepository> {
        &self.repo
    }

    /// 启动服务
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(None).await
    }

    /// 启动服务（支持优雅关闭）
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<watch::Receiver<bool>>) -> Result<()> {
        let (listener, udp) = self.bind()?;
        self.serve(listener, udp, shutdown_rx).await
    }

    /// 创建 TCP 监听和同一地址上的 UDP socket
    pub fn bind(&self) -> Result<(TcpListener, UdpSocket)> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.listen_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if let Err(e) = socket.set_reuse_port(true) {
                warn!("设置 SO_REUSEPORT 失败: {}", e);
            }
        }

        socket.bind(&self.listen_addr.into())?;
        // 默认 128 太小，高并发时 accept 队列会溢出
        socket.listen(4096)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        let udp = std::net::UdpSocket::bind(local_addr)?;
        udp.set_nonblocking(true)?;
        let udp = UdpSocket::from_std(udp)?;

        Ok((listener, udp))
    }

    /// 在已绑定的 socket 上提供服务，直到收到关闭信号
    pub async fn serve(
        &self,
        listener: TcpListener,
        udp: UdpSocket,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;

        info!("SOCKS5 服务启动在 {} (UDP {})", local_addr, udp_addr);
        info!("隧道地址: {}", self.tunnel_ip);
        info!("最大并发连接数: {}", self.max_connections);
        info!(
            "规则: 域名 {} 条, IPv4 {} 条, DNS 覆盖 {} 条, DNS 服务器 {:?}",
            self.repo.domain_rule_count(),
            self.repo.ipv4_rule_count(),
            self.repo.dns_override_count(),
            self.repo.dns_servers()
        );

        let ctx = Arc::new(RelayContext {
            repo: self.repo.clone(),
            resolver: Resolver::new(
                self.repo.clone(),
                self.tunnel.clone(),
                self.tunnel_ip,
                self.metrics.clone(),
            ),
            tunnel: self.tunnel.clone(),
            direct: self.direct.clone(),
            tunnel_ip: self.tunnel_ip,
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
            nat: NatTable::new(),
            associations: Associations::new(),
            shutdown: CancellationToken::new(),
        });

        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        // 每分钟打印监控指标
        let metrics = self.metrics.clone();
        let reporter = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics.print_summary();
            }
        });

        let udp_task = tokio::spawn(serve_udp(ctx.clone(), Arc::new(udp)));

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("🛑 收到关闭信号，停止接受新连接");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handle_new_connection(stream, peer, &semaphore, &ctx, udp_addr).await;
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        // 取消所有 UDP 关联和会话
        ctx.shutdown.cancel();
        if let Err(e) = udp_task.await {
            warn!("UDP 接收任务异常退出: {}", e);
        }

        info!("⏳ 等待活跃连接完成...");
        let wait_start = Instant::now();
        for _ in 0..SHUTDOWN_GRACE_SECS {
            let active = self.metrics.get_active_connections();
            if active == 0 {
                info!("✅ 所有连接已关闭");
                break;
            }
            info!("⏳ 等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let remaining = self.metrics.get_active_connections();
        if remaining > 0 {
            warn!("⚠️  超时：仍有 {} 个连接未关闭，强制退出", remaining);
        }
        info!("⏱️  关闭耗时: {:?}", wait_start.elapsed());

        reporter.abort();
        info!("📊 最终统计:");
        self.metrics.print_summary();

        Ok(())
    }
}

/// 根据 CPU 核心数估算最大并发连接数，每核 500，上限 10000
fn adaptive_max_connections() -> usize {
    std::cmp::min(10000, num_cpus::get() * 500)
}

/// 没有关闭信号或发送端已丢弃时永远等待
async fn wait_for_shutdown(shutdown_rx: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown_rx {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

async fn handle_new_connection(
    stream: TcpStream,
    peer: SocketAddr,
    semaphore: &Arc<Semaphore>,
    ctx: &Arc<RelayContext>,
    udp_addr: SocketAddr,
) {
    let permit_start = Instant::now();
    let permit = match semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(e) => {
            error!("获取连接许可失败: {}", e);
            return;
        }
    };
    let permit_elapsed = permit_start.elapsed();
    if permit_elapsed.as_millis() > 10 {
        debug!("⏱️  等待许可: {}ms", permit_elapsed.as_millis());
    }

    debug!("接受来自 {} 的新连接", peer);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let metrics = ctx.metrics.clone();

        // 捕获 panic，单个连接不影响整个服务
        let result = std::panic::AssertUnwindSafe(handle_connection(stream, peer, ctx, udp_addr))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics.inc_failed_connections();
                debug!("处理 {} 的连接时出错: {}", peer, e);
            }
            Err(panic_err) => {
                error!("❌ 连接处理任务 panic: {:?}", panic_err);
                metrics.inc_failed_connections();
            }
        }
    });
}

/// 单个控制连接：协商 -> 读请求 -> CONNECT / UDP ASSOCIATE
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
    udp_addr: SocketAddr,
) -> Result<(), RelayError> {
    let _guard = ConnectionGuard::new(ctx.metrics.clone());
    let _ = stream.set_nodelay(true);

    let handshake = async {
        negotiate(&mut stream).await?;
        read_request(&mut stream).await
    };
    let handshake = timeout(HANDSHAKE_TIMEOUT, handshake).await;
    let request = match handshake {
        Ok(Ok(request)) => request,
        Ok(Err(RelayError::UnsupportedAddressType(atyp))) => {
            ctx.metrics.inc_socks5_errors();
            write_reply(&mut stream, REP_ADDR_TYPE_NOT_SUPPORTED, &TargetAddr::unspecified(ATYP_IPV4)).await?;
            return Err(RelayError::UnsupportedAddressType(atyp));
        }
        Ok(Err(e)) => {
            ctx.metrics.inc_socks5_errors();
            return Err(e);
        }
        Err(_) => {
            ctx.metrics.inc_connection_timeouts();
            debug!("{} 握手超时", peer);
            return Ok(());
        }
    };

    debug!("{} 请求 {:#04x} {}", peer, request.command, request.target);

    match request.command {
        CMD_CONNECT => handle_connect(stream, request.target, &ctx).await,
        CMD_UDP_ASSOCIATE => handle_udp_associate(stream, peer, request.target, &ctx, udp_addr).await,
        other => {
            ctx.metrics.inc_socks5_errors();
            let err = RelayError::UnsupportedCommand(other);
            write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, &TargetAddr::unspecified(request.target.atyp()))
                .await?;
            Err(err)
        }
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    target: TargetAddr,
    ctx: &RelayContext,
) -> Result<(), RelayError> {
    let outbound = match ctx.connect(&target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            ctx.metrics.inc_socks5_errors();
            write_reply(&mut stream, e.reply_code(), &TargetAddr::unspecified(target.atyp())).await?;
            return Err(e);
        }
    };

    write_reply(&mut stream, REP_SUCCEEDED, &TargetAddr::from(outbound.local_addr)).await?;
    debug!("开始转发 {} <-> {}", target, outbound.local_addr);

    relay(stream, outbound.stream, ctx.settings.tcp_timeout, ctx.metrics.clone()).await;
    Ok(())
}

/// 登记 UDP 关联，并保持控制连接直到客户端关闭
async fn handle_udp_associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    declared: TargetAddr,
    ctx: &RelayContext,
    udp_addr: SocketAddr,
) -> Result<(), RelayError> {
    // 监听在通配地址上时，用控制连接的本地地址告诉客户端往哪发
    let bind = if udp_addr.ip().is_unspecified() {
        SocketAddr::new(stream.local_addr()?.ip(), udp_addr.port())
    } else {
        udp_addr
    };

    let key = AssociationKey::from_request(&declared, peer);
    let token = ctx.shutdown.child_token();
    let id = ctx.associations.register(key, token.clone());
    ctx.metrics.inc_udp_associations();

    if let Err(e) = write_reply(&mut stream, REP_SUCCEEDED, &TargetAddr::from(bind)).await {
        token.cancel();
        ctx.associations.unregister(&key, id);
        return Err(e.into());
    }
    info!("UDP 关联已建立: {:?} (UDP 端点 {})", key, bind);

    // 控制连接只用于存活检测，收到的数据直接丢弃
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = stream.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }

    token.cancel();
    ctx.associations.unregister(&key, id);
    info!("UDP 关联已结束: {:?}", key);
    Ok(())
}
