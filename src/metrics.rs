use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 流量统计
    bytes_client_to_remote: AtomicU64,
    bytes_remote_to_client: AtomicU64,

    // 分流统计
    tunnel_requests: AtomicU64,
    direct_requests: AtomicU64,

    // UDP
    udp_associations: AtomicU64,
    nat_entries: AtomicUsize,
    udp_rejected: AtomicU64,

    // DNS 统计
    dns_override_hits: AtomicU64,
    dns_cache_hits: AtomicU64,
    dns_cache_misses: AtomicU64,
    resolve_failures: AtomicU64,

    // 错误统计
    socks5_errors: AtomicU64,
    connection_timeouts: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                bytes_client_to_remote: AtomicU64::new(0),
                bytes_remote_to_client: AtomicU64::new(0),
                tunnel_requests: AtomicU64::new(0),
                direct_requests: AtomicU64::new(0),
                udp_associations: AtomicU64::new(0),
                nat_entries: AtomicUsize::new(0),
                udp_rejected: AtomicU64::new(0),
                dns_override_hits: AtomicU64::new(0),
                dns_cache_hits: AtomicU64::new(0),
                dns_cache_misses: AtomicU64::new(0),
                resolve_failures: AtomicU64::new(0),
                socks5_errors: AtomicU64::new(0),
                connection_timeouts: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // 连接统计
    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    // 流量统计
    pub fn add_bytes_client_to_remote(&self, bytes: u64) {
        self.inner.bytes_client_to_remote.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_remote_to_client(&self, bytes: u64) {
        self.inner.bytes_remote_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    // 分流统计
    pub fn inc_tunnel_requests(&self) {
        self.inner.tunnel_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_requests(&self) {
        self.inner.direct_requests.fetch_add(1, Ordering::Relaxed);
    }

    // UDP
    pub fn inc_udp_associations(&self) {
        self.inner.udp_associations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nat_entries(&self) {
        self.inner.nat_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_nat_entries(&self) {
        self.inner.nat_entries.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_udp_rejected(&self) {
        self.inner.udp_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // DNS 统计
    pub fn inc_dns_override_hits(&self) {
        self.inner.dns_override_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_cache_hits(&self) {
        self.inner.dns_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_cache_misses(&self) {
        self.inner.dns_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolve_failures(&self) {
        self.inner.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    // 错误统计
    pub fn inc_socks5_errors(&self) {
        self.inner.socks5_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_timeouts(&self) {
        self.inner.connection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn get_nat_entries(&self) -> usize {
        self.inner.nat_entries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            bytes_client_to_remote: self.inner.bytes_client_to_remote.load(Ordering::Relaxed),
            bytes_remote_to_client: self.inner.bytes_remote_to_client.load(Ordering::Relaxed),
            tunnel_requests: self.inner.tunnel_requests.load(Ordering::Relaxed),
            direct_requests: self.inner.direct_requests.load(Ordering::Relaxed),
            udp_associations: self.inner.udp_associations.load(Ordering::Relaxed),
            nat_entries: self.inner.nat_entries.load(Ordering::Relaxed),
            udp_rejected: self.inner.udp_rejected.load(Ordering::Relaxed),
            dns_override_hits: self.inner.dns_override_hits.load(Ordering::Relaxed),
            dns_cache_hits: self.inner.dns_cache_hits.load(Ordering::Relaxed),
            dns_cache_misses: self.inner.dns_cache_misses.load(Ordering::Relaxed),
            resolve_failures: self.inner.resolve_failures.load(Ordering::Relaxed),
            socks5_errors: self.inner.socks5_errors.load(Ordering::Relaxed),
            connection_timeouts: self.inner.connection_timeouts.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 运行指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("总连接数: {}", snapshot.total_connections);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("失败连接: {}", snapshot.failed_connections);
        log::info!("隧道请求: {}", snapshot.tunnel_requests);
        log::info!("直连请求: {}", snapshot.direct_requests);
        log::info!("UDP 关联: {}", snapshot.udp_associations);
        log::info!("NAT 表项: {}", snapshot.nat_entries);
        log::info!("拒绝的 UDP 数据报: {}", snapshot.udp_rejected);
        log::info!("上行流量: {} MB", snapshot.bytes_client_to_remote / 1024 / 1024);
        log::info!("下行流量: {} MB", snapshot.bytes_remote_to_client / 1024 / 1024);
        log::info!("DNS 覆盖命中: {}", snapshot.dns_override_hits);
        log::info!("DNS 缓存命中: {}", snapshot.dns_cache_hits);
        log::info!("DNS 缓存未命中: {}", snapshot.dns_cache_misses);

        if let Some(hit_rate) = snapshot.dns_cache_hit_rate() {
            log::info!("DNS 缓存命中率: {:.2}%", hit_rate);
        }

        log::info!("DNS 解析失败: {}", snapshot.resolve_failures);
        log::info!("SOCKS5 错误: {}", snapshot.socks5_errors);
        log::info!("连接超时: {}", snapshot.connection_timeouts);
    }
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub bytes_client_to_remote: u64,
    pub bytes_remote_to_client: u64,
    pub tunnel_requests: u64,
    pub direct_requests: u64,
    pub udp_associations: u64,
    pub nat_entries: usize,
    pub udp_rejected: u64,
    pub dns_override_hits: u64,
    pub dns_cache_hits: u64,
    pub dns_cache_misses: u64,
    pub resolve_failures: u64,
    pub socks5_errors: u64,
    pub connection_timeouts: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn dns_cache_hit_rate(&self) -> Option<f64> {
        let lookups = self.dns_cache_hits + self.dns_cache_misses;
        if lookups == 0 {
            return None;
        }
        Some(self.dns_cache_hits as f64 / lookups as f64 * 100.0)
    }
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();

        log::debug!(
            "📊 新连接建立 | 总连接数: {} | 活跃连接: {}",
            metrics.get_total_connections(),
            metrics.get_active_connections()
        );

        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
        log::debug!("📊 连接关闭 | 活跃连接: {}", self.metrics.get_active_connections());
    }
}
