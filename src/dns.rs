use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::{debug, info, warn};
use lru::LruCache;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::ResolveError;
use crate::metrics::Metrics;
use crate::rules::RuleRepository;
use crate::stack::VirtualStack;

/// 单次查询的超时时间
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DNS_CACHE_CAPACITY: usize = 1000;
const DNS_PORT: u16 = 53;
/// 表示“未配置”的 DNS 服务器地址
const UNCONFIGURED_SERVER: &str = "0.0.0.0";

/// DNS 解析器，只解析 IPv4
///
/// 顺序：覆盖表 -> IP 字面量 -> 缓存 -> 自定义服务器（经隧道）-> 本机解析
pub struct Resolver {
    repo: Arc<RuleRepository>,
    stack: Arc<dyn VirtualStack>,
    tunnel_ip: Ipv4Addr,
    cache: Mutex<LruCache<String, Ipv4Addr>>,
    metrics: Metrics,
}

impl Resolver {
    pub fn new(
        repo: Arc<RuleRepository>,
        stack: Arc<dyn VirtualStack>,
        tunnel_ip: Ipv4Addr,
        metrics: Metrics,
    ) -> Self {
        let capacity = NonZeroUsize::new(DNS_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            repo,
            stack,
            tunnel_ip,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics,
        }
    }

    /// 解析域名的 IPv4 地址
    pub async fn resolve(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        let result = self.resolve_inner(domain).await;
        if let Err(e) = &result {
            self.metrics.inc_resolve_failures();
            warn!("DNS 解析 {} 失败: {}", domain, e);
        }
        result
    }

    async fn resolve_inner(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        // 1. 覆盖表，值不是 IP 时按别名继续解析
        let name = match self.repo.get_dns_override(domain) {
            Some(value) => {
                self.metrics.inc_dns_override_hits();
                match value.parse::<Ipv4Addr>() {
                    Ok(ip) => {
                        debug!("DNS 覆盖命中: {} -> {}", domain, ip);
                        return Ok(ip);
                    }
                    Err(_) => {
                        debug!("DNS 覆盖命中: {} -> {}（继续解析）", domain, value);
                        value
                    }
                }
            }
            None => domain.to_string(),
        };

        // 2. IP 字面量
        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        // 3. 缓存
        {
            let mut cache = self.cache.lock().await;
            if let Some(ip) = cache.get(&name) {
                self.metrics.inc_dns_cache_hits();
                debug!("DNS 缓存命中: {} -> {}", name, ip);
                return Ok(*ip);
            }
        }
        self.metrics.inc_dns_cache_misses();

        // 4. 自定义服务器（主、备）
        let ip = match self.query_custom_servers(&name).await {
            Some(ip) => ip,
            None => self.lookup_host(&name).await?,
        };

        {
            let mut cache = self.cache.lock().await;
            cache.put(name.clone(), ip);
        }
        debug!("DNS 解析: {} -> {}", name, ip);
        Ok(ip)
    }

    async fn query_custom_servers(&self, domain: &str) -> Option<Ipv4Addr> {
        for server in self.repo.dns_servers().iter().take(2) {
            if server == UNCONFIGURED_SERVER {
                continue;
            }
            let server_ip = match server.parse::<Ipv4Addr>() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("无效的 DNS 服务器地址: {}", server);
                    continue;
                }
            };

            match self.query_server(server_ip, domain).await {
                Ok(Some(ip)) => return Some(ip),
                Ok(None) => debug!("DNS 服务器 {} 没有返回 {} 的 A 记录", server_ip, domain),
                Err(e) => info!("DNS 服务器 {} 查询 {} 失败: {}", server_ip, domain, e),
            }
        }
        None
    }

    /// 通过隧道向指定服务器查询 A 记录
    async fn query_server(
        &self,
        server: Ipv4Addr,
        domain: &str,
    ) -> Result<Option<Ipv4Addr>, ResolveError> {
        let target = SocketAddrV4::new(server, DNS_PORT);
        let query = async {
            let bind = SocketAddrV4::new(self.tunnel_ip, 0);
            let conn = self.stack.dial_udp(Some(bind), target).await?;

            let id: u16 = rand::random();
            conn.send(&build_query(id, domain)?).await?;

            let mut buf = vec![0u8; 4096];
            loop {
                let n = conn.recv(&mut buf).await?;
                let response = match Message::from_vec(&buf[..n]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("忽略无法解析的 DNS 响应: {}", e);
                        continue;
                    }
                };
                if response.id() != id {
                    debug!("忽略 ID 不匹配的 DNS 响应: {} != {}", response.id(), id);
                    continue;
                }
                return Ok::<_, ResolveError>(first_a_record(&response));
            }
        };

        timeout(DNS_TIMEOUT, query)
            .await
            .map_err(|_| ResolveError::Timeout(target.to_string()))?
    }

    /// 本机默认解析
    async fn lookup_host(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        let addrs = timeout(DNS_TIMEOUT, tokio::net::lookup_host((domain, 0)))
            .await
            .map_err(|_| ResolveError::Timeout("system".to_string()))??;

        addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| ResolveError::NoAddress(domain.to_string()))
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        info!("DNS 缓存已清除");
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// 构造 A 记录查询报文
fn build_query(id: u16, domain: &str) -> Result<Vec<u8>, ResolveError> {
    let name = Name::from_ascii(domain).map_err(|e| ResolveError::Protocol(e.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));

    message.to_vec().map_err(|e| ResolveError::Protocol(e.to_string()))
}

fn first_a_record(response: &Message) -> Option<Ipv4Addr> {
    response.answers().iter().find_map(|answer| match answer.data() {
        RData::A(a) => Some(a.0),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{DatagramConn, HostDialer, Outbound};
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// 把发往 53 端口的查询转到本地的假 DNS 服务器
    ///
    /// `routes` 按服务器地址指定假服务器端口，`unreachable` 中的服务器拨号失败
    struct RedirectStack {
        dns_port: u16,
        routes: HashMap<Ipv4Addr, u16>,
        unreachable: Vec<Ipv4Addr>,
        udp_dials: AtomicUsize,
    }

    impl RedirectStack {
        fn new(dns_port: u16) -> Arc<Self> {
            Self::with_servers(dns_port, &[], &[])
        }

        fn with_servers(dns_port: u16, routes: &[(Ipv4Addr, u16)], unreachable: &[Ipv4Addr]) -> Arc<Self> {
            Arc::new(Self {
                dns_port,
                routes: routes.iter().copied().collect(),
                unreachable: unreachable.to_vec(),
                udp_dials: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VirtualStack for RedirectStack {
        async fn dial_tcp(&self, _bind: SocketAddrV4, _target: SocketAddrV4) -> io::Result<Outbound> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "tcp"))
        }

        async fn dial_udp(
            &self,
            _bind: Option<SocketAddrV4>,
            target: SocketAddrV4,
        ) -> io::Result<Arc<dyn DatagramConn>> {
            self.udp_dials.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.contains(target.ip()) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
            }
            let port = self.routes.get(target.ip()).copied().unwrap_or(self.dns_port);
            HostDialer
                .dial_udp(None, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
                .await
        }
    }

    /// 对所有 A 查询都回答 `answer`，`None` 时回答空的应答
    async fn spawn_fake_dns(answer: Option<Ipv4Addr>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = Message::from_vec(&buf[..n]).unwrap();
                let query = request.queries()[0].clone();

                let mut response = Message::new();
                response
                    .set_id(request.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query);
                if let Some(answer) = answer {
                    response.add_answer(Record::from_rdata(query.name().clone(), 60, RData::A(A(answer))));
                }
                response.add_query(query);
                socket.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
            }
        });

        port
    }

    fn resolver(repo: Arc<RuleRepository>, stack: Arc<RedirectStack>) -> Resolver {
        Resolver::new(repo, stack, Ipv4Addr::new(10, 8, 0, 2), Metrics::new())
    }

    #[tokio::test]
    async fn test_override_skips_network() {
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_override("bank.example", "10.0.0.9");
        repo.append_dns_servers(["10.1.1.1", "10.1.1.2"]);
        let stack = RedirectStack::new(1);

        let resolver = resolver(repo, stack.clone());
        let ip = resolver.resolve("bank.example").await.unwrap();

        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.metrics.snapshot().dns_override_hits, 1);
    }

    #[tokio::test]
    async fn test_literal_ip() {
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["10.1.1.1"]);
        let stack = RedirectStack::new(1);

        let resolver = resolver(repo, stack.clone());
        assert_eq!(resolver.resolve("192.168.1.20").await.unwrap(), Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_custom_server_through_stack_and_cache() {
        let port = spawn_fake_dns(Some(Ipv4Addr::new(10, 9, 8, 7))).await;
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["0.0.0.0", "127.0.0.1"]);
        let stack = RedirectStack::new(port);

        let resolver = resolver(repo, stack.clone());
        assert_eq!(resolver.resolve("intranet.test").await.unwrap(), Ipv4Addr::new(10, 9, 8, 7));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 1);

        // 第二次命中缓存
        assert_eq!(resolver.resolve("intranet.test").await.unwrap(), Ipv4Addr::new(10, 9, 8, 7));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cache_len().await, 1);

        resolver.clear_cache().await;
        assert_eq!(resolver.cache_len().await, 0);
    }

    #[tokio::test]
    async fn test_backup_server_after_primary_dial_failure() {
        let backup = spawn_fake_dns(Some(Ipv4Addr::new(10, 4, 4, 4))).await;
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["10.1.1.1", "10.1.1.2"]);
        let stack = RedirectStack::with_servers(
            1,
            &[(Ipv4Addr::new(10, 1, 1, 2), backup)],
            &[Ipv4Addr::new(10, 1, 1, 1)],
        );

        let resolver = resolver(repo, stack.clone());
        assert_eq!(resolver.resolve("intranet.test").await.unwrap(), Ipv4Addr::new(10, 4, 4, 4));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backup_server_after_empty_answer() {
        let primary = spawn_fake_dns(None).await;
        let backup = spawn_fake_dns(Some(Ipv4Addr::new(10, 5, 5, 5))).await;
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["10.1.1.1", "10.1.1.2"]);
        let stack = RedirectStack::with_servers(
            1,
            &[(Ipv4Addr::new(10, 1, 1, 1), primary), (Ipv4Addr::new(10, 1, 1, 2), backup)],
            &[],
        );

        let resolver = resolver(repo, stack.clone());
        assert_eq!(resolver.resolve("intranet.test").await.unwrap(), Ipv4Addr::new(10, 5, 5, 5));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_both_servers_fail_falls_back_to_host() {
        let empty = spawn_fake_dns(None).await;
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["10.1.1.1", "10.1.1.2"]);
        let stack = RedirectStack::with_servers(
            empty,
            &[],
            &[Ipv4Addr::new(10, 1, 1, 2)],
        );

        let resolver = resolver(repo, stack.clone());
        assert!(resolver.resolve("localhost").await.unwrap().is_loopback());
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_override_alias_is_resolved() {
        let port = spawn_fake_dns(Some(Ipv4Addr::new(10, 1, 2, 3))).await;
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_override("www.example", "cdn.example");
        repo.append_dns_servers(["127.0.0.1"]);
        let stack = RedirectStack::new(port);

        let resolver = resolver(repo, stack.clone());
        assert_eq!(resolver.resolve("www.example").await.unwrap(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_fallback() {
        let repo = Arc::new(RuleRepository::new());
        repo.append_dns_servers(["0.0.0.0", "0.0.0.0"]);
        let stack = RedirectStack::new(1);

        let resolver = resolver(repo, stack.clone());
        let ip = resolver.resolve("localhost").await.unwrap();
        assert!(ip.is_loopback());
        assert_eq!(stack.udp_dials.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_query_encoding() {
        let bytes = build_query(0x1234, "example.com").unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert!(first_a_record(&message).is_none());
    }
}
