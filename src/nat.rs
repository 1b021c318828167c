use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::socks5::TargetAddr;
use crate::stack::DatagramConn;

/// 每个会话待发送数据报的队列长度，满了就丢
pub const UDP_QUEUE_LEN: usize = 1024;
/// 最多记住多少个 key 的源端口
pub const SOURCE_PORT_MEMORY: usize = 4096;

/// 一个 (客户端, 目标) 对应的 UDP 会话
///
/// 发往目标的数据报先进入队列，由会话唯一的发送任务按到达顺序发出
pub struct UdpExchange {
    /// 客户端的 UDP 地址，回包发往这里
    pub client: SocketAddr,
    /// 客户端请求的原始目标，回包按它重新封装
    pub target: TargetAddr,
    /// 所属 UDP ASSOCIATE 控制连接关闭或出站连接出错时触发
    pub cancel: CancellationToken,
    queue: mpsc::Sender<Vec<u8>>,
    outbound: OnceCell<Arc<dyn DatagramConn>>,
    /// 是否已计入 NAT 表项指标
    active: AtomicBool,
}

impl UdpExchange {
    /// 放入发送队列
    pub fn enqueue(&self, payload: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.queue.try_send(payload)
    }

    pub fn outbound(&self) -> Option<&Arc<dyn DatagramConn>> {
        self.outbound.get()
    }

    /// 出站连接建立后调用，首次调用返回 true
    pub fn activate(&self, outbound: Arc<dyn DatagramConn>) -> bool {
        let _ = self.outbound.set(outbound);
        !self.active.swap(true, Ordering::SeqCst)
    }

    /// 会话拆除时调用，之前处于活跃状态则返回 true
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

/// UDP NAT 表
///
/// 插入在 DashMap 的 entry 锁内完成，同一 key 的并发首包只有一个会拿到发送队列的接收端，
/// 其余直接复用同一个会话
pub struct NatTable {
    entries: DashMap<String, Arc<UdpExchange>>,
    /// 记住 key 最近使用的本地端口，重建会话时沿用以保持映射稳定
    source_ports: Mutex<LruCache<String, u16>>,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NatTable {
    pub fn new() -> Self {
        Self::with_port_memory(SOURCE_PORT_MEMORY)
    }

    pub fn with_port_memory(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: DashMap::new(),
            source_ports: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// NAT key：客户端地址与目标地址直接拼接
    pub fn key(client: &SocketAddr, target: &TargetAddr) -> String {
        format!("{}{}", client, target)
    }

    pub fn get(&self, key: &str) -> Option<Arc<UdpExchange>> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// 查找或新建会话
    ///
    /// 只有新建时才返回队列接收端，调用方负责启动发送任务
    pub fn get_or_insert<F>(
        &self,
        key: &str,
        client: SocketAddr,
        target: &TargetAddr,
        cancel: F,
    ) -> (Arc<UdpExchange>, Option<mpsc::Receiver<Vec<u8>>>)
    where
        F: FnOnce() -> CancellationToken,
    {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (queue, receiver) = mpsc::channel(UDP_QUEUE_LEN);
                let exchange = Arc::new(UdpExchange {
                    client,
                    target: target.clone(),
                    cancel: cancel(),
                    queue,
                    outbound: OnceCell::new(),
                    active: AtomicBool::new(false),
                });
                entry.insert(exchange.clone());
                (exchange, Some(receiver))
            }
        }
    }

    /// 只有表中仍是同一个会话时才删除
    pub fn remove(&self, key: &str, exchange: &Arc<UdpExchange>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, exchange))
            .is_some()
    }

    /// 已建立出站连接的会话数
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outbound().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remember_source_port(&self, key: &str, port: u16) {
        self.source_ports.lock().put(key.to_string(), port);
    }

    pub fn source_port(&self, key: &str) -> Option<u16> {
        self.source_ports.lock().get(key).copied()
    }
}

/// UDP 关联的登记 key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKey {
    /// 客户端声明了完整的来源地址
    Exact(SocketAddr),
    /// 只知道来源 IP
    Host(IpAddr),
}

impl AssociationKey {
    /// 根据 UDP ASSOCIATE 请求里声明的地址和控制连接的对端地址生成 key
    pub fn from_request(declared: &TargetAddr, peer: SocketAddr) -> Self {
        match declared {
            TargetAddr::Ip(addr) if addr.port() != 0 && !addr.ip().is_unspecified() => {
                AssociationKey::Exact(*addr)
            }
            TargetAddr::Ip(addr) if addr.port() != 0 => {
                AssociationKey::Exact(SocketAddr::new(peer.ip(), addr.port()))
            }
            TargetAddr::Ip(addr) if !addr.ip().is_unspecified() => AssociationKey::Host(addr.ip()),
            _ => AssociationKey::Host(peer.ip()),
        }
    }
}

/// 已登记的 UDP ASSOCIATE 控制连接
///
/// 同一个 key 下可以有多个控制连接（例如同一台主机上的多个应用），
/// 每个控制连接只取消自己的 token
#[derive(Default)]
pub struct Associations {
    entries: DashMap<AssociationKey, Vec<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记并返回 id，注销时用它找到自己的那一项
    pub fn register(&self, key: AssociationKey, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut live = self.entries.entry(key).or_default();
        live.push((id, token));
        debug!("UDP 关联 {:?} 登记, 当前 {} 个控制连接", key, live.len());
        id
    }

    pub fn unregister(&self, key: &AssociationKey, id: u64) {
        if let Some(mut live) = self.entries.get_mut(key) {
            live.retain(|(current, _)| *current != id);
        }
        self.entries.remove_if(key, |_, live| live.is_empty());
    }

    /// 查找数据报来源所属的关联，同一 key 有多个时取最近登记的
    pub fn lookup(&self, source: SocketAddr) -> Option<CancellationToken> {
        let newest = |key: AssociationKey| {
            self.entries
                .get(&key)
                .and_then(|live| live.last().map(|(_, token)| token.clone()))
        };
        newest(AssociationKey::Exact(source)).or_else(|| newest(AssociationKey::Host(source.ip())))
    }

    /// 登记中的控制连接数
    pub fn len(&self) -> usize {
        self.entries.iter().map(|live| live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
