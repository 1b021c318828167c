use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// 通配规则的键，匹配任意目标
pub const WILDCARD: &str = "*";

/// 允许的端口范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// 全部端口
    pub const ALL: PortRange = PortRange { min: 1, max: 65535 };

    /// 创建端口范围，要求 `1 <= min <= max`
    pub fn new(min: u16, max: u16) -> Option<Self> {
        if min == 0 || min > max {
            return None;
        }
        Some(Self { min, max })
    }

    /// 单个端口
    pub fn single(port: u16) -> Option<Self> {
        Self::new(port, port)
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    /// 取两个范围的并集外包（min 取小，max 取大）
    pub fn widen(&self, other: PortRange) -> PortRange {
        PortRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// IPv4 地址范围：CIDR 网段或者显式的 `[from, to]` 区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Range {
    Cidr {
        network: u32,
        mask: u32,
        prefix_len: u8,
    },
    Span {
        from: Ipv4Addr,
        to: Ipv4Addr,
    },
}

impl Ipv4Range {
    /// 从网络地址和前缀长度构造 CIDR 网段
    pub fn cidr(ip: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };
        Some(Ipv4Range::Cidr {
            network: u32::from(ip) & mask,
            mask,
            prefix_len,
        })
    }

    /// 解析 `a.b.c.d/n` 格式
    pub fn parse_cidr(cidr: &str) -> Option<Self> {
        let (ip_str, prefix_str) = cidr.split_once('/')?;
        let ip = ip_str.trim().parse::<Ipv4Addr>().ok()?;
        let prefix_len = prefix_str.trim().parse::<u8>().ok()?;
        Self::cidr(ip, prefix_len)
    }

    /// 显式区间，要求按大端字节序 `from <= to`
    pub fn span(from: Ipv4Addr, to: Ipv4Addr) -> Option<Self> {
        if u32::from(from) > u32::from(to) {
            return None;
        }
        Some(Ipv4Range::Span { from, to })
    }

    /// 是否包含给定地址（闭区间）
    #[inline]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip_u32 = u32::from(ip);
        match *self {
            Ipv4Range::Cidr { network, mask, .. } => ip_u32 & mask == network,
            Ipv4Range::Span { from, to } => ip_u32 >= u32::from(from) && ip_u32 <= u32::from(to),
        }
    }
}

impl fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv4Range::Cidr {
                network,
                prefix_len,
                ..
            } => write!(f, "{}/{}", Ipv4Addr::from(*network), prefix_len),
            Ipv4Range::Span { from, to } => write!(f, "{}~{}", from, to),
        }
    }
}

/// IPv4 范围规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4RangeRule {
    /// 原始规则文本，仅用于日志
    pub rule: String,
    pub range: Ipv4Range,
    pub ports: PortRange,
}

/// 规则仓库
///
/// 三张互相独立的表（域名规则、IPv4 范围规则、DNS 覆盖）加上自定义 DNS 服务器列表。
/// 表在第一次写入前是 `None`，查询直接返回"未找到"，不做任何分配。
/// 读多写少，允许在有并发查询的同时追加规则。
#[derive(Debug, Default)]
pub struct RuleRepository {
    domain_rules: RwLock<Option<HashMap<String, PortRange>>>,
    ipv4_rules: RwLock<Option<Vec<Ipv4RangeRule>>>,
    dns_overrides: RwLock<Option<HashMap<String, String>>>,
    dns_servers: RwLock<Vec<String>>,
}

impl RuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // ============ 域名规则 ============

    /// 追加域名规则，键可以是域名、完整 URL、IP 字面量或 `*`
    pub fn append_domain_rule(&self, key: &str, ports: PortRange) {
        debug!("添加域名规则: {} {}", key, ports);
        self.domain_rules
            .write()
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), ports);
    }

    pub fn get_domain_rule(&self, key: &str) -> Option<PortRange> {
        self.domain_rules.read().as_ref()?.get(key).copied()
    }

    pub fn domain_rule_count(&self) -> usize {
        self.domain_rules.read().as_ref().map_or(0, HashMap::len)
    }

    pub fn has_domain_rules(&self) -> bool {
        self.domain_rules.read().is_some()
    }

    // ============ IPv4 范围规则 ============

    pub fn append_ipv4_range_rule(&self, rule: &str, range: Ipv4Range, ports: PortRange) {
        debug!("添加 IPv4 规则: {} ({}) {}", rule, range, ports);
        self.ipv4_rules
            .write()
            .get_or_insert_with(Vec::new)
            .push(Ipv4RangeRule {
                rule: rule.to_string(),
                range,
                ports,
            });
    }

    /// 按插入顺序返回全部 IPv4 规则的快照
    pub fn ipv4_rules(&self) -> Vec<Ipv4RangeRule> {
        self.ipv4_rules.read().clone().unwrap_or_default()
    }

    /// 按插入顺序返回第一条满足条件的规则，只克隆命中的那一条
    pub fn find_ipv4_rule<F>(&self, mut pred: F) -> Option<Ipv4RangeRule>
    where
        F: FnMut(&Ipv4RangeRule) -> bool,
    {
        self.ipv4_rules
            .read()
            .as_ref()?
            .iter()
            .find(|rule| pred(rule))
            .cloned()
    }

    pub fn ipv4_rule_count(&self) -> usize {
        self.ipv4_rules.read().as_ref().map_or(0, Vec::len)
    }

    pub fn has_ipv4_rules(&self) -> bool {
        self.ipv4_rules.read().is_some()
    }

    // ============ DNS 覆盖 ============

    /// 追加 DNS 覆盖，同一域名后写覆盖先写；空域名或空地址被忽略
    pub fn append_dns_override(&self, domain: &str, ip: &str) -> bool {
        if domain.is_empty() || ip.is_empty() {
            warn!("忽略无效的 DNS 覆盖: {:?} -> {:?}", domain, ip);
            return false;
        }
        debug!("添加 DNS 覆盖: {} -> {}", domain, ip);
        self.dns_overrides
            .write()
            .get_or_insert_with(HashMap::new)
            .insert(domain.to_string(), ip.to_string());
        true
    }

    pub fn get_dns_override(&self, domain: &str) -> Option<String> {
        self.dns_overrides.read().as_ref()?.get(domain).cloned()
    }

    pub fn dns_override_count(&self) -> usize {
        self.dns_overrides.read().as_ref().map_or(0, HashMap::len)
    }

    pub fn has_dns_overrides(&self) -> bool {
        self.dns_overrides.read().is_some()
    }

    // ============ 自定义 DNS 服务器 ============

    pub fn append_dns_servers<I, S>(&self, servers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns_servers
            .write()
            .extend(servers.into_iter().map(Into::into));
    }

    /// 有序的服务器列表（主、备）
    pub fn dns_servers(&self) -> Vec<String> {
        self.dns_servers.read().clone()
    }
}
