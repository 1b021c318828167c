use log::info;
use std::fmt;
use std::net::Ipv4Addr;

use crate::rules::{PortRange, RuleRepository, WILDCARD};

/// 命中的域名表键的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKey {
    /// 请求中的原始主机名
    Host,
    /// 解析后 IP 的字符串形式
    ResolvedIp,
}

/// 路由判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// 没有规则允许，直连
    NoRule,
    /// 域名表精确命中，且端口在该规则自身范围内
    DomainMatch { key: DomainKey, ports: PortRange },
    /// IPv4 范围表命中
    IpRangeMatch { rule: String, ports: PortRange },
    /// 通配规则参与了判定：`matched` 为被放宽的具体规则，`None` 表示仅靠通配规则
    WildcardWidened {
        matched: Option<String>,
        ports: PortRange,
    },
}

impl RouteDecision {
    /// 是否走隧道
    pub fn should_proxy(&self) -> bool {
        !matches!(self, RouteDecision::NoRule)
    }

    /// 实际生效的端口范围
    pub fn allowed_ports(&self) -> Option<PortRange> {
        match self {
            RouteDecision::NoRule => None,
            RouteDecision::DomainMatch { ports, .. }
            | RouteDecision::IpRangeMatch { ports, .. }
            | RouteDecision::WildcardWidened { ports, .. } => Some(*ports),
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDecision::NoRule => write!(f, "skip"),
            RouteDecision::DomainMatch {
                key: DomainKey::Host,
                ..
            } => write!(f, "DomainName"),
            RouteDecision::DomainMatch {
                key: DomainKey::ResolvedIp,
                ..
            } => write!(f, "ResolvedIP"),
            RouteDecision::IpRangeMatch { rule, .. } => write!(f, "IPv4Range({})", rule),
            RouteDecision::WildcardWidened { matched: Some(rule), .. } => {
                write!(f, "Wildcard({})", rule)
            }
            RouteDecision::WildcardWidened { matched: None, .. } => write!(f, "Wildcard"),
        }
    }
}

/// 通配规则提供的基础端口范围（需要正的有效范围）
fn wildcard_baseline(repo: &RuleRepository) -> Option<PortRange> {
    repo.get_domain_rule(WILDCARD)
}

/// 对一条具体规则应用通配放宽，返回判定
fn grant(
    rule_ports: PortRange,
    baseline: Option<PortRange>,
    port: u16,
    label: &str,
    exact: impl FnOnce(PortRange) -> RouteDecision,
) -> Option<RouteDecision> {
    if rule_ports.contains(port) {
        let ports = baseline.map_or(rule_ports, |base| rule_ports.widen(base));
        return Some(exact(ports));
    }
    let widened = rule_ports.widen(baseline?);
    if widened.contains(port) {
        return Some(RouteDecision::WildcardWidened {
            matched: Some(label.to_string()),
            ports: widened,
        });
    }
    None
}

/// 判定 `(host, resolved_ip, port)` 是否需要走隧道
///
/// 按顺序：原始主机名精确匹配、解析 IP 字符串精确匹配、IPv4 范围表（插入顺序），
/// 最后单独看通配规则。通配规则只会放宽已命中规则的端口范围。
/// 主机名按原样比较，不做大小写归一化。
pub fn decide(repo: &RuleRepository, host: &str, resolved_ip: Ipv4Addr, port: u16) -> RouteDecision {
    let baseline = if repo.has_domain_rules() {
        wildcard_baseline(repo)
    } else {
        None
    };

    if repo.has_domain_rules() {
        if host != WILDCARD {
            if let Some(ports) = repo.get_domain_rule(host) {
                if let Some(decision) = grant(ports, baseline, port, host, |ports| {
                    RouteDecision::DomainMatch {
                        key: DomainKey::Host,
                        ports,
                    }
                }) {
                    return decision;
                }
            }
        }

        let ip_key = resolved_ip.to_string();
        if ip_key != host {
            if let Some(ports) = repo.get_domain_rule(&ip_key) {
                if let Some(decision) = grant(ports, baseline, port, &ip_key, |ports| {
                    RouteDecision::DomainMatch {
                        key: DomainKey::ResolvedIp,
                        ports,
                    }
                }) {
                    return decision;
                }
            }
        }
    }

    if repo.has_ipv4_rules() {
        let hit = repo.find_ipv4_rule(|rule| {
            if !rule.range.contains(resolved_ip) {
                return false;
            }
            let ports = baseline.map_or(rule.ports, |base| rule.ports.widen(base));
            ports.contains(port)
        });
        if let Some(rule) = hit {
            if rule.ports.contains(port) {
                let ports = baseline.map_or(rule.ports, |base| rule.ports.widen(base));
                return RouteDecision::IpRangeMatch {
                    rule: rule.rule,
                    ports,
                };
            }
            let ports = rule.ports.widen(baseline.unwrap_or(rule.ports));
            return RouteDecision::WildcardWidened {
                matched: Some(rule.rule),
                ports,
            };
        }
    }

    match baseline {
        Some(ports) if ports.contains(port) => RouteDecision::WildcardWidened {
            matched: None,
            ports,
        },
        _ => RouteDecision::NoRule,
    }
}

/// 判定并记录日志
pub fn should_proxy(repo: &RuleRepository, host: &str, resolved_ip: Ipv4Addr, port: u16) -> bool {
    let decision = decide(repo, host, resolved_ip, port);
    match decision.allowed_ports() {
        Some(ports) => info!(
            "[Addr: {}, Resolved: {}, Port: {}, AllowedPorts: {}, Rule: {}]",
            host, resolved_ip, port, ports, decision
        ),
        None => info!("[Addr: {}, Resolved: {}, Port: {}, Rule: skip]", host, resolved_ip, port),
    }
    decision.should_proxy()
}
