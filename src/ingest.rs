use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use std::net::Ipv4Addr;

use crate::rules::{Ipv4Range, PortRange, RuleRepository, WILDCARD};

lazy_static! {
    /// 从 URL 中提取纯域名
    static ref DOMAIN_RE: Regex = Regex::new(r"(?:\w+\.)+\w+").expect("域名正则无效");
}

/// 解析端口描述：`443` 或 `1~65535`
pub fn parse_port_spec(spec: &str) -> Option<PortRange> {
    let spec = spec.trim();
    let (min, max) = match spec.split_once('~') {
        Some((min, max)) => (min.trim(), max.trim()),
        None => (spec, spec),
    };
    PortRange::new(min.parse().ok()?, max.parse().ok()?)
}

/// 从任意 URL/路径中提取纯域名，例如
/// `http://domain.example.com/path?a=b` -> `domain.example.com`
pub fn extract_domain(rule: &str) -> Option<&str> {
    DOMAIN_RE.find(rule).map(|m| m.as_str())
}

/// 导入一条资源规则
///
/// * `host` - `a.b.c.d~e.f.g.h` 区间、`a.b.c.d/n` 网段、域名、完整 URL 或 `*`
/// * `port` - `443` 或 `1~65535`
///
/// 无法解析的条目会被跳过，返回是否导入成功
pub fn ingest_rule(repo: &RuleRepository, host: &str, port: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return false;
    }

    let ports = match parse_port_spec(port) {
        Some(ports) => ports,
        None => {
            warn!("无法解析端口范围: {:?} (规则 {})", port, host);
            return false;
        }
    };

    if let Some((from, to)) = host.split_once('~') {
        let range = match (from.trim().parse::<Ipv4Addr>(), to.trim().parse::<Ipv4Addr>()) {
            (Ok(from), Ok(to)) => Ipv4Range::span(from, to),
            _ => None,
        };
        return match range {
            Some(range) => {
                repo.append_ipv4_range_rule(host, range, ports);
                true
            }
            None => {
                warn!("无效的 IPv4 区间规则: {}", host);
                false
            }
        };
    }

    if let Some(range) = Ipv4Range::parse_cidr(host) {
        repo.append_ipv4_range_rule(host, range, ports);
        return true;
    }

    // 完整规则用于带路径的查询
    repo.append_domain_rule(host, ports);

    // SOCKS 拿不到路径，只能再按纯域名添加一次
    if host != WILDCARD {
        if let Some(domain) = extract_domain(host) {
            if domain != host {
                repo.append_domain_rule(domain, ports);
            }
        }
    }

    true
}

/// 导入一组资源：`hosts` 与 `ports` 都以 `;` 分隔，按位置一一对应
pub fn ingest_resource(repo: &RuleRepository, hosts: &str, ports: &str) -> usize {
    if hosts.is_empty() || ports.is_empty() {
        warn!("跳过空资源: {:?} {:?}", hosts, ports);
        return 0;
    }

    let port_specs: Vec<&str> = ports.split(';').collect();
    let mut accepted = 0;

    for (index, host) in hosts.split(';').enumerate() {
        let Some(port) = port_specs.get(index) else {
            warn!("资源 {} 缺少端口描述，跳过", host);
            continue;
        };
        if ingest_rule(repo, host, port) {
            accepted += 1;
        }
    }

    accepted
}

/// 导入 DNS 数据：`;` 分隔的 `id:domain:ip` 三元组
pub fn ingest_dns_data(repo: &RuleRepository, data: &str) -> usize {
    let mut accepted = 0;

    for entry in data.split(';') {
        let fields: Vec<&str> = entry.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        if repo.append_dns_override(fields[1], fields[2]) {
            accepted += 1;
        }
    }

    info!("导入了 {} 条 DNS 覆盖规则", accepted);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_spec() {
        assert_eq!(parse_port_spec("443"), PortRange::single(443));
        assert_eq!(parse_port_spec("1~65535"), Some(PortRange::ALL));
        assert_eq!(parse_port_spec(" 80 ~ 90 "), PortRange::new(80, 90));
        assert_eq!(parse_port_spec("90~80"), None);
        assert_eq!(parse_port_spec("0"), None);
        assert_eq!(parse_port_spec("http"), None);
        assert_eq!(parse_port_spec("70000"), None);
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("http://domain.example.com/path/to&something=good#extra"),
            Some("domain.example.com")
        );
        assert_eq!(extract_domain("example.com"), Some("example.com"));
        assert_eq!(extract_domain("localhost"), None);
    }

    #[test]
    fn test_ingest_url_adds_both_keys() {
        let repo = RuleRepository::new();
        assert!(ingest_rule(&repo, "https://oa.example.edu/portal", "443"));
        assert_eq!(
            repo.get_domain_rule("https://oa.example.edu/portal"),
            PortRange::single(443)
        );
        assert_eq!(repo.get_domain_rule("oa.example.edu"), PortRange::single(443));
        assert_eq!(repo.domain_rule_count(), 2);
    }

    #[test]
    fn test_ingest_wildcard() {
        let repo = RuleRepository::new();
        assert!(ingest_rule(&repo, "*", "80"));
        assert_eq!(repo.get_domain_rule("*"), PortRange::single(80));
        assert_eq!(repo.domain_rule_count(), 1);
    }

    #[test]
    fn test_ingest_ip_span_and_cidr() {
        let repo = RuleRepository::new();
        assert!(ingest_rule(&repo, "1.1.1.7~1.1.7.9", "1~1000"));
        assert!(ingest_rule(&repo, "10.0.0.0/8", "1~65535"));
        assert!(!ingest_rule(&repo, "1.1.7.9~1.1.1.7", "1~1000"));
        assert!(!ingest_rule(&repo, "1.1.1.x~1.1.7.9", "1~1000"));

        let rules = repo.ipv4_rules();
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules[0].range, Ipv4Range::Span { .. }));
        assert!(matches!(rules[1].range, Ipv4Range::Cidr { prefix_len: 8, .. }));
        assert!(!repo.has_domain_rules());
    }

    #[test]
    fn test_ingest_bad_port_skipped() {
        let repo = RuleRepository::new();
        assert!(!ingest_rule(&repo, "example.com", "abc"));
        assert!(!repo.has_domain_rules());
    }

    #[test]
    fn test_ingest_resource_lists() {
        let repo = RuleRepository::new();
        let accepted = ingest_resource(&repo, "a.example.com;10.0.0.0/8;b.example.com", "443;1~65535");
        assert_eq!(accepted, 2);
        assert_eq!(repo.get_domain_rule("a.example.com"), PortRange::single(443));
        assert_eq!(repo.get_domain_rule("b.example.com"), None);
        assert_eq!(repo.ipv4_rule_count(), 1);
    }

    #[test]
    fn test_ingest_dns_data() {
        let repo = RuleRepository::new();
        let accepted = ingest_dns_data(&repo, "1:bank.example:10.0.0.9;2::10.0.0.1;bad;3:mail.example:10.0.0.2;");
        assert_eq!(accepted, 2);
        assert_eq!(repo.get_dns_override("bank.example").as_deref(), Some("10.0.0.9"));
        assert_eq!(repo.get_dns_override("mail.example").as_deref(), Some("10.0.0.2"));
    }
}
