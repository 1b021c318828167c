//! 隧道分流核心：规则仓库、分流决策、DNS 解析和本地 SOCKS5 服务
//!
//! 命中规则的流量经隧道网卡转发，其余直连

pub mod config;
pub mod decision;
pub mod dns;
pub mod error;
pub mod ingest;
pub mod logger;
pub mod metrics;
pub mod nat;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod socks5;
pub mod stack;
pub mod udp;

pub use config::Config;
pub use decision::{decide, should_proxy, RouteDecision};
pub use dns::Resolver;
pub use error::{RelayError, ResolveError};
pub use metrics::Metrics;
pub use rules::{Ipv4Range, PortRange, RuleRepository};
pub use server::{ServerSettings, Socks5Server};
pub use stack::{HostDialer, InterfaceStack, VirtualStack};
