use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::socks5::{
    REP_ADDR_TYPE_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
    REP_HOST_UNREACHABLE, REP_NOT_ALLOWED,
};

/// DNS 解析错误
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 所有途径都没有得到 IPv4 地址
    #[error("无法解析 {0} 的 IPv4 地址")]
    NoAddress(String),
    /// 单次查询超时
    #[error("DNS 服务器 {0} 查询超时")]
    Timeout(String),
    /// 报文构造或解析失败
    #[error("DNS 报文错误: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 单个 SOCKS5 请求范围内的错误，最终都会转换成 SOCKS5 应答码
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("SOCKS5 协议错误: {0}")]
    Protocol(String),
    #[error("无效的地址: {0}")]
    InvalidAddress(String),
    #[error("不支持的地址类型: {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("不支持的命令: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("DNS 解析失败: {0}")]
    Resolve(#[from] ResolveError),
    #[error("连接 {target} 失败: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("UDP 来源 {0} 没有关联的 TCP 控制连接")]
    UdpNotAssociated(SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// 对应的 SOCKS5 应答码（RFC 1928）
    pub fn reply_code(&self) -> u8 {
        match self {
            RelayError::Protocol(_) | RelayError::InvalidAddress(_) | RelayError::Io(_) => {
                REP_GENERAL_FAILURE
            }
            RelayError::UnsupportedAddressType(_) => REP_ADDR_TYPE_NOT_SUPPORTED,
            RelayError::UnsupportedCommand(_) => REP_COMMAND_NOT_SUPPORTED,
            RelayError::Resolve(_) | RelayError::Dial { .. } => REP_HOST_UNREACHABLE,
            RelayError::UdpNotAssociated(_) => REP_NOT_ALLOWED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_codes() {
        let dial = RelayError::Dial {
            target: "10.0.0.1:443".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(dial.reply_code(), 0x04);
        assert_eq!(
            RelayError::Resolve(ResolveError::NoAddress("a.example".into())).reply_code(),
            0x04
        );
        assert_eq!(RelayError::UnsupportedCommand(0x02).reply_code(), 0x07);
        assert_eq!(RelayError::UnsupportedAddressType(0x05).reply_code(), 0x08);
        assert_eq!(RelayError::InvalidAddress("x".into()).reply_code(), 0x01);
        assert_eq!(
            RelayError::UdpNotAssociated("127.0.0.1:5000".parse().unwrap()).reply_code(),
            0x02
        );
    }

    #[test]
    fn test_error_messages() {
        let err = RelayError::UnsupportedCommand(0x02);
        assert_eq!(err.to_string(), "不支持的命令: 0x02");
    }
}
