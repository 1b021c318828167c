use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

// ============ SOCKS5 常量（RFC 1928） ============
pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// 请求或数据报里的目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// 主机部分（IP 字面量或域名）
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn atyp(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            TargetAddr::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// 与请求地址类型一致的全零地址，用于失败应答
    pub fn unspecified(atyp: u8) -> Self {
        match atyp {
            ATYP_IPV6 => TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
            ATYP_DOMAIN => TargetAddr::Domain(String::new(), 0),
            _ => TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        }
    }

    /// 地址与端口都为零（客户端未声明 UDP 来源）
    pub fn is_unspecified(&self) -> bool {
        match self {
            TargetAddr::Ip(addr) => addr.ip().is_unspecified() && addr.port() == 0,
            TargetAddr::Domain(domain, port) => domain.is_empty() && *port == 0,
        }
    }

    /// ATYP | ADDR | PORT
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp());
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => buf.extend_from_slice(&addr.ip().octets()),
            TargetAddr::Ip(SocketAddr::V6(addr)) => buf.extend_from_slice(&addr.ip().octets()),
            TargetAddr::Domain(domain, _) => {
                // 域名长度最多 255，解析时已经保证
                let bytes = &domain.as_bytes()[..domain.len().min(255)];
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
}

/// 方法协商，只接受无认证
pub async fn negotiate<S>(stream: &mut S) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(RelayError::Protocol(format!("不支持的 SOCKS 版本: {}", version)));
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(RelayError::Protocol("客户端不支持无认证方式".to_string()));
    }

    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// 读取请求：
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// 地址类型不支持时返回 `UnsupportedAddressType`，由调用方应答
pub async fn read_request<S>(stream: &mut S) -> Result<Request, RelayError>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(RelayError::Protocol(format!("请求版本错误: {}", version)));
    }
    let command = stream.read_u8().await?;
    let _rsv = stream.read_u8().await?;
    let atyp = stream.read_u8().await?;

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(name)
                .map_err(|_| RelayError::InvalidAddress("域名不是有效的 UTF-8".to_string()))?;
            TargetAddr::Domain(domain, port)
        }
        other => return Err(RelayError::UnsupportedAddressType(other)),
    };

    Ok(Request { command, target })
}

/// 写应答：VER REP RSV ATYP BND.ADDR BND.PORT
pub async fn write_reply<S>(stream: &mut S, rep: u8, bind: &TargetAddr) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[SOCKS_VERSION, rep, 0x00]);
    bind.write_to(&mut reply);
    stream.write_all(&reply).await
}

/// 解析出的 UDP 数据报
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub frag: u8,
    pub target: TargetAddr,
    pub payload: &'a [u8],
}

/// 解析 SOCKS5 UDP 数据报：
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
pub fn parse_udp_datagram(buf: &[u8]) -> Result<UdpDatagram<'_>, RelayError> {
    let too_short = || RelayError::InvalidAddress(format!("UDP 数据报过短: {} 字节", buf.len()));

    if buf.len() < 4 {
        return Err(too_short());
    }
    let frag = buf[2];
    let atyp = buf[3];

    let (target, header_len) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 10 {
                return Err(too_short());
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 10)
        }
        ATYP_IPV6 => {
            if buf.len() < 22 {
                return Err(too_short());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            (TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 22)
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return Err(too_short());
            }
            let len = buf[4] as usize;
            if buf.len() < 7 + len {
                return Err(too_short());
            }
            let domain = std::str::from_utf8(&buf[5..5 + len])
                .map_err(|_| RelayError::InvalidAddress("域名不是有效的 UTF-8".to_string()))?
                .to_string();
            let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
            (TargetAddr::Domain(domain, port), 7 + len)
        }
        other => return Err(RelayError::UnsupportedAddressType(other)),
    };

    Ok(UdpDatagram {
        frag,
        target,
        payload: &buf[header_len..],
    })
}

/// 封装 SOCKS5 UDP 数据报（FRAG 固定为 0）
pub fn encode_udp_datagram(target: &TargetAddr, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 22);
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    target.write_to(&mut packet);
    packet.extend_from_slice(payload);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
        negotiate(&mut server).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_auth_only_client() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        assert!(negotiate(&mut server).await.is_err());
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_read_domain_request() {
        let (mut client, mut server) = duplex(128);
        let mut packet = vec![0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN, 11];
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&packet).await.unwrap();

        let request = read_request(&mut server).await.unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.target, TargetAddr::Domain("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn test_read_request_unknown_atyp() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, CMD_CONNECT, 0x00, 0x09]).await.unwrap();
        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedAddressType(0x09)));
    }

    #[tokio::test]
    async fn test_failure_reply_matches_request_type() {
        let (mut client, mut server) = duplex(64);
        write_reply(&mut server, REP_HOST_UNREACHABLE, &TargetAddr::unspecified(ATYP_DOMAIN))
            .await
            .unwrap();
        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x04, 0x00, ATYP_DOMAIN, 0x00, 0x00, 0x00]);

        write_reply(&mut server, REP_HOST_UNREACHABLE, &TargetAddr::unspecified(ATYP_IPV6))
            .await
            .unwrap();
        let mut reply = [0u8; 22];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[3], ATYP_IPV6);
        assert!(reply[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_udp_datagram_ipv4() {
        let target = TargetAddr::Ip("10.0.0.53:53".parse().unwrap());
        let packet = encode_udp_datagram(&target, b"query");
        assert_eq!(&packet[..4], &[0x00, 0x00, 0x00, ATYP_IPV4]);

        let datagram = parse_udp_datagram(&packet).unwrap();
        assert_eq!(datagram.frag, 0);
        assert_eq!(datagram.target, target);
        assert_eq!(datagram.payload, b"query");
    }

    #[test]
    fn test_udp_datagram_domain_and_truncation() {
        let mut packet = vec![0x00, 0x00, 0x01, ATYP_DOMAIN, 3];
        packet.extend_from_slice(b"a.b");
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(b"x");
        let datagram = parse_udp_datagram(&packet).unwrap();
        assert_eq!(datagram.frag, 1);
        assert_eq!(datagram.target, TargetAddr::Domain("a.b".to_string(), 53));
        assert_eq!(datagram.payload, b"x");

        assert!(parse_udp_datagram(&packet[..6]).is_err());
        assert!(parse_udp_datagram(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_unspecified_detection() {
        assert!(TargetAddr::unspecified(ATYP_IPV4).is_unspecified());
        assert!(!TargetAddr::Ip("127.0.0.1:5000".parse().unwrap()).is_unspecified());
    }
}
