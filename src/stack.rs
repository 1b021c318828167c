use async_trait::async_trait;
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;

/// 建立连接的超时时间
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 出站字节流（隧道侧或直连侧）
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 已建立的出站 TCP 连接
pub struct Outbound {
    pub stream: Box<dyn AsyncStream>,
    /// 出站连接的本地地址，作为 CONNECT 应答里的 BND.ADDR
    pub local_addr: SocketAddr,
}

impl Outbound {
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream: Box::new(stream),
            local_addr,
        })
    }
}

/// 已连接到单一目标的数据报端点
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramConn for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// 拨号能力：隧道虚拟协议栈与本机网络都实现它
///
/// `bind` 的 IP 为 `0.0.0.0` 时由实现自行选择本地地址；端口为 0 时随机分配
#[async_trait]
pub trait VirtualStack: Send + Sync {
    async fn dial_tcp(&self, bind: SocketAddrV4, target: SocketAddrV4) -> io::Result<Outbound>;

    async fn dial_udp(
        &self,
        bind: Option<SocketAddrV4>,
        target: SocketAddrV4,
    ) -> io::Result<Arc<dyn DatagramConn>>;
}

/// 绑定到内核隧道网卡的协议栈
///
/// 所有 socket 都绑定到隧道地址，Linux 上额外使用 `SO_BINDTODEVICE`
/// 保证流量从隧道网卡发出，不受系统路由表影响
#[derive(Debug, Clone)]
pub struct InterfaceStack {
    local_ip: Ipv4Addr,
    interface: Option<String>,
}

impl InterfaceStack {
    pub fn new(local_ip: Ipv4Addr, interface: Option<String>) -> Self {
        Self { local_ip, interface }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn bind_addr(&self, bind: SocketAddrV4) -> SocketAddrV4 {
        if bind.ip().is_unspecified() {
            SocketAddrV4::new(self.local_ip, bind.port())
        } else {
            bind
        }
    }

    fn new_socket(&self, ty: Type, protocol: Protocol, bind: SocketAddrV4) -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, ty, Some(protocol))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(interface) = &self.interface {
                socket.bind_device(Some(interface.as_bytes()))?;
            }
        }

        socket.bind(&SocketAddr::V4(self.bind_addr(bind)).into())?;
        Ok(socket)
    }
}

#[async_trait]
impl VirtualStack for InterfaceStack {
    async fn dial_tcp(&self, bind: SocketAddrV4, target: SocketAddrV4) -> io::Result<Outbound> {
        let socket = self.new_socket(Type::STREAM, Protocol::TCP, bind)?;
        socket.set_nodelay(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        let stream = timeout(DIAL_TIMEOUT, socket.connect(SocketAddr::V4(target)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "隧道连接超时"))??;

        debug!("隧道 TCP 连接已建立: {} -> {}", stream.local_addr()?, target);
        Outbound::from_tcp(stream)
    }

    async fn dial_udp(
        &self,
        bind: Option<SocketAddrV4>,
        target: SocketAddrV4,
    ) -> io::Result<Arc<dyn DatagramConn>> {
        let bind = bind.unwrap_or_else(|| SocketAddrV4::new(self.local_ip, 0));
        let socket = self.new_socket(Type::DGRAM, Protocol::UDP, bind)?;
        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(SocketAddr::V4(target)).await?;

        debug!("隧道 UDP 端点已建立: {} -> {}", socket.local_addr()?, target);
        Ok(Arc::new(socket))
    }
}

/// 本机网络直连
#[derive(Debug, Clone, Default)]
pub struct HostDialer;

#[async_trait]
impl VirtualStack for HostDialer {
    async fn dial_tcp(&self, bind: SocketAddrV4, target: SocketAddrV4) -> io::Result<Outbound> {
        let connect = async {
            if bind.ip().is_unspecified() && bind.port() == 0 {
                return TcpStream::connect(SocketAddr::V4(target)).await;
            }
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::V4(bind))?;
            socket.connect(SocketAddr::V4(target)).await
        };

        let stream = timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "直连超时"))??;
        stream.set_nodelay(true)?;
        Outbound::from_tcp(stream)
    }

    async fn dial_udp(
        &self,
        bind: Option<SocketAddrV4>,
        target: SocketAddrV4,
    ) -> io::Result<Arc<dyn DatagramConn>> {
        let bind = bind.unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

        // 复用之前的源端口时需要 SO_REUSEADDR
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(bind).into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(SocketAddr::V4(target)).await?;
        Ok(Arc::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_host_dialer_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let mut outbound = HostDialer.dial_tcp(bind, target).await.unwrap();
        assert!(outbound.local_addr.ip().is_loopback());

        outbound.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        outbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_host_dialer_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = match server.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let conn = HostDialer.dial_udp(None, target).await.unwrap();
        conn.send(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), conn.local_addr().unwrap().port());

        server.send_to(b"world", from).await.unwrap();
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_interface_stack_binds_local_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let stack = InterfaceStack::new(Ipv4Addr::LOCALHOST, None);
        let outbound = stack
            .dial_tcp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), target)
            .await
            .unwrap();
        assert_eq!(outbound.local_addr.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
