use log::{debug, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

use crate::error::RelayError;
use crate::nat::{NatTable, UdpExchange};
use crate::server::RelayContext;
use crate::socks5::{encode_udp_datagram, parse_udp_datagram, TargetAddr};
use crate::stack::DatagramConn;

const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// 服务端 UDP socket 的接收循环
pub async fn serve_udp(ctx: Arc<RelayContext>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let (n, source) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    debug!("UDP 接收失败: {}", e);
                    continue;
                }
            },
        };

        match handle_datagram(&ctx, &socket, source, &buf[..n]) {
            Ok(()) => {}
            Err(e @ RelayError::UdpNotAssociated(_)) => warn!("拒绝 UDP 数据报: {}", e),
            Err(e) => debug!("丢弃来自 {} 的 UDP 数据报: {}", source, e),
        }
    }
    debug!("UDP 接收循环退出");
}

/// 处理一个客户端数据报
///
/// 数据报放进会话的发送队列，新会话的建立在会话自己的任务里完成，
/// 不阻塞接收循环，也不打乱同一目标的发送顺序
fn handle_datagram(
    ctx: &Arc<RelayContext>,
    socket: &Arc<UdpSocket>,
    source: SocketAddr,
    packet: &[u8],
) -> Result<(), RelayError> {
    let datagram = parse_udp_datagram(packet)?;
    if datagram.frag != 0 {
        debug!("不支持分片的 UDP 数据报 (FRAG={})，丢弃", datagram.frag);
        return Ok(());
    }
    if matches!(datagram.target, TargetAddr::Ip(SocketAddr::V6(_))) {
        debug!("不转发 IPv6 目标 {}", datagram.target);
        return Ok(());
    }

    let association = match ctx.associations.lookup(source) {
        Some(token) => token,
        None if ctx.settings.limit_udp => {
            ctx.metrics.inc_udp_rejected();
            return Err(RelayError::UdpNotAssociated(source));
        }
        None => ctx.shutdown.child_token(),
    };

    let key = NatTable::key(&source, &datagram.target);
    // 命中正在拆除的会话时换一个新会话再试一次
    for _ in 0..2 {
        let (exchange, queue) =
            ctx.nat
                .get_or_insert(&key, source, &datagram.target, || association.child_token());
        if let Some(queue) = queue {
            tokio::spawn(run_exchange(
                ctx.clone(),
                socket.clone(),
                key.clone(),
                exchange.clone(),
                queue,
            ));
        }

        match exchange.enqueue(datagram.payload.to_vec()) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("UDP 会话 {} -> {} 队列已满，丢弃数据报", source, datagram.target);
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => retire(ctx, &key, &exchange),
        }
    }
    Ok(())
}

/// 会话的发送任务：建立出站连接，启动回包循环，然后按顺序发送队列里的数据报
async fn run_exchange(
    ctx: Arc<RelayContext>,
    socket: Arc<UdpSocket>,
    key: String,
    exchange: Arc<UdpExchange>,
    mut queue: mpsc::Receiver<Vec<u8>>,
) {
    let outbound = tokio::select! {
        _ = exchange.cancel.cancelled() => {
            retire(&ctx, &key, &exchange);
            return;
        }
        opened = open_outbound(&ctx, &key, &exchange) => match opened {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("UDP {} -> {} 转发失败: {}", exchange.client, exchange.target, e);
                retire(&ctx, &key, &exchange);
                return;
            }
        },
    };

    if exchange.activate(outbound.clone()) {
        ctx.metrics.inc_nat_entries();
    }
    // 建连期间可能已被拆除
    if exchange.cancel.is_cancelled() {
        retire(&ctx, &key, &exchange);
        return;
    }
    info!("新建 UDP 会话: {} -> {}", exchange.client, exchange.target);
    tokio::spawn(reply_loop(
        ctx.clone(),
        socket,
        key.clone(),
        exchange.clone(),
        outbound.clone(),
    ));

    loop {
        let payload = tokio::select! {
            _ = exchange.cancel.cancelled() => break,
            payload = queue.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        if let Err(e) = outbound.send(&payload).await {
            debug!("UDP {} -> {} 发送失败: {}", exchange.client, exchange.target, e);
            retire(&ctx, &key, &exchange);
            break;
        }
        ctx.metrics.add_bytes_client_to_remote(payload.len() as u64);
    }
}

async fn open_outbound(
    ctx: &RelayContext,
    key: &str,
    exchange: &UdpExchange,
) -> Result<Arc<dyn DatagramConn>, RelayError> {
    let route = ctx.route(&exchange.target).await?;

    let bind_ip = if route.via_tunnel {
        ctx.tunnel_ip
    } else {
        Ipv4Addr::UNSPECIFIED
    };
    let stack = ctx.stack_for(&route);

    // 优先沿用上次的本地端口，被占用时退回随机端口
    let outbound = match ctx.nat.source_port(key) {
        Some(port) => match stack.dial_udp(Some(SocketAddrV4::new(bind_ip, port)), route.addr).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                debug!("沿用源端口 {} 失败: {}", port, e);
                stack.dial_udp(Some(SocketAddrV4::new(bind_ip, 0)), route.addr).await
            }
        },
        None => stack.dial_udp(Some(SocketAddrV4::new(bind_ip, 0)), route.addr).await,
    }
    .map_err(|e| RelayError::Dial {
        target: route.addr.to_string(),
        source: e,
    })?;

    if let Ok(local) = outbound.local_addr() {
        ctx.nat.remember_source_port(key, local.port());
    }
    Ok(outbound)
}

/// 把目标的回包重新封装后发回客户端
///
/// 控制连接关闭、读出错或空闲超时都会结束循环并删除会话
async fn reply_loop(
    ctx: Arc<RelayContext>,
    socket: Arc<UdpSocket>,
    key: String,
    exchange: Arc<UdpExchange>,
    outbound: Arc<dyn DatagramConn>,
) {
    let idle_timeout = ctx.settings.udp_timeout;
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = exchange.cancel.cancelled() => {
                debug!("UDP 会话 {} -> {} 已取消", exchange.client, exchange.target);
                break;
            }
            result = recv_with_idle(outbound.as_ref(), &mut buf, idle_timeout) => match result {
                Ok(n) => n,
                Err(e) => {
                    if e.kind() == io::ErrorKind::TimedOut {
                        ctx.metrics.inc_connection_timeouts();
                    }
                    debug!("UDP 会话 {} -> {} 结束: {}", exchange.client, exchange.target, e);
                    break;
                }
            },
        };

        let packet = encode_udp_datagram(&exchange.target, &buf[..n]);
        if let Err(e) = socket.send_to(&packet, exchange.client).await {
            debug!("回包发往 {} 失败: {}", exchange.client, e);
            break;
        }
        ctx.metrics.add_bytes_remote_to_client(n as u64);
    }

    retire(&ctx, &key, &exchange);
}

/// 取消会话并从 NAT 表删除，可重复调用
fn retire(ctx: &RelayContext, key: &str, exchange: &Arc<UdpExchange>) {
    exchange.cancel.cancel();
    ctx.nat.remove(key, exchange);
    if exchange.deactivate() {
        ctx.metrics.dec_nat_entries();
    }
}

async fn recv_with_idle(
    outbound: &dyn DatagramConn,
    buf: &mut [u8],
    idle_timeout: Duration,
) -> io::Result<usize> {
    if idle_timeout.is_zero() {
        return outbound.recv(buf).await;
    }
    timeout(idle_timeout, outbound.recv(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "UDP 空闲超时"))?
}
