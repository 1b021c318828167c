use log::debug;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::metrics::Metrics;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// 双向转发，每个方向一个任务，任意一个方向结束（关闭、出错或空闲超时）都会拆除整条连接
///
/// `idle_timeout` 是每次读的滑动超时，为 0 时不限制
pub async fn relay<C, R>(client: C, remote: R, idle_timeout: Duration, metrics: Metrics)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream_metrics = metrics.clone();
    let mut client_to_remote = tokio::spawn(async move {
        copy_half(&mut client_read, &mut remote_write, idle_timeout, move |n| {
            upstream_metrics.add_bytes_client_to_remote(n)
        })
        .await
    });

    let downstream_metrics = metrics.clone();
    let mut remote_to_client = tokio::spawn(async move {
        copy_half(&mut remote_read, &mut client_write, idle_timeout, move |n| {
            downstream_metrics.add_bytes_remote_to_client(n)
        })
        .await
    });

    // 先结束的一方决定结果，另一方被中止，两端随之关闭
    let (direction, joined) = tokio::select! {
        joined = &mut client_to_remote => {
            remote_to_client.abort();
            ("客户端 -> 目标", joined)
        }
        joined = &mut remote_to_client => {
            client_to_remote.abort();
            ("目标 -> 客户端", joined)
        }
    };

    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if e.kind() == io::ErrorKind::TimedOut {
                metrics.inc_connection_timeouts();
            }
            debug!("{} 数据传输结束: {}", direction, e);
        }
        Err(e) => debug!("{} 转发任务异常退出: {}", direction, e),
    }
}

/// 单向拷贝，读到 EOF 后关闭写端
pub async fn copy_half<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
    on_bytes: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = read_with_idle(reader, &mut buf, idle_timeout).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }
}

/// 带滑动超时的读，超时返回 `TimedOut`
pub async fn read_with_idle<R>(reader: &mut R, buf: &mut [u8], idle_timeout: Duration) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    if idle_timeout.is_zero() {
        return reader.read(buf).await;
    }
    timeout(idle_timeout, reader.read(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "空闲超时"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, mut app) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let metrics = Metrics::new();

        let task = tokio::spawn(relay(client, remote, Duration::from_secs(5), metrics.clone()));

        app.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        server.write_all(b"resp").await.unwrap();
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"resp");

        // 客户端关闭后整条连接拆除
        drop(app);
        task.await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_client_to_remote, 7);
        assert_eq!(snapshot.bytes_remote_to_client, 4);
    }

    #[tokio::test]
    async fn test_closing_one_side_tears_down_other() {
        let (client, mut app) = duplex(1024);
        let (remote, server) = duplex(1024);

        let task = tokio::spawn(relay(client, remote, Duration::ZERO, Metrics::new()));

        // 目标侧关闭后，客户端读到 EOF
        drop(server);
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), app.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (client, _app) = duplex(1024);
        let (remote, _server) = duplex(1024);
        let metrics = Metrics::new();

        timeout(
            Duration::from_secs(5),
            relay(client, remote, Duration::from_millis(50), metrics.clone()),
        )
        .await
        .unwrap();

        assert_eq!(metrics.snapshot().connection_timeouts, 1);
    }

    #[tokio::test]
    async fn test_zero_disables_deadline() {
        let (mut reader, _writer) = duplex(16);
        let mut buf = [0u8; 4];
        let pending = timeout(
            Duration::from_millis(100),
            read_with_idle(&mut reader, &mut buf, Duration::ZERO),
        )
        .await;
        assert!(pending.is_err());
    }
}
