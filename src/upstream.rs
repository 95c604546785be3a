use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

const MAX_UDP_RESPONSE: usize = 4096;

/// 转发到上游：先 UDP，截断时改用 TCP 重试 / UDP first, retry over TCP when truncated.
pub async fn forward(packet: &[u8], upstream: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    let start = std::time::Instant::now();
    let res = match forward_udp(packet, upstream, timeout_dur).await {
        Ok(resp) if is_truncated(&resp) => {
            debug!(event = "udp_truncated_fallback_tcp", upstream = %upstream, "retrying over tcp");
            forward_tcp(packet, upstream, timeout_dur).await
        }
        other => other,
    };
    match &res {
        Ok(_) => {
            debug!(upstream = %upstream, upstream_ns = start.elapsed().as_nanos() as u64, "upstream call latency");
        }
        Err(e) => {
            warn!(upstream = %upstream, error = %e, elapsed_ns = start.elapsed().as_nanos() as u64, "upstream call failed");
        }
    }
    res
}

#[inline]
fn is_truncated(packet: &[u8]) -> bool {
    packet.len() >= 3 && packet[2] & 0x02 != 0
}

pub async fn forward_udp(packet: &[u8], upstream: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    if packet.len() < 2 {
        anyhow::bail!("packet too short");
    }

    // Fresh socket per request; the kernel picks the source port
    let domain = if upstream.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let local: SocketAddr = if upstream.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let sock = UdpSocket::from_std(socket.into()).context("from_std")?;

    sock.connect(upstream).await.context("connect upstream")?;
    sock.send(packet).await.context("send upstream")?;

    let mut buf = [0u8; MAX_UDP_RESPONSE];
    let recv_res = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            // drop anything not carrying our transaction id
            if size >= 12 && buf[..2] == packet[..2] {
                return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
            }
        }
    })
    .await;

    match recv_res {
        Ok(res) => res,
        Err(_) => anyhow::bail!("udp timeout"),
    }
}

pub async fn forward_tcp(packet: &[u8], upstream: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    let len = u16::try_from(packet.len()).context("query too large for tcp framing")?;

    let exchange = async {
        let mut stream = TcpStream::connect(upstream).await.context("connect upstream")?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(packet).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;
        Ok::<_, anyhow::Error>(Bytes::from(buf))
    };

    match timeout(timeout_dur, exchange).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("tcp timeout"),
    }
}
