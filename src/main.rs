mod cache;
mod config;
mod engine;
mod error;
mod key;
mod plugin;
mod proto_utils;
mod ttl;
mod upstream;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::{Engine, Transport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching DNS forwarder with stale fallback", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/proxy.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .settings
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;

    let config = Arc::new(ArcSwap::from_pointee(cfg));
    let engine = Engine::new(config.clone(), cache::global());

    watcher::spawn(args.config.clone(), config.clone());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns server started");

    let mut handles = Vec::with_capacity(udp_workers + 1);
    for worker_id in 0..udp_workers {
        let engine = engine.clone();
        let std_socket = create_udp_socket(bind_udp)
            .with_context(|| format!("create udp socket for worker {}", worker_id))?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        handles.push(tokio::spawn(async move {
            if let Err(err) = run_udp_worker(socket, engine).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        }));
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    }));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(metrics = %engine.metrics_snapshot(), "shutting down");
    for h in handles {
        h.abort();
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// 每个 worker 独立 socket；Unix 上开启 SO_REUSEPORT 由内核分发
fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(socket: Arc<UdpSocket>, engine: Engine) -> anyhow::Result<()> {
    let mut buf = BytesMut::zeroed(4096);
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                debug!(error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle_packet(&packet, peer, Transport::Udp).await {
                Ok(resp) => {
                    let _ = socket.send_to(&resp, peer).await;
                }
                Err(err) => {
                    debug!(client_ip = %peer.ip(), error = %err, "dropping query");
                }
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, engine).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let resp = match engine.handle_packet(&buf, peer, Transport::Tcp).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        let Ok(len) = u16::try_from(resp.len()) else {
            return Ok(());
        };
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}
