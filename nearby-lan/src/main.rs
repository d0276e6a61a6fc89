// nearby-lan: chat-style peer. Lines typed on stdin go to every connected peer;
// received payloads are printed as they arrive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use nearby_core::{NearbySession, SendMode};
use nearby_lan::{config, LanOptions, LanTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    name: Option<String>,
    service: Option<String>,
    connect: Vec<SocketAddr>,
    best_effort: bool,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nearby-lan {}", VERSION);
                return Ok(None);
            }
            "--name" => args.name = Some(it.next().context("--name needs a value")?),
            "--service" => args.service = Some(it.next().context("--service needs a value")?),
            "--connect" => {
                let addr = it.next().context("--connect needs host:port")?;
                args.connect.push(addr.parse().with_context(|| format!("bad address {addr}"))?);
            }
            "--best-effort" => args.best_effort = true,
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(Some(args))
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let mut cfg = config::load()?;
    if let Some(name) = args.name {
        cfg.display_name = name;
    }
    if let Some(service) = args.service {
        cfg.service_type = service;
    }
    init_tracing(&cfg.log_level);

    let options = LanOptions::from_config(&cfg)?;
    let mode = if args.best_effort {
        SendMode::BestEffort
    } else {
        SendMode::Reliable
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (transport, events) = LanTransport::start(options).await?;
        info!(
            name = %cfg.display_name,
            service = %cfg.service_type,
            peer = %transport.local_peer_id(),
            addr = %transport.local_addr(),
            "nearby peer up"
        );
        let session = NearbySession::new(&cfg.display_name, &cfg.service_type, transport)?;
        let session = Arc::new(session);
        tokio::spawn(session.clone().run_events(events));
        session.set_enabled(true)?;

        for addr in &args.connect {
            match session.transport().connect(*addr).await {
                Ok(peer) => info!(%peer, %addr, "linked"),
                Err(e) => warn!(%addr, error = %e, "connect failed"),
            }
        }

        tokio::select! {
            r = chat(session.clone(), mode) => r?,
            r = shutdown_signal() => r?,
        }
        session.close();
        let stats = session.stats();
        info!(
            sent = stats.messages_sent,
            received = stats.messages_received,
            "nearby peer down"
        );
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// Broadcast stdin lines and print received payloads until stdin closes.
async fn chat(session: Arc<NearbySession<LanTransport>>, mode: SendMode) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let mut last_count = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = session.broadcast(line.as_bytes(), mode) {
                    warn!(error = %e, "send failed");
                }
            }
            _ = poll.tick() => {
                let count = session.connected_peer_count();
                if count != last_count {
                    info!(peers = count, "peer count changed");
                    last_count = count;
                }
                while let Ok(msg) = session.dequeue_message() {
                    println!("[{}] {}", msg.from, String::from_utf8_lossy(&msg.payload));
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
