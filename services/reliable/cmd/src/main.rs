#[macro_use]
mod logging;
mod config;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::NodeConfig;
use logging::RmLogFormatter;
use rm_session::{ReliableListener, ReliableSession, SessionEvent, SessionStats, TcpChannelFactory};
use rm_wire::{CborEncoder, EndpointAddress, MessageEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rm-node", version, about = "Reliable messaging node over TCP")]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Protocol version ("1.1" or "2005")
    #[arg(long)]
    protocol: Option<String>,

    /// Transfer window size
    #[arg(long)]
    window: Option<usize>,

    /// Deliver out of order
    #[arg(long)]
    unordered: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept sessions and print what they deliver
    Listen {
        /// Bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Send every received payload back on the session
        #[arg(long)]
        echo: bool,
    },
    /// Open a session, send messages, and close it
    Send {
        /// Listener address
        #[arg(long)]
        connect: Option<SocketAddr>,

        /// Payload of every message
        #[arg(long, default_value = "hello")]
        message: String,

        /// Number of messages
        #[arg(long, default_value = "10")]
        count: u64,

        /// Delay between messages
        #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Handshake and close timeout
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

/// Summary printed when `send` finishes
#[derive(Serialize)]
struct SendReport {
    remote: String,
    messages_sent: u64,
    retries: u64,
    acks_received: u64,
    replies: Vec<String>,
    finished_at: chrono::DateTime<chrono::Local>,
}

impl SendReport {
    fn new(remote: SocketAddr, stats: &SessionStats, replies: Vec<String>) -> Self {
        Self {
            remote: remote.to_string(),
            messages_sent: stats.messages_sent,
            retries: stats.retries,
            acks_received: stats.acks_received,
            replies,
            finished_at: chrono::Local::now(),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let env_filter = env_filter
        .add_directive(format!("rm_node={}", args.log_level).parse()?)
        .add_directive(format!("rm_session={}", args.log_level).parse()?)
        .add_directive(format!("rm_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(RmLogFormatter::new("rm-node"))
        .init();

    info!("Starting rm-node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load(args.config.as_deref())?;
    if let Some(protocol) = &args.protocol {
        node_config.version = protocol.clone();
    }
    if let Some(window) = args.window {
        node_config.window = window;
    }
    if args.unordered {
        node_config.ordered = false;
    }

    match args.command {
        Command::Listen { bind, echo } => {
            if let Some(bind) = bind {
                node_config.listen = bind;
            }
            listen(node_config, echo).await
        }
        Command::Send {
            connect,
            message,
            count,
            interval,
            timeout,
        } => {
            if let Some(connect) = connect {
                node_config.connect = connect;
            }
            send(node_config, Bytes::from(message), count, interval, timeout).await
        }
    }
}

async fn listen(node_config: NodeConfig, echo: bool) -> anyhow::Result<()> {
    let listener_config = node_config.listener_config()?;
    let encoder: Arc<dyn MessageEncoder> = Arc::new(CborEncoder::new());
    let tcp = rm_session::listen_tcp(node_config.listen)
        .await
        .with_context(|| format!("failed to bind {}", node_config.listen))?;
    component_info!("listener", "Listening on {} ({})", node_config.listen, listener_config.session.version);

    let listener = ReliableListener::new(listener_config);
    let serving = tokio::spawn(listener.clone().serve_tcp(tcp, encoder));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Some(session) = accepted else { break };
                tokio::spawn(drain_session(session, echo));
            }
            _ = tokio::signal::ctrl_c() => {
                component_info!("listener", "Interrupted, shutting down");
                break;
            }
        }
    }

    listener.close();
    serving.abort();
    Ok(())
}

/// Print everything a server session delivers, then close it
async fn drain_session(session: ReliableSession, echo: bool) {
    let peer = session.remote_address();
    component_info!("session", "Session from {} opened", peer);
    let idle = Duration::from_secs(3600);

    loop {
        match session.receive(idle).await {
            Ok(Some(payload)) => {
                component_info!("session", "{}: {}", peer, String::from_utf8_lossy(&payload));
                if echo {
                    if let Err(e) = session.send(payload, idle).await {
                        component_warn!("session", "Echo to {} failed: {}", peer, e);
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                component_error!("session", "Session from {} failed: {}", peer, e);
                return;
            }
        }
    }

    match session.close(Duration::from_secs(30)).await {
        Ok(()) => component_info!("session", "Session from {} closed: {:?}", peer, session.stats()),
        Err(e) => component_warn!("session", "Session from {} did not close cleanly: {}", peer, e),
    }
}

async fn send(
    node_config: NodeConfig,
    payload: Bytes,
    count: u64,
    interval: Duration,
    timeout: Duration,
) -> anyhow::Result<()> {
    let session_config = node_config.session_config()?;
    let remote = node_config.connect;
    let factory = Arc::new(
        TcpChannelFactory::new(remote, Arc::new(CborEncoder::new()), session_config.max_message_size)
            .with_connect_timeout(timeout),
    );

    let session = ReliableSession::connect(
        factory,
        EndpointAddress::new(format!("rm://{}", remote)),
        session_config,
        timeout,
    )
    .await
    .with_context(|| format!("failed to open a session to {}", remote))?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ConnectionLost => component_warn!("session", "Connection lost, reconnecting"),
                SessionEvent::Reconnected => component_info!("session", "Reconnected"),
                SessionEvent::Faulted(e) => component_error!("session", "Session faulted: {}", e),
                _ => {}
            }
        }
    });

    for i in 1..=count {
        let number = session.send(payload.clone(), timeout).await?;
        component_info!("session", "Sent message {} of {} as #{}", i, count, number);
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    let closing = {
        let session = session.clone();
        tokio::spawn(async move { session.close(timeout).await })
    };

    let mut replies = Vec::new();
    if session.inbound_id().is_some() {
        while let Some(reply) = session.receive(timeout).await? {
            replies.push(String::from_utf8_lossy(&reply).into_owned());
        }
    }
    closing.await??;

    let report = SendReport::new(remote, &session.stats(), replies);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
