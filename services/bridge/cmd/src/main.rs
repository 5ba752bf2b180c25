//! reDB bridge binary.
//!
//! `serve` runs a pub/sub server on a local pipe; `connect` runs a
//! reconnecting proxy against it.

use anyhow::Context;
use bridge_hub::{handler_fn, MessageHub};
use bridge_proxy::{
    ConnectedToServerEvent, ConnectionState, CorrelationError, DisconnectedFromServerEvent,
    PubSubServer, RemoteClientConnectedEvent, RemotePubSubProxy, ServerConfig,
};
use bridge_session::{LocalConnector, LocalListener};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod messages;

use config::BridgeConfig;
use logging::BridgeLogFormatter;
use messages::{EchoReply, EchoRequest, Heartbeat};

/// Remote pub/sub bridge over a local pipe
#[derive(Parser, Debug)]
#[command(name = "redb-bridge", version, about = "Remote pub/sub bridge over a local pipe")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Pipe name, overrides the configuration
    #[arg(long, global = true)]
    pipe_name: Option<String>,

    /// Machine hosting the pipe, overrides the configuration
    #[arg(long, global = true)]
    pipe_server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a hub on the pipe
    Serve(ServeArgs),
    /// Connect a proxy to a serving bridge
    Connect(ConnectArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Heartbeat interval, e.g. 5s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,
}

#[derive(ClapArgs, Debug)]
struct ConnectArgs {
    /// Bound on a single connect attempt, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Delay between reconnect attempts, e.g. 5s; 0s disables reconnection
    #[arg(long)]
    reconnect_period: Option<humantime::Duration>,

    /// Interval between echo requests, e.g. 10s
    #[arg(long)]
    echo_interval: Option<humantime::Duration>,
}

impl Args {
    /// Command-line values take precedence over file and environment
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(name) = &self.pipe_name {
            config.pipe_name = name.clone();
        }
        if let Some(server) = &self.pipe_server {
            config.pipe_server = server.clone();
        }
        match &self.command {
            Command::Serve(serve) => {
                if let Some(interval) = serve.heartbeat_interval {
                    config.heartbeat_interval = interval.into();
                }
            }
            Command::Connect(connect) => {
                if let Some(timeout) = connect.connect_timeout {
                    config.connect_timeout = timeout.into();
                }
                if let Some(period) = connect.reconnect_period {
                    config.reconnect_period = period.into();
                }
                if let Some(interval) = connect.echo_interval {
                    config.echo_interval = interval.into();
                }
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in ["redb_bridge", "bridge_wire", "bridge_session", "bridge_hub", "bridge_proxy"] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(BridgeLogFormatter::new("bridge"))
        .init();

    info!("Starting reDB Bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    match args.command {
        Command::Serve(_) => serve(&config, shutdown).await,
        Command::Connect(_) => connect(&config, shutdown).await,
    }
}

async fn serve(config: &BridgeConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    anyhow::ensure!(
        !config.heartbeat_interval.is_zero(),
        "heartbeat_interval must be positive"
    );

    let hub = Arc::new(MessageHub::new());
    let server = PubSubServer::new(
        hub.clone(),
        ServerConfig {
            session: config.session_config(),
        },
    );
    server
        .register::<Heartbeat>()
        .register::<EchoRequest>()
        .register::<EchoReply>();

    let echo_hub = hub.clone();
    hub.subscribe(handler_fn(move |request: Arc<EchoRequest>| {
        let hub = echo_hub.clone();
        async move {
            component_debug!("echo", "Answering echo request {}", request.id);
            let _ = hub.publish(EchoReply::answer(&request)).await;
            Ok(())
        }
    }));
    hub.subscribe(handler_fn(|event: Arc<RemoteClientConnectedEvent>| async move {
        component_info!("server", "{} client(s) connected", event.total_clients_count);
        Ok(())
    }));

    let address = config.address();
    let listener = LocalListener::bind(address.clone())
        .with_context(|| format!("failed to bind pipe '{}'", address))?;

    let heartbeat = tokio::spawn(heartbeat_loop(
        hub.clone(),
        config.heartbeat_interval,
        shutdown.clone(),
    ));

    server
        .run(listener, shutdown.clone())
        .await
        .context("bridge server failed")?;

    shutdown.cancel();
    heartbeat.await.context("heartbeat task failed")?;
    info!("reDB Bridge stopped");
    Ok(())
}

async fn heartbeat_loop(hub: Arc<MessageHub>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sequence += 1;
        let beat = Heartbeat {
            sequence,
            sent_at: Utc::now(),
        };
        if let Err(e) = hub.publish(beat).await {
            component_warn!("heartbeat", "Heartbeat {} not fully delivered: {}", sequence, e);
        }
    }
}

async fn connect(config: &BridgeConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    anyhow::ensure!(!config.echo_interval.is_zero(), "echo_interval must be positive");

    let proxy = RemotePubSubProxy::with_session_config(
        Arc::new(MessageHub::new()),
        Arc::new(LocalConnector::new()),
        config.session_config(),
    );

    // Lifecycle events are published on the local hub only
    proxy
        .hub()
        .subscribe(handler_fn(|_: Arc<ConnectedToServerEvent>| async move {
            component_info!("proxy", "Bridge is up");
            Ok(())
        }));
    proxy
        .hub()
        .subscribe(handler_fn(|event: Arc<DisconnectedFromServerEvent>| async move {
            if event.lost_connection {
                component_warn!("proxy", "Bridge is down, waiting for the server");
            } else {
                component_info!("proxy", "Bridge closed");
            }
            Ok(())
        }));

    proxy.subscribe(handler_fn(|beat: Arc<Heartbeat>| async move {
        component_info!("proxy", "Heartbeat {} sent at {}", beat.sequence, beat.sent_at);
        Ok(())
    }))?;
    proxy.subscribe(handler_fn(|event: Arc<RemoteClientConnectedEvent>| async move {
        component_info!("proxy", "{} client(s) on the server", event.total_clients_count);
        Ok(())
    }))?;

    if !proxy.connect(config.address(), config.connect_options()).await? {
        info!("Server not reachable yet, reconnecting in the background");
    }

    let mut ticker = tokio::time::interval(config.echo_interval);
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if proxy.state() != ConnectionState::Connected {
            continue;
        }

        next_id += 1;
        let request = EchoRequest {
            id: next_id,
            text: format!("echo #{}", next_id),
        };
        let result: Result<EchoReply, CorrelationError> =
            proxy.process_remote(request, config.echo_interval, &shutdown).await;
        match result {
            Ok(reply) => component_info!(
                "echo",
                "Echo {} answered: '{}' at {}",
                reply.id,
                reply.text,
                reply.served_at
            ),
            Err(CorrelationError::Cancelled) => break,
            Err(e) => component_warn!("echo", "Echo {} failed: {}", next_id, e),
        }
    }

    proxy.disconnect().await?;
    info!("reDB Bridge stopped");
    Ok(())
}
