//! GhostLink CLI
//!
//! Relay server, endpoint probing and connection diagnostics.

mod config;

use clap::{Parser, Subcommand};
use ghostlink_core::{
    EnvironmentSignals, LoopbackNetwork, NullHandler, PeerHandler, ProtocolSelector,
    SessionContext, TransportChannel, diagnostics,
};
use ghostlink_signal::relay::{
    EndpointPool, RelayClient, RelayClientConfig, RelayEvent, RelayServer, SERVICE_TAG,
    WsConnector, fetch_assigned_id,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::Config;

/// GhostLink - serverless peer-to-peer connection establishment
#[derive(Parser)]
#[command(name = "ghostlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling relay
    Relay {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Request a session identity from a broker
    Id {
        /// Identity-issuing base URL (defaults to the managed id endpoint)
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Print the ICE configuration handed to negotiation
    Ice,

    /// Connect to the relay pool and watch the session
    Probe {
        /// Seconds to hold the session open
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Probe the managed broker pool instead of the direct relay pool
        #[arg(long)]
        managed: bool,
    },

    /// Show device class, timers and a connection report
    Diagnose {
        /// Classify from this user agent instead of the environment
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Connect two in-process peers through the configured relay
    Selftest {
        /// Messages to exchange once connected
        #[arg(short, long, default_value = "10")]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    init_logging(&config, cli.verbose)?;

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Relay { bind } => {
            run_relay(bind, &config).await?;
        }
        Commands::Id { endpoint } => {
            request_id(endpoint, &config).await?;
        }
        Commands::Ice => {
            show_ice(&config)?;
        }
        Commands::Probe { seconds, managed } => {
            probe(Duration::from_secs(seconds), managed, &config).await?;
        }
        Commands::Diagnose { user_agent } => {
            diagnose(user_agent, &config)?;
        }
        Commands::Selftest { messages } => {
            self_test(messages, &config).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let builder = tracing_subscriber::fmt().with_env_filter(level);

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn context(config: &Config, signals: Option<EnvironmentSignals>) -> anyhow::Result<SessionContext> {
    let mut builder = SessionContext::builder()
        .config(config.to_link_config())
        .negotiators(Arc::new(LoopbackNetwork::new().factory()));
    if let Some(signals) = signals {
        builder = builder.signals(signals);
    }
    Ok(builder.build()?)
}

/// Run the relay until Ctrl+C
async fn run_relay(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let addr = match bind {
        Some(bind) => bind.parse()?,
        None => config.parse_bind_addr()?,
    };

    let server = RelayServer::bind(addr).await?;
    let local = server.local_addr()?;
    println!("Relay listening on ws://{local}/peerjs");
    println!("Identity endpoint: http://{local}/peerjs/id");
    println!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down relay");
        }
        signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}

async fn request_id(endpoint: Option<String>, config: &Config) -> anyhow::Result<()> {
    let Some(base) = endpoint.or_else(|| config.managed.id_endpoint.clone()) else {
        anyhow::bail!("No identity endpoint given and none configured under [managed]");
    };

    let id = fetch_assigned_id(&base).await?;
    println!("{id}");
    Ok(())
}

fn show_ice(config: &Config) -> anyhow::Result<()> {
    let ctx = context(config, None)?;
    println!("{}", serde_json::to_string_pretty(&ctx.ice_config())?);
    Ok(())
}

async fn probe(hold: Duration, managed: bool, config: &Config) -> anyhow::Result<()> {
    let ctx = context(config, None)?;
    let timeouts = ctx.timeouts();
    let (endpoints, relay_config) = if managed {
        (
            &config.managed.endpoints,
            RelayClientConfig {
                open_timeout: timeouts.broker_open,
                heartbeat_interval: timeouts.broker_heartbeat,
                token: config.managed.token.clone(),
                service_tag: SERVICE_TAG.to_string(),
            },
        )
    } else {
        (
            &config.relay.endpoints,
            RelayClientConfig {
                open_timeout: timeouts.relay_open,
                heartbeat_interval: timeouts.relay_heartbeat,
                token: config.relay.token.clone(),
                service_tag: SERVICE_TAG.to_string(),
            },
        )
    };

    let identity = ctx.identity_store().lease();
    let mut pool = EndpointPool::new(endpoints.iter().cloned());
    let (events_tx, mut events) = mpsc::unbounded_channel();

    println!("Device: {}", ctx.device());
    println!("Identity: {identity}");
    println!(
        "Open timeout: {:?}, heartbeat: {:?}",
        relay_config.open_timeout, relay_config.heartbeat_interval
    );

    let client = RelayClient::connect_with_pool(
        &WsConnector,
        &mut pool,
        &identity,
        &relay_config,
        events_tx,
        |endpoint, err| println!("  {endpoint}: FAILED ({err})"),
    )
    .await?;
    println!("  {}: OPEN", client.endpoint());

    let deadline = tokio::time::sleep(hold);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Some(RelayEvent::Signal { src, signal }) => {
                    println!("  SIGNAL from {src}: {signal}");
                }
                Some(RelayEvent::Closed) | None => {
                    println!("  relay closed the session");
                    break;
                }
            },
        }
    }

    println!("State after {:?}: {:?}", hold, client.state().await);
    let status = pool.status();
    println!("Pool: {}/{} endpoints healthy", status.active, status.total);
    client.close().await;
    ctx.identity_store().clear();
    Ok(())
}

fn diagnose(user_agent: Option<String>, config: &Config) -> anyhow::Result<()> {
    let signals = user_agent.map(|ua| EnvironmentSignals::from_env().with_user_agent(ua));
    let ctx = context(config, signals)?;
    let t = ctx.timeouts();

    println!("Device class: {}", ctx.device());
    println!("Timers:");
    println!("  relay open        {:?}", t.relay_open);
    println!("  relay heartbeat   {:?}", t.relay_heartbeat);
    println!("  broker open       {:?}", t.broker_open);
    println!("  broker heartbeat  {:?}", t.broker_heartbeat);
    println!("  negotiation       {:?}", t.negotiation);
    println!("  gathering         {:?}", t.gathering);
    println!("  reconnect         {} x {:?}", t.reconnect_attempts, t.reconnect_backoff);
    println!("  candidate pool    {}", t.candidate_pool_size);
    println!();
    println!(
        "{}",
        diagnostics::report(&ctx.diagnostics().snapshot(), ctx.device())
    );
    Ok(())
}

/// Forwards received payloads to the self test
struct Inbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerHandler for Inbox {
    fn on_connect(&self, channel: TransportChannel) {
        tracing::info!("Answerer connected to {}", channel.peer());
    }

    fn on_message(&self, _peer: &str, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }
}

async fn self_test(messages: usize, config: &Config) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let build = |config: &Config| -> anyhow::Result<SessionContext> {
        Ok(SessionContext::builder()
            .config(config.to_link_config())
            .negotiators(Arc::new(network.factory()))
            .build()?)
    };

    let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
    let answerer = ProtocolSelector::new(build(config)?, Arc::new(Inbox { tx: inbox_tx }));
    let offerer = ProtocolSelector::new(build(config)?, Arc::new(NullHandler));

    let result = async {
        let bound = answerer.start().await?;
        println!("Answerer bound {} as {}", bound.strategy, bound.identity);

        let established = offerer.initiate(&bound.identity, Arc::new(NullHandler)).await?;
        println!(
            "Offerer connected via {} (fallback: {})",
            established.strategy, established.fallback_used
        );

        for i in 0..messages {
            offerer.send(format!("message {i}").as_bytes()).await?;
        }

        let wait = offerer.context().timeouts().negotiation;
        for i in 0..messages {
            let data = tokio::time::timeout(wait, inbox.recv())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for message {i}"))?
                .ok_or_else(|| anyhow::anyhow!("Answerer stopped"))?;
            let expected = format!("message {i}");
            if data != expected.as_bytes() {
                anyhow::bail!("Message {} out of order", i);
            }
        }
        println!("Delivered {messages} messages in order");
        anyhow::Ok(())
    }
    .await;

    println!("\nOfferer events:");
    for logged in offerer.context().events().snapshot() {
        println!("  {:>8.3}s  {}", logged.at.as_secs_f64(), logged.event);
    }

    offerer.teardown().await;
    answerer.teardown().await;
    result
}
