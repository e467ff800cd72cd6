mod demo;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use statewire_client::{ClientStore, ClientSubscription, Ingest, WsTransport, session_url};
use statewire_core::config::Config;
use statewire_core::patch::PatchMode;
use statewire_core::session::SessionId;
use statewire_core::transport::EventSource;
use statewire_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "statewire",
    about = "Stream agent state to clients and take their edits back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Host the weather demo session as "demo"
        #[arg(long)]
        demo: bool,

        /// Seconds the demo session waits for a new input before completing
        #[arg(long, default_value_t = 300)]
        idle: u64,
    },

    /// Run the weather demo in-process and print every event
    Demo {
        /// Simulated model latency in milliseconds
        #[arg(long, default_value_t = 200)]
        delay_ms: u64,
    },

    /// Mirror a session and print its state on every change
    Watch {
        session: String,

        /// Gateway base URL (default: from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Write a field of a session's state
    Write {
        session: String,
        field: String,
        /// JSON value (bare words are taken as strings)
        value: String,

        /// replace, append or merge
        #[arg(long, default_value = "replace")]
        mode: String,

        #[arg(long)]
        url: Option<String>,

        /// Seconds to wait for the gateway to settle the write
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// List sessions hosted by a gateway
    Sessions {
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for errors
    Validate,
}

fn http_base(config: &Config, url: Option<String>) -> String {
    url.unwrap_or_else(|| format!("http://{}:{}", config.gateway_bind(), config.gateway_port()))
        .trim_end_matches('/')
        .to_string()
}

fn ws_base(http: &str) -> String {
    if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http.to_string()
    }
}

fn parse_mode(mode: &str) -> anyhow::Result<PatchMode> {
    match mode {
        "replace" => Ok(PatchMode::Replace),
        "append" => Ok(PatchMode::Append),
        "merge" => Ok(PatchMode::Merge),
        other => bail!("unknown mode '{other}' (expected replace, append or merge)"),
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn serve(config: Config, port: Option<u16>, with_demo: bool, idle: u64) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());
    let mut state = GatewayState::new(Arc::new(config));
    if with_demo {
        state = state.with_shape(demo::weather_shape());
    }

    #[cfg(feature = "metrics")]
    {
        let handle = statewire_gateway::metrics::install_prometheus_recorder()?;
        state = state.with_metrics(handle);
    }

    let state = Arc::new(state);
    if with_demo {
        let entry = demo::open_demo_session(&state).await?;
        tokio::spawn(async move {
            let idle = Some(Duration::from_secs(idle));
            if let Err(e) = demo::run_weather_workflow(entry.runner, Duration::from_millis(500), idle).await {
                tracing::error!("Demo workflow failed: {e}");
            }
        });
        tracing::info!("Demo session available at /sessions/{}/ws", demo::DEMO_SESSION);
    }

    tracing::info!("Starting statewire gateway on port {port}");
    statewire_gateway::start_gateway(state, port).await
}

async fn run_demo(config: Config, delay: Duration) -> anyhow::Result<()> {
    let window = config.reorder_window();
    let state = GatewayState::new(Arc::new(config)).with_shape(demo::weather_shape());
    let entry = demo::open_demo_session(&state).await?;

    let mut events = entry.channel.subscribe();
    let workflow = tokio::spawn(demo::run_weather_workflow(entry.runner.clone(), delay, None));

    let mut store = ClientStore::new(SessionId::from(demo::DEMO_SESSION), window);
    while let Some(event) = events.next_event().await? {
        if let Some(line) = statewire_gateway::events::encode_event(&event) {
            println!("{line}");
        }
        store.ingest(event)?;
    }
    workflow.await??;

    let canonical = entry.runner.view().await;
    println!("{}", serde_json::to_string_pretty(&store.current_mirror())?);
    if store.current_mirror() != canonical.state.to_value() {
        bail!("client mirror diverged from canonical state at seq {}", canonical.seq);
    }
    tracing::info!(seq = canonical.seq, status = %store.status(), "Mirror converged");
    Ok(())
}

async fn watch(config: &Config, session: String, url: Option<String>) -> anyhow::Result<()> {
    let id = SessionId::from(session);
    let url = session_url(&ws_base(&http_base(config, url)), &id);
    let transport = WsTransport::connect(url).await?;
    let mut sub = ClientSubscription::new(transport, ClientStore::new(id, config.reorder_window()));

    while let Some(outcome) = sub.pump().await? {
        match outcome {
            Ingest::Applied(_) => {
                println!(
                    "[seq {} {}] {}",
                    sub.store().last_seq(),
                    sub.status(),
                    serde_json::to_string(&sub.current_mirror())?
                );
            }
            Ingest::Rejected { override_id, error } => {
                tracing::warn!(%override_id, code = %error.code, "Write rejected: {}", error.message);
            }
            Ingest::Buffered | Ingest::Duplicate | Ingest::Discarded => {}
        }
    }
    tracing::info!(status = %sub.status(), resyncs = sub.resyncs(), "Subscription ended");
    Ok(())
}

async fn write(
    config: &Config,
    session: String,
    field: String,
    value: Value,
    mode: PatchMode,
    url: Option<String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let id = SessionId::from(session);
    let url = session_url(&ws_base(&http_base(config, url)), &id);
    let transport = WsTransport::connect(url).await?;
    let mut sub = ClientSubscription::new(transport, ClientStore::new(id, config.reorder_window()));

    // The gateway opens with a snapshot; writes are based on its sequence number.
    if sub.pump().await?.is_none() {
        bail!("gateway closed the subscription before sending a snapshot");
    }

    let override_id = sub.write_with_mode(&field, value, mode).await?;
    tokio::time::timeout(timeout, settle(&mut sub, &override_id))
        .await
        .context("timed out waiting for the gateway to apply the write")??;

    println!("{}", serde_json::to_string_pretty(&sub.current_mirror()[field.as_str()])?);
    Ok(())
}

/// Pump until the gateway acknowledges, supersedes or rejects `override_id`.
async fn settle<T: EventSource>(sub: &mut ClientSubscription<T>, override_id: &str) -> anyhow::Result<()> {
    loop {
        match sub.pump().await? {
            None => bail!("subscription ended before the write was settled"),
            Some(Ingest::Rejected { override_id: rejected, error }) if rejected == override_id => {
                bail!("write rejected ({}): {}", error.code, error.message)
            }
            Some(_) => {
                if !sub.store().pending().any(|w| w.id == override_id) {
                    return Ok(());
                }
            }
        }
    }
}

async fn list_sessions(config: &Config, url: Option<String>) -> anyhow::Result<()> {
    let resp = reqwest::get(format!("{}/sessions", http_base(config, url))).await?;
    if !resp.status().is_success() {
        bail!("gateway answered {}", resp.status());
    }
    let body: Value = resp.json().await?;
    let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
    if sessions.is_empty() {
        println!("No sessions.");
    }
    for s in sessions {
        println!(
            "{:<24} {:<16} seq={:<6} subscribers={}",
            s["id"].as_str().unwrap_or("?"),
            s["status"].as_str().unwrap_or("?"),
            s["seq"],
            s["subscribers"]
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;

    logging::init_logging(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port, demo, idle } => serve(config, port, demo, idle).await?,
        Commands::Demo { delay_ms } => run_demo(config, Duration::from_millis(delay_ms)).await?,
        Commands::Watch { session, url } => watch(&config, session, url).await?,
        Commands::Write {
            session,
            field,
            value,
            mode,
            url,
            timeout,
        } => {
            let mode = parse_mode(&mode)?;
            write(
                &config,
                session,
                field,
                parse_value(&value),
                mode,
                url,
                Duration::from_secs(timeout),
            )
            .await?
        }
        Commands::Sessions { url } => list_sessions(&config, url).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({})", config_path.display());
            }
        },
    }

    Ok(())
}
