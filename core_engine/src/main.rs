use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{error, info};

use core_engine::model::{Node, NodeClass, NodeFilter, NodeState};
use core_engine::store::NodeStore;
use core_engine::supervisor::{BatchReport, HealthOutcome, HealthReport};
use core_engine::tunnel::{LivePeer, ServerStatus};
use core_engine::Engine;
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, init_logging_from_config, LogOptions};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  peerwarden serve\n  peerwarden register worker-7 --class worker --meta hostname=gpu-box\n  peerwarden check --class worker --output json\n  peerwarden list --live\n  peerwarden status\n  peerwarden render worker-7 > worker-7.conf")]
struct Args {
    /// Configuration file (defaults to the per-user config path when present)
    #[arg(short, long, env = "PEERWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(short, long, value_enum, env = "PEERWARDEN_LOG_LEVEL")]
    log_level: Option<LogLevelArg>,

    /// Emit JSON logs
    #[arg(long, env = "PEERWARDEN_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repair server addressing, then run the health monitor until interrupted
    Serve,
    /// Register a node, directly or by redeeming a provisioning token
    Register {
        /// Node id (omit when using --token)
        node_id: Option<String>,
        #[arg(long, default_value = "worker")]
        class: String,
        /// Provisioning token to redeem instead of naming the node
        #[arg(long, conflicts_with = "node_id")]
        token: Option<String>,
        /// Opaque metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Mint a provisioning token for a future node
    IssueToken {
        node_id: String,
        #[arg(long, default_value = "worker")]
        class: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = core_engine::model::DEFAULT_TOKEN_TTL_SECS)]
        ttl_secs: i64,
    },
    /// Consume a token and show what it was bound to
    Redeem { token: String },
    /// Publish a node's peer and wait for it to answer
    Activate { node_id: String },
    /// Retract a node's peer and park it
    Deactivate { node_id: String },
    /// Re-run activation for a dropped node
    Reconnect { node_id: String },
    /// Health-check one node, or every node of a class
    Check {
        node_id: Option<String>,
        #[arg(long, conflicts_with = "node_id")]
        class: Option<String>,
    },
    /// List nodes
    List {
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        state: Option<String>,
        /// Add handshake and traffic figures from the live interface
        #[arg(long)]
        live: bool,
    },
    /// Show the server interface and address pool usage
    Status,
    /// Remove a node and free its address
    Deregister { node_id: String },
    /// Issue new keys for a node, keeping its address
    RotateKeys { node_id: String },
    /// Print a node's client configuration
    Render {
        node_id: String,
        /// Render again from current settings before printing
        #[arg(long)]
        refresh: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[derive(Serialize)]
struct NodeSummary<'a> {
    id: &'a str,
    class: NodeClass,
    address: String,
    public_key: &'a str,
    state: NodeState,
    updated_at: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    live: Option<LiveSummary>,
}

#[derive(Serialize)]
struct LiveSummary {
    endpoint: Option<String>,
    latest_handshake: Option<String>,
    handshake_age_secs: Option<u64>,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl From<&LivePeer> for LiveSummary {
    fn from(peer: &LivePeer) -> Self {
        LiveSummary {
            endpoint: peer.endpoint.clone(),
            latest_handshake: peer.latest_handshake.map(|at| at.to_rfc3339()),
            handshake_age_secs: peer.handshake_age(chrono::Utc::now()).map(|age| age.as_secs()),
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
        }
    }
}

impl<'a> From<&'a Node> for NodeSummary<'a> {
    fn from(node: &'a Node) -> Self {
        NodeSummary {
            id: &node.id,
            class: node.class,
            address: node.address.to_string(),
            public_key: &node.public_key,
            state: node.state,
            updated_at: node.updated_at.to_rfc3339(),
            metadata: &node.metadata,
            live: None,
        }
    }
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&Message { status, detail })?)
        }
    }
    Ok(())
}

fn print_nodes(fmt: OutputFormat, nodes: &[Node]) -> Result<()> {
    match fmt {
        OutputFormat::Table => {
            println!("{:<24} {:<14} {:<16} {:<13} PUBLIC KEY", "ID", "CLASS", "ADDRESS", "STATE");
            for node in nodes {
                println!(
                    "{:<24} {:<14} {:<16} {:<13} {}",
                    node.id, node.class, node.address, node.state, node.public_key
                );
            }
        }
        OutputFormat::Json => {
            let summaries: Vec<NodeSummary<'_>> = nodes.iter().map(NodeSummary::from).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }
    Ok(())
}

fn describe_handshake(peer: Option<&LivePeer>) -> String {
    match peer {
        None => "not live".to_string(),
        Some(peer) => match peer.handshake_age(chrono::Utc::now()) {
            Some(age) => format!("{}s ago", age.as_secs()),
            None => "never".to_string(),
        },
    }
}

fn print_live_nodes(
    fmt: OutputFormat,
    nodes: &[Node],
    live: &HashMap<String, LivePeer>,
) -> Result<()> {
    match fmt {
        OutputFormat::Table => {
            println!(
                "{:<24} {:<14} {:<16} {:<13} {:<12} {:>12} {:>12}",
                "ID", "CLASS", "ADDRESS", "STATE", "HANDSHAKE", "RX", "TX"
            );
            for node in nodes {
                let peer = live.get(&node.public_key);
                println!(
                    "{:<24} {:<14} {:<16} {:<13} {:<12} {:>12} {:>12}",
                    node.id,
                    node.class,
                    node.address,
                    node.state,
                    describe_handshake(peer),
                    peer.map_or(0, |p| p.rx_bytes),
                    peer.map_or(0, |p| p.tx_bytes)
                );
            }
        }
        OutputFormat::Json => {
            let summaries: Vec<NodeSummary<'_>> = nodes
                .iter()
                .map(|node| NodeSummary {
                    live: live.get(&node.public_key).map(LiveSummary::from),
                    ..NodeSummary::from(node)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }
    Ok(())
}

fn print_status(fmt: OutputFormat, status: &ServerStatus, usage: &[(NodeClass, u64, u64)]) -> Result<()> {
    let addresses: Vec<String> = status.addresses.iter().map(ToString::to_string).collect();
    match fmt {
        OutputFormat::Table => {
            println!("public key:  {}", status.public_key);
            println!(
                "listen port: {}",
                status.listen_port.map_or_else(|| "-".to_string(), |port| port.to_string())
            );
            println!(
                "addresses:   {}{}",
                addresses.join(", "),
                if status.addressing_valid { "" } else { " (does not cover the overlay)" }
            );
            println!(
                "peers:       {} ({} with a handshake)",
                status.peer_count, status.handshaken
            );
            println!("traffic:     rx {} B, tx {} B", status.rx_bytes, status.tx_bytes);
            for (class, used, total) in usage {
                println!("pool {:<14} {used}/{total}", class.as_str());
            }
        }
        OutputFormat::Json => {
            let pools: BTreeMap<&str, serde_json::Value> = usage
                .iter()
                .map(|(class, used, total)| {
                    (class.as_str(), serde_json::json!({ "used": used, "total": total }))
                })
                .collect();
            let body = serde_json::json!({
                "public_key": status.public_key,
                "listen_port": status.listen_port,
                "addresses": addresses,
                "addressing_valid": status.addressing_valid,
                "peer_count": status.peer_count,
                "handshaken": status.handshaken,
                "rx_bytes": status.rx_bytes,
                "tx_bytes": status.tx_bytes,
                "pools": pools,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

fn describe_health(report: &HealthReport) -> String {
    match &report.outcome {
        HealthOutcome::Skipped(reason) => format!("{} skipped ({reason:?})", report.node_id),
        HealthOutcome::Checked {
            reachable,
            previous,
            current,
        } => format!(
            "{} {} ({previous} -> {current})",
            report.node_id,
            if *reachable { "reachable" } else { "unreachable" }
        ),
    }
}

fn print_batch(fmt: OutputFormat, report: &BatchReport) -> Result<()> {
    match fmt {
        OutputFormat::Table => {
            for health in &report.reports {
                println!("{}", describe_health(health));
            }
            println!(
                "connected {}/{} (disconnected {}, skipped {}, errors {})",
                report.connected, report.total, report.disconnected, report.skipped, report.errors
            );
        }
        OutputFormat::Json => {
            let body = serde_json::json!({
                "total": report.total,
                "checked": report.checked,
                "connected": report.connected,
                "disconnected": report.disconnected,
                "skipped": report.skipped,
                "errors": report.errors,
                "results": report.reports.iter().map(describe_health).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => {
            let default = Config::default_path();
            if default.exists() {
                Config::load(&default).with_context(|| {
                    format!("failed to load configuration from {}", default.display())
                })
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.clone())?;

    let _guard = match args.log_level {
        Some(level) => init_logging(LogOptions {
            level: level.into(),
            json_format: args.json_logs || config.logging.json,
            log_to_file: config.logging.directory.is_some(),
            log_dir: config
                .logging
                .directory
                .clone()
                .unwrap_or_else(|| LogOptions::default().log_dir),
            ..Default::default()
        }),
        None => {
            let mut logging = config.logging.clone();
            logging.json |= args.json_logs;
            init_logging_from_config(&logging, false)
        }
    };

    let engine = Engine::from_config(config)
        .await
        .context("failed to initialise the engine")?;
    let out = args.output;

    match args.command {
        Command::Serve => {
            info!("Starting peerwarden");
            engine.start().await.context("startup failed")?;
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for shutdown signal")?;
            info!("Shutdown requested");
            engine.shutdown().await;
        }
        Command::Register {
            node_id,
            class,
            token,
            metadata,
        } => {
            let metadata: BTreeMap<String, String> = metadata.into_iter().collect();
            let node = match (token, node_id) {
                (Some(token), _) => engine.registrar().register_with_token(&token, metadata).await?,
                (None, Some(node_id)) => {
                    let mut request = core_engine::registration::RegistrationRequest::new(
                        node_id,
                        class.parse::<NodeClass>()?,
                    );
                    request.metadata = metadata;
                    engine.registrar().register(request).await?
                }
                (None, None) => bail!("either a node id or --token is required"),
            };
            print_nodes(out, std::slice::from_ref(&node))?;
        }
        Command::IssueToken {
            node_id,
            class,
            ttl_secs,
        } => {
            let token = engine
                .registrar()
                .issue_token(
                    &node_id,
                    class.parse::<NodeClass>()?,
                    chrono::Duration::seconds(ttl_secs),
                )
                .await?;
            match out {
                OutputFormat::Table => {
                    println!("{}", token.value);
                    println!("expires {}", token.expires_at.to_rfc3339());
                }
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "token": token.value,
                        "node_id": token.node_id,
                        "class": token.class,
                        "expires_at": token.expires_at.to_rfc3339(),
                    }))?
                ),
            }
        }
        Command::Redeem { token } => {
            let (node_id, class) = engine.registrar().redeem(&token).await?;
            print_msg(out, "redeemed", &format!("{node_id} ({class})"))?;
        }
        Command::Activate { node_id } => match engine.supervisor().activate(&node_id).await {
            Ok(report) => print_msg(
                out,
                "connected",
                &format!("{} after {} attempt(s)", report.node_id, report.attempts),
            )?,
            Err(err) => {
                error!("{err}");
                return Err(err.into());
            }
        },
        Command::Deactivate { node_id } => {
            let node = engine.supervisor().deactivate(&node_id).await?;
            print_msg(out, "deactivated", &format!("{} ({})", node.id, node.address))?;
        }
        Command::Reconnect { node_id } => {
            if engine.supervisor().auto_reconnect(&node_id).await? {
                print_msg(out, "reconnected", &node_id)?;
            } else {
                print_msg(out, "failed", &node_id)?;
                bail!("node {node_id} did not reconnect");
            }
        }
        Command::Check { node_id, class } => match node_id {
            Some(node_id) => {
                let report = engine.supervisor().health_check(&node_id).await?;
                print_msg(out, "checked", &describe_health(&report))?;
            }
            None => {
                let class = class.map(|c| c.parse::<NodeClass>()).transpose()?;
                let report = engine.supervisor().batch_health_check(class).await?;
                print_batch(out, &report)?;
            }
        },
        Command::List { class, state, live } => {
            let mut filter = NodeFilter::all().maybe_class(
                class.map(|c| c.parse::<NodeClass>()).transpose()?,
            );
            if let Some(state) = state {
                filter = filter.state(state.parse::<NodeState>().map_err(anyhow::Error::msg)?);
            }
            let nodes = engine.store().list(&filter).await?;
            if live {
                let peers = engine.synchronizer().peer_statuses().await?;
                print_live_nodes(out, &nodes, &peers)?;
            } else {
                print_nodes(out, &nodes)?;
            }
        }
        Command::Status => {
            let status = engine.synchronizer().server_status().await?;
            let mut usage = Vec::new();
            for class in engine.pool().classes() {
                let (used, total) = engine.pool().usage(class).await?;
                usage.push((class, used, total));
            }
            print_status(out, &status, &usage)?;
        }
        Command::Deregister { node_id } => {
            let node = engine.registrar().deregister(&node_id).await?;
            print_msg(out, "deregistered", &format!("{} ({} freed)", node.id, node.address))?;
        }
        Command::RotateKeys { node_id } => {
            let node = engine.registrar().rotate_keys(&node_id).await?;
            print_nodes(out, std::slice::from_ref(&node))?;
        }
        Command::Render { node_id, refresh } => {
            let node = if refresh {
                engine.registrar().rerender_config(&node_id).await?
            } else {
                engine.store().require(&node_id).await?
            };
            print!("{}", node.rendered_config);
        }
    }

    Ok(())
}
