//! Cairn CLI - content-aware storage routing

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cairn_core::config::{ConfigManager, ConfigUpdate, EngineSettings, RoutingConfig};
use cairn_core::ipc::{RoutingClient, RoutingServer};
use cairn_core::routing::{
    ContentDescriptor, Factor, RoutingManager, RoutingPriority, RoutingStrategy, WeightsUpdate,
};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about = "Content-aware storage routing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Engine settings file (TOML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Keep all state files in this directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve routing requests on the local socket
    Serve {
        /// Socket path (defaults to the settings value)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Select a backend for a piece of content
    Select {
        #[command(flatten)]
        content: ContentArgs,
        /// Routing strategy (content_type, cost, performance, reliability, hybrid)
        #[arg(long)]
        strategy: Option<RoutingStrategy>,
        /// Routing priority (balanced, performance, cost, reliability)
        #[arg(long)]
        priority: Option<RoutingPriority>,
        /// Restrict selection to these backends (comma separated)
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        available: Option<Vec<String>>,
        /// Ask a running `cairn serve` instead of routing in-process
        #[arg(long)]
        remote: bool,
    },

    /// Report the outcome of an operation
    Outcome {
        /// Backend the operation ran against
        backend: String,
        #[command(flatten)]
        content: ContentArgs,
        /// The operation failed
        #[arg(long)]
        failed: bool,
        /// Operation duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Report to a running `cairn serve` instead of in-process
        #[arg(long)]
        remote: bool,
    },

    /// Show weights and learned backend scores
    Insights,

    /// Routing configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show windowed metrics
    Stats {
        /// Time window in hours
        #[arg(long, default_value_t = 24)]
        window_hours: u32,
    },

    /// Delete metrics older than the retention window
    Prune {
        /// Override the configured retention
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

#[derive(Args)]
struct ContentArgs {
    /// Content type (e.g. application/pdf)
    #[arg(long, short = 't', required_unless_present = "file")]
    content_type: Option<String>,
    /// Content size in bytes
    #[arg(long, short = 's', default_value_t = 0)]
    size: u64,
    /// Content hash or address
    #[arg(long)]
    hash: Option<String>,
    /// Metadata entries (key=value)
    #[arg(long = "meta", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,
    /// Describe a local file (size and SHA-256 are computed)
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the routing configuration
    Show,
    /// Write a fresh routing configuration
    Init {
        /// Backend roster (comma separated)
        #[arg(long, value_delimiter = ',')]
        backends: Vec<String>,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Set a configuration value
    Set { key: String, value: String },
    /// Update optimization weights (must still sum to 1.0)
    SetWeights {
        #[arg(long)]
        network_quality: Option<f64>,
        #[arg(long)]
        content_match: Option<f64>,
        #[arg(long)]
        cost_efficiency: Option<f64>,
        #[arg(long)]
        geographic_proximity: Option<f64>,
        #[arg(long)]
        load_balancing: Option<f64>,
        #[arg(long)]
        reliability: Option<f64>,
        #[arg(long)]
        historical_success: Option<f64>,
    },
    /// Show config file path
    Path,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Commands::Serve { socket } => cmd_serve(settings, socket, out).await,

        Commands::Select {
            content,
            strategy,
            priority,
            available,
            remote,
        } => cmd_select(settings, content, strategy, priority, available, remote, out).await,

        Commands::Outcome {
            backend,
            content,
            failed,
            duration_ms,
            remote,
        } => cmd_outcome(settings, &backend, content, !failed, duration_ms, remote, out).await,

        Commands::Insights => cmd_insights(settings, out).await,

        Commands::Config { action } => cmd_config(&settings, action, out),

        Commands::Stats { window_hours } => cmd_stats(settings, window_hours, out).await,

        Commands::Prune { retention_days } => cmd_prune(settings, retention_days, out).await,
    };

    if let Err(e) = &result {
        if let Some(hint) = e
            .downcast_ref::<cairn_core::Error>()
            .and_then(cairn_core::Error::suggestion)
        {
            eprintln!("Hint: {}", hint);
        }
    }
    result
}

fn load_settings(cli: &Cli) -> anyhow::Result<EngineSettings> {
    let mut settings = match &cli.state_dir {
        Some(dir) => EngineSettings::in_dir(dir),
        None => EngineSettings::load_or_default(cli.settings.as_deref())?,
    };
    if cli.state_dir.is_some() {
        if let Some(path) = &cli.settings {
            let loaded = EngineSettings::load(path)?;
            settings.background = loaded.background;
            settings.server = loaded.server;
        }
    }
    Ok(settings)
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// Settings for one-shot commands: no periodic work
fn one_shot(mut settings: EngineSettings) -> EngineSettings {
    settings.background.collect_metrics = false;
    settings.background.prune_metrics = false;
    settings
}

async fn describe(args: ContentArgs) -> anyhow::Result<ContentDescriptor> {
    let mut content = match &args.file {
        Some(path) => {
            let content_type = args
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            ContentDescriptor::from_file(path, content_type)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?
        }
        None => {
            let content_type = args.content_type.clone().unwrap_or_default();
            ContentDescriptor::new(content_type, args.size)
        }
    };
    if let Some(hash) = args.hash {
        content = content.with_hash(hash);
    }
    for (key, value) in args.metadata {
        content = content.with_metadata(key, value);
    }
    Ok(content)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_serve(
    settings: EngineSettings,
    socket: Option<PathBuf>,
    out: Output,
) -> anyhow::Result<()> {
    let socket = socket.unwrap_or_else(|| settings.socket_path.clone());
    let server_settings = settings.server.clone();
    let manager = Arc::new(RoutingManager::create(settings).await?);

    let server = RoutingServer::bind(manager.clone(), &socket, server_settings)?;
    if !out.quiet {
        println!("Serving on {}", socket.display());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal_token.cancel();
    });

    server.serve(shutdown).await?;
    manager.stop().await?;
    Ok(())
}

async fn cmd_select(
    settings: EngineSettings,
    content: ContentArgs,
    strategy: Option<RoutingStrategy>,
    priority: Option<RoutingPriority>,
    available: Option<Vec<String>>,
    remote: bool,
    out: Output,
) -> anyhow::Result<()> {
    let content = describe(content).await?;

    if remote {
        let mut client = RoutingClient::connect(&settings.socket_path).await?;
        let backend = client
            .select_backend(&content, strategy, priority, available.as_deref())
            .await?;
        client.disconnect().await?;

        if out.json() {
            out.print_json(&serde_json::json!({ "backend_id": backend }))?;
        } else {
            println!("{}", backend);
        }
        return Ok(());
    }

    let manager = RoutingManager::create(one_shot(settings)).await?;
    let decision = manager.route(&content, strategy, priority, available.as_deref());
    manager.stop().await?;
    let decision = decision?;

    if out.json() {
        out.print_json(&decision)?;
    } else if out.quiet {
        println!("{}", decision.backend_id);
    } else {
        println!("{}", decision.backend_id);
        println!(
            "  score {:.4} ({} / {})",
            decision.score, decision.strategy, decision.priority
        );
        for alt in &decision.alternatives {
            println!("  alternative {:<16} {:.4}", alt.backend_id, alt.score);
        }
    }
    Ok(())
}

async fn cmd_outcome(
    settings: EngineSettings,
    backend: &str,
    content: ContentArgs,
    success: bool,
    duration_ms: Option<u64>,
    remote: bool,
    out: Output,
) -> anyhow::Result<()> {
    let content = describe(content).await?;

    if remote {
        let mut client = RoutingClient::connect(&settings.socket_path).await?;
        client
            .record_outcome(backend, &content, success, duration_ms)
            .await?;
        client.disconnect().await?;
    } else {
        let manager = RoutingManager::create(one_shot(settings)).await?;
        if !manager.config().has_backend(backend) {
            manager.stop().await?;
            return Err(cairn_core::Error::UnknownBackend(backend.to_string()).into());
        }
        manager.record_routing_outcome(backend, &content, success, duration_ms);
        manager.stop().await?;
    }

    if out.json() {
        out.print_json(&serde_json::json!({
            "backend_id": backend,
            "success": success,
            "recorded": true,
        }))?;
    } else if !out.quiet {
        println!(
            "Recorded {} for {}",
            if success { "success" } else { "failure" },
            backend
        );
    }
    Ok(())
}

async fn cmd_insights(settings: EngineSettings, out: Output) -> anyhow::Result<()> {
    let manager = RoutingManager::create(one_shot(settings)).await?;
    let insights = manager.get_routing_insights();
    manager.stop().await?;

    if out.json() {
        return out.print_json(&insights);
    }

    println!(
        "Routing {} (strategy {}, priority {})",
        if insights.enabled { "enabled" } else { "disabled" },
        insights.default_strategy,
        insights.default_priority
    );
    println!();
    println!("{:<22} {:>10} {:>10}", "Factor", "Configured", "Effective");
    for factor in Factor::ALL {
        println!(
            "{:<22} {:>10.3} {:>10.3}",
            factor.as_str(),
            insights.factor_weights.get(factor),
            insights.effective_weights.get(factor)
        );
    }

    if out.quiet {
        return Ok(());
    }
    println!();
    for (backend_id, insight) in &insights.backend_scores {
        println!("{}", backend_id);
        if let Some(latency) = insight.observations.latency_ema_ms {
            println!("  latency ~{:.1} ms", latency);
        }
        if insight.learned.is_empty() {
            println!("  no outcomes yet");
        }
        for (content_type, score) in &insight.learned {
            println!(
                "  {:<28} ema {:.3} ({} ok / {} failed)",
                content_type, score.ema, score.successes, score.failures
            );
        }
    }
    Ok(())
}

fn cmd_config(settings: &EngineSettings, action: ConfigAction, out: Output) -> anyhow::Result<()> {
    let path = &settings.config_path;

    match action {
        ConfigAction::Show => {
            let config = ConfigManager::open(path.clone())?.current();
            println!("{}", serde_json::to_string_pretty(config.as_ref())?);
        }

        ConfigAction::Init { backends, force } => {
            if path.exists() {
                if !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                std::fs::remove_file(path)?;
            }
            let config = RoutingConfig {
                backends,
                ..Default::default()
            };
            let manager = ConfigManager::open_or_init(path.clone(), || config)?;
            if !out.quiet {
                println!("Wrote {}", manager.path().display());
            }
        }

        ConfigAction::Set { key, value } => {
            let update = parse_config_set(&key, &value)?;
            let config = ConfigManager::open(path.clone())?.update_config(&update)?;
            if out.json() {
                out.print_json(&config)?;
            } else if !out.quiet {
                println!("Set {} = {}", key, value);
            }
        }

        ConfigAction::SetWeights {
            network_quality,
            content_match,
            cost_efficiency,
            geographic_proximity,
            load_balancing,
            reliability,
            historical_success,
        } => {
            let fields = [
                (Factor::NetworkQuality, network_quality),
                (Factor::ContentMatch, content_match),
                (Factor::CostEfficiency, cost_efficiency),
                (Factor::GeographicProximity, geographic_proximity),
                (Factor::LoadBalancing, load_balancing),
                (Factor::Reliability, reliability),
                (Factor::HistoricalSuccess, historical_success),
            ];
            let weights = fields
                .into_iter()
                .filter_map(|(factor, value)| value.map(|v| (factor, v)))
                .fold(WeightsUpdate::default(), |update, (factor, v)| {
                    update.set(factor, v)
                });

            let config = ConfigManager::open(path.clone())?
                .update_config(&ConfigUpdate::default().weights(weights))?;
            if out.json() {
                out.print_json(&config.optimization_weights)?;
            } else if !out.quiet {
                println!("Weights updated");
            }
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn parse_config_set(key: &str, value: &str) -> anyhow::Result<ConfigUpdate> {
    let update = ConfigUpdate::default();
    let update = match key {
        "default_strategy" => update.strategy(value.parse()?),
        "default_priority" => update.priority(value.parse()?),
        "backends" => update.backends(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ),
        "enabled" => update.enabled(
            value
                .parse()
                .with_context(|| format!("expected true or false, got '{}'", value))?,
        ),
        "retention_days" => update.retention_days(
            value
                .parse()
                .with_context(|| format!("expected a number of days, got '{}'", value))?,
        ),
        other => anyhow::bail!(
            "unknown key '{}' (expected default_strategy, default_priority, backends, enabled or retention_days)",
            other
        ),
    };
    Ok(update)
}

async fn cmd_stats(settings: EngineSettings, window_hours: u32, out: Output) -> anyhow::Result<()> {
    let store = open_store(&settings.database_path).await?;
    let success = store.get_backend_success_rates(window_hours).await;
    let latency = store.get_backend_latency_stats(window_hours).await;
    let usage = store.get_backend_usage_stats(window_hours).await;
    let counts = store.row_counts().await?;
    store.close().await;

    if out.json() {
        return out.print_json(&serde_json::json!({
            "window_hours": window_hours,
            "success_rates": success,
            "latency": latency,
            "usage": usage,
            "rows": counts,
        }));
    }

    println!("Last {} hours", window_hours);
    let backends: std::collections::BTreeSet<&String> = success
        .keys()
        .chain(latency.keys())
        .chain(usage.keys())
        .collect();
    if backends.is_empty() {
        println!("  no activity");
    }
    for backend in backends {
        let rate = success
            .get(backend)
            .map(|s| format!("{:.1}% of {}", s.rate * 100.0, s.total))
            .unwrap_or_else(|| "-".to_string());
        let avg = latency
            .get(backend)
            .map(|l| format!("{:.1} ms", l.avg_ms))
            .unwrap_or_else(|| "-".to_string());
        let decisions = usage.get(backend).map(|u| u.decisions).unwrap_or(0);
        println!(
            "  {:<16} success {:<16} latency {:<10} decisions {}",
            backend, rate, avg, decisions
        );
    }

    if !out.quiet {
        println!();
        println!(
            "Stored rows: {} decisions, {} outcomes, {} metrics",
            counts.decisions, counts.outcomes, counts.metrics
        );
    }
    Ok(())
}

async fn cmd_prune(
    settings: EngineSettings,
    retention_days: Option<u32>,
    out: Output,
) -> anyhow::Result<()> {
    let days = match retention_days {
        Some(days) => days,
        None => ConfigManager::open(settings.config_path.clone())?
            .current()
            .retention_days,
    };
    let store = open_store(&settings.database_path).await?;
    let report = store.prune(days).await;
    store.close().await;
    let report = report?;

    if out.json() {
        out.print_json(&report)?;
    } else if !out.quiet {
        println!(
            "Pruned {} rows older than {} days ({} decisions, {} outcomes, {} metrics)",
            report.total(),
            days,
            report.decisions,
            report.outcomes,
            report.metrics
        );
    }
    Ok(())
}

async fn open_store(path: &Path) -> anyhow::Result<cairn_core::metrics::MetricsStore> {
    cairn_core::metrics::MetricsStore::connect(path)
        .await
        .with_context(|| format!("Failed to open metrics database {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("region=eu-west").unwrap(),
            ("region".to_string(), "eu-west".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_parse_config_set() {
        let update = parse_config_set("backends", "s3, ipfs,,local").unwrap();
        assert_eq!(
            update.backends,
            Some(vec!["s3".to_string(), "ipfs".to_string(), "local".to_string()])
        );
        assert!(parse_config_set("enabled", "maybe").is_err());
        assert!(parse_config_set("colour", "blue").is_err());
        assert_eq!(
            parse_config_set("default_priority", "cost")
                .unwrap()
                .default_priority,
            Some(RoutingPriority::Cost)
        );
    }
}
