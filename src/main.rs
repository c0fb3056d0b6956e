use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cache;
mod config;
mod extract;
mod models;
mod output;
mod providers;
mod registry;
mod server;

use cache::{Refresher, SnapshotCache};
use config::Config;
use models::{AuthConfig, AuthKind, SubscriptionEntry};
use providers::mock::MockProvider;
use providers::FetchContext;
use registry::Registry;
use server::{AppState, ProviderInfo};

#[derive(Parser)]
#[command(name = "sub-mon")]
#[command(version)]
#[command(about = "Monitor usage and cost of AI service subscriptions")]
struct Cli {
    /// Config file (default: <config dir>/sub-mon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Register the offline mock provider and a "demo" subscription for it
    #[arg(long, global = true)]
    mock: bool,

    #[command(flatten)]
    query: QueryArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch usage for configured subscriptions (default)
    Query(QueryArgs),
    /// Serve usage over HTTP with a background-refreshed cache
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Defaults to settings.api_port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List registered providers and what they support
    Providers {
        #[arg(long)]
        json: bool,
    },
    /// Validate the credentials of every configured subscription
    Check,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Clone, Default)]
struct QueryArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
    /// Only subscriptions of this provider id
    #[arg(long)]
    provider: Option<String>,
    /// Only the subscription with this name
    #[arg(long)]
    name: Option<String>,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sub_mon=debug,info")
        } else {
            EnvFilter::new("sub_mon=warn")
        }
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn build_registry(config: &Config, mock: bool) -> Result<Registry> {
    let registry = Registry::new();
    for provider in providers::builtin(&config.extractor) {
        registry.register(provider)?;
    }
    if mock {
        registry.register(Box::new(MockProvider::with_extractor(&config.extractor)))?;
    }
    debug!(providers = registry.len(), "registry ready");
    Ok(registry)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.mock && !config.subscriptions.iter().any(|s| s.provider_id == "mock") {
        config
            .subscriptions
            .push(SubscriptionEntry::new("mock", "demo"));
    }
    Ok(config)
}

async fn run_query(config: &Config, registry: &Registry, args: &QueryArgs) -> Result<()> {
    let entries = config.filter_subscriptions(args.provider.as_deref(), args.name.as_deref());
    if entries.is_empty() {
        bail!(
            "no subscriptions match; add [[subscriptions]] to {}",
            Config::config_path().display()
        );
    }

    let ctx = FetchContext::with_timeout(config.settings.timeout()?);
    let snapshots = registry.fetch_all(&ctx, &entries).await;

    if args.json {
        output::print_json(&snapshots)?;
    } else {
        output::print_table(&snapshots);
    }
    Ok(())
}

async fn run_serve(config: Config, registry: Registry, host: IpAddr, port: Option<u16>) -> Result<()> {
    let addr = SocketAddr::new(host, port.unwrap_or(config.settings.api_port));
    let state = AppState {
        refresher: Refresher {
            registry: Arc::new(registry),
            cache: Arc::new(SnapshotCache::new(config.settings.cache_ttl()?)),
            entries: Arc::new(config.subscriptions.clone()),
            timeout: config.settings.timeout()?,
        },
    };

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        on_signal.cancel();
    });

    server::serve(addr, state, config.settings.refresh_interval()?, stop).await
}

fn run_providers(registry: &Registry, json: bool) -> Result<()> {
    let infos: Vec<ProviderInfo> = registry
        .all()
        .iter()
        .map(|p| ProviderInfo {
            id: p.id().to_string(),
            display_name: p.display_name().to_string(),
            capabilities: p.capabilities(),
        })
        .collect();

    if json {
        output::print_json(&infos)?;
    } else {
        output::print_providers(&infos);
    }
    Ok(())
}

async fn run_check(config: &Config, registry: &Registry) -> Result<()> {
    if config.subscriptions.is_empty() {
        println!("No subscriptions configured.");
        return Ok(());
    }

    let timeout = config.settings.timeout()?;
    let mut failures = 0;
    for entry in &config.subscriptions {
        let label = format!("{} ({})", entry.display_name, entry.provider_id);
        let Some(provider) = registry.get(&entry.provider_id) else {
            println!("FAIL  {}: provider not registered", label);
            failures += 1;
            continue;
        };

        let ctx = FetchContext::with_timeout(timeout);
        match provider.validate_auth(&ctx, &entry.auth).await {
            Ok(()) => println!("OK    {}", label),
            Err(err) => {
                println!("FAIL  {}: {}", label, err);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} subscriptions failed validation", failures, config.subscriptions.len());
    }
    Ok(())
}

fn run_init(path: Option<&Path>, force: bool) -> Result<()> {
    let target = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
    if target.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", target.display());
    }

    let mut config = Config::default();
    config.subscriptions.push(
        SubscriptionEntry::new("openai", "work").with_auth(AuthConfig {
            kind: AuthKind::ApiKey,
            key: "${OPENAI_API_KEY}".to_string(),
            extra: Default::default(),
        }),
    );
    config.save(Some(&target))?;
    println!("Wrote {}", target.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Some(Commands::Init { force }) = cli.command {
        return run_init(cli.config.as_deref(), force);
    }

    let config = load_config(&cli).context("Failed to load configuration")?;
    let registry = build_registry(&config, cli.mock)?;

    match &cli.command {
        None => run_query(&config, &registry, &cli.query).await,
        Some(Commands::Query(args)) => run_query(&config, &registry, args).await,
        Some(Commands::Serve { host, port }) => run_serve(config, registry, *host, *port).await,
        Some(Commands::Providers { json }) => run_providers(&registry, *json),
        Some(Commands::Check) => run_check(&config, &registry).await,
        Some(Commands::Init { .. }) => Ok(()),
    }
}
