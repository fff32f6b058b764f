//! vastctl - rent and manage a Vast.ai GPU instance
//!
//! ## Usage
//!
//! ```bash
//! # Store the API key in ~/.vast_api_key
//! vastctl set-api-key <KEY>
//!
//! # Browse the marketplace
//! vastctl search-offers num_gpus=1 gpu_name=RTX_3090 --type bid
//!
//! # Rent the instance described in spotty.yaml, sync the project
//! vastctl start
//! # ^ Ctrl+C while waiting stops the half-created instance
//!
//! vastctl status
//! vastctl exec -- nvidia-smi
//! vastctl stop --shutdown-only
//! vastctl delete
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vast_orchestrator::{
    ApiCredentials, AutoConfirm, Confirmation, DEFAULT_CONFIG_FILE, InstanceConfig,
    InstanceManager, InteractiveConfirmation, KeyPair, OfferQuery, OfferQueryService,
    PricingMode, ProviderServices, StartOutcome, StdoutSink, VastClient, config::DEFAULT_SORT,
};

/// vastctl: rent and manage a Vast.ai GPU instance
#[derive(Parser)]
#[command(name = "vastctl")]
#[command(about = "Rent and manage a Vast.ai GPU instance", long_about = None)]
struct Cli {
    /// Project file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Instance name from the project file (default: the first one)
    #[arg(long, short = 'i', global = true)]
    instance: Option<String>,

    /// API key (default: read from ~/.vast_api_key)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// API base URL (default: $VAST_API_URL or https://console.vast.ai)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Answer yes to every confirmation
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Never prompt; decline every confirmation
    #[arg(long, global = true, conflicts_with = "yes")]
    no_input: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rent the instance, wait until it is ready and sync the project
    Start {
        /// Select an offer and show the request without renting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Destroy the instance (or only stop it)
    Stop {
        /// Stop the instance instead of destroying it
        #[arg(long)]
        shutdown_only: bool,
    },

    /// Destroy the instance
    Delete,

    /// Show the instance status and port mapping
    Status,

    /// Run a command on the instance over SSH
    Exec {
        /// Don't allocate a terminal
        #[arg(long)]
        no_tty: bool,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Sync the project directory to the instance
    Sync,

    /// Search the marketplace
    SearchOffers {
        /// Query, e.g. `num_gpus=1 gpu_name=RTX_3090 dph<0.5`
        query: Vec<String>,

        /// Pricing mode (on-demand, bid)
        #[arg(long = "type", default_value = "on-demand")]
        pricing: String,

        /// Sort keys, `-` suffix for descending
        #[arg(long, short = 'o', default_value = DEFAULT_SORT)]
        order: String,

        /// Storage in GB used to price the offers
        #[arg(long, default_value_t = 5.0)]
        storage: f64,

        /// Skip the default verified/rentable filters
        #[arg(long)]
        no_default: bool,

        /// Number of offers to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Save an API key to ~/.vast_api_key
    SetApiKey {
        /// API key from https://cloud.vast.ai/account/
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vastctl=info,vast_orchestrator=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::SetApiKey { key } => {
            let path = ApiCredentials::save(key)?;
            println!("API key saved to {}", path.display());
            Ok(())
        }

        Commands::SearchOffers {
            query,
            pricing,
            order,
            storage,
            no_default,
            limit,
        } => {
            let pricing = PricingMode::parse(pricing).ok_or_else(|| {
                anyhow::anyhow!("--type must be \"on-demand\" or \"bid\", got \"{}\"", pricing)
            })?;
            let client = VastClient::new(credentials(&cli)?)?;
            search_offers(
                &client,
                OfferQuery {
                    query: query.join(" "),
                    pricing,
                    order: order.clone(),
                    storage_gb: *storage,
                    no_default: *no_default,
                },
                *limit,
            )
            .await
        }

        Commands::Start { dry_run } => {
            let mut manager = build_manager(&cli)?;
            match manager.start(*dry_run).await? {
                StartOutcome::Started(instance) => {
                    info!(instance_id = instance.id, "✅ Instance is ready");
                    println!("{}", manager.status_text().await?);
                }
                StartOutcome::DryRun { .. } => info!("Dry run finished, nothing was rented"),
            }
            Ok(())
        }

        Commands::Stop { shutdown_only } => {
            build_manager(&cli)?.stop(*shutdown_only).await?;
            Ok(())
        }

        Commands::Delete => {
            let mut manager = build_manager(&cli)?;
            manager.delete().await?;
            manager.clean().await?;
            Ok(())
        }

        Commands::Status => {
            println!("{}", build_manager(&cli)?.status_text().await?);
            Ok(())
        }

        Commands::Exec { no_tty, command } => {
            let code = build_manager(&cli)?
                .exec(&command.join(" "), !*no_tty)
                .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }

        Commands::Sync => {
            build_manager(&cli)?.sync().await?;
            println!("Project synced.");
            Ok(())
        }
    }
}

fn credentials(cli: &Cli) -> anyhow::Result<ApiCredentials> {
    let creds = match &cli.api_key {
        Some(key) => ApiCredentials::from_key(key.clone(), cli.url.clone())?,
        None => ApiCredentials::load(cli.url.clone())?,
    };
    Ok(creds)
}

fn build_manager(cli: &Cli) -> anyhow::Result<InstanceManager> {
    let config = InstanceConfig::load(&cli.config, cli.instance.as_deref())
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    info!(instance = %config.name, project = %config.project.name, "Loaded project config");

    let client = VastClient::new(credentials(cli)?)?;

    let confirm: Arc<dyn Confirmation> = if cli.yes {
        Arc::new(AutoConfirm::yes())
    } else if cli.no_input {
        Arc::new(AutoConfirm::no())
    } else {
        Arc::new(InteractiveConfirmation)
    };

    // Ctrl+C interrupts readiness polling; the manager stops the instance
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupted, cleaning up...");
            signal.cancel();
        }
    });

    Ok(InstanceManager::new(
        config,
        ProviderServices::from_client(client),
        KeyPair::in_default_dir()?,
        confirm,
        Arc::new(StdoutSink),
    )
    .with_cancellation(cancel))
}

async fn search_offers(
    client: &VastClient,
    query: OfferQuery,
    limit: usize,
) -> anyhow::Result<()> {
    let offers = client.search_offers(&query).await?;
    if offers.is_empty() {
        println!("No offers found.");
        return Ok(());
    }

    println!(
        "{:>10}  {:>3}  {:<16}  {:>9}  {:>8}  {:>5}  {:>6}",
        "ID", "N", "GPU", "$/hour", "Disk GB", "Ports", "Rel."
    );
    for offer in offers.iter().take(limit) {
        println!(
            "{:>10}  {:>3}  {:<16}  {:>9.4}  {:>8.1}  {:>5}  {:>6}",
            offer.id,
            offer.num_gpus.unwrap_or(0),
            offer.gpu_name.as_deref().unwrap_or("-"),
            offer.price,
            offer.disk_space,
            offer.direct_port_count,
            offer
                .reliability
                .map(|r| format!("{:.3}", r))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    if offers.len() > limit {
        println!("... {} more", offers.len() - limit);
    }
    Ok(())
}
