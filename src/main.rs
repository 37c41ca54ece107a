use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use coliq::{
    app::Application,
    auth::AuthenticationDb,
    commands::CreateNewPlan,
    config::{ConfigUpdate, load_or_default},
    db::Db,
    domain::{ProfitStrategy, WalletSecurity},
    logging, projection, server,
};

#[derive(Parser)]
#[command(author, version, about = "Matchmaking API server for co-owned liquidity positions")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.coliq/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP APIs
    Serve(ServeArgs),
    /// Register a new plan
    AddPlan(AddPlanArgs),
    /// Reset all projections so they rebuild on the next run
    ResetProjections(ResetProjectionsArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Override the configured port
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Override the configured database path
    #[arg(long, short = 'd')]
    db: Option<PathBuf>,
}

#[derive(Args)]
struct AddPlanArgs {
    /// Comma separated pair of assets (e.g. THOR.RUNE,BTC.BTC)
    #[arg(long, short = 'a')]
    assets: String,

    /// Security model of the shared wallet
    #[arg(long, short = 's', default_value = "2-2")]
    security: String,

    /// Profit sharing strategy
    #[arg(long, short = 't', default_value = "equal_share")]
    strategy: String,

    /// Value of each share measured in $
    #[arg(long, short = 'q', default_value_t = 100)]
    quantum: u32,

    /// Tolerated loss ratio
    #[arg(long = "loss-limit", short = 'l', default_value_t = 0.1)]
    loss_limit: f64,

    /// Investing period in weeks
    #[arg(long = "investing-period", short = 'i', default_value_t = 1)]
    investing_period: u32,

    /// Override the configured database path
    #[arg(long, short = 'd')]
    db: Option<PathBuf>,
}

#[derive(Args)]
struct ResetProjectionsArgs {
    /// Override the configured database path
    #[arg(long, short = 'd')]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve_command(cli.config, args).await?,
        Commands::AddPlan(args) => add_plan_command(cli.config, args).await?,
        Commands::ResetProjections(args) => reset_projections_command(cli.config, args)?,
    }

    Ok(())
}

async fn serve_command(config_path: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: args.port,
        db_path: args.db,
    });
    config.save(&path)?;

    let db = Db::open(&config.db_path)?;
    let mut app = Application::new(db)?;
    app.start_projections();

    server::run(Arc::new(app), Arc::new(AuthenticationDb::new()), config.port).await?;
    Ok(())
}

async fn add_plan_command(config_path: Option<PathBuf>, args: AddPlanArgs) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: None,
        db_path: args.db,
    });

    let security = WalletSecurity::parse(&args.security)
        .ok_or_else(|| anyhow!("unsupported security model: {}", args.security))?;
    let strategy = ProfitStrategy::parse(&args.strategy)
        .ok_or_else(|| anyhow!("unsupported strategy: {}", args.strategy))?;

    let db = Db::open(&config.db_path)?;
    let app = Application::new(db)?;
    let id = app
        .commands
        .create_new_plan
        .handle(CreateNewPlan {
            assets: args.assets.split(',').map(str::to_string).collect(),
            security,
            strategy,
            quantum: args.quantum,
            loss_protection: args.loss_limit,
            investing_period: args.investing_period,
        })
        .await?;

    info!(id = %id, "new plan created");
    Ok(())
}

fn reset_projections_command(
    config_path: Option<PathBuf>,
    args: ResetProjectionsArgs,
) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: None,
        db_path: args.db,
    });

    let db = Db::open(&config.db_path)?;
    projection::reset_all(&db)?;

    info!("projections reset");
    Ok(())
}
