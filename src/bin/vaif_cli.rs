use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use vaif_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::{self, AppConfig},
    db,
    events,
    handlers::{AppServices, Collaborators},
    services::estimates::{Estimate, EstimateCalculator, EstimateCatalog, EstimateInput},
};

/// Operator tooling for the VAIF back office.
#[derive(Parser)]
#[command(name = "vaif-cli", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Price a project against the estimate catalog
    Estimate(EstimateArgs),
    /// Check an estimate catalog file and print its contents
    Catalog {
        /// Catalog JSON; the built-in catalog when absent
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Move every overdue sent/viewed quote to expired
    ExpireQuotes,
    /// Mint a bearer token for local testing
    Token(TokenArgs),
}

#[derive(Args)]
struct EstimateArgs {
    #[arg(long)]
    project_type: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    industry: Option<String>,
    #[arg(long)]
    timeline: Option<String>,
    /// Feature code; repeat for several
    #[arg(long = "feature")]
    features: Vec<String>,
    /// Technology code; repeat for several
    #[arg(long = "technology")]
    technologies: Vec<String>,
    /// Catalog JSON; the configured catalog when absent
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Args)]
struct TokenArgs {
    /// Subject; a fresh id when absent
    #[arg(long)]
    user_id: Option<Uuid>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    admin: bool,
}

#[derive(Serialize)]
struct IssuedToken {
    user_id: Uuid,
    roles: Vec<String>,
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Estimate(args) => handle_estimate(args, cli.json).await,
        Commands::Catalog { path } => handle_catalog(path, cli.json),
        Commands::ExpireQuotes => handle_expire(cli.json).await,
        Commands::Token(args) => handle_token(args, cli.json),
    }
}

fn load_settings() -> Result<AppConfig> {
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json, config.otel_enabled);
    Ok(config)
}

fn load_catalog(path: Option<PathBuf>) -> Result<EstimateCatalog> {
    let catalog = match path {
        Some(path) => EstimateCatalog::from_file(&path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?,
        None => EstimateCatalog::default(),
    };
    catalog.check().context("catalog is invalid")?;
    Ok(catalog)
}

async fn handle_estimate(args: EstimateArgs, json: bool) -> Result<()> {
    let catalog = load_catalog(args.catalog)?;
    let calculator = EstimateCalculator::new(Arc::new(catalog), None);
    let input = EstimateInput {
        project_type: args.project_type,
        category: args.category,
        industry: args.industry,
        features: args.features,
        technologies: args.technologies,
        timeline: args.timeline,
        description: None,
    };
    let estimate = calculator
        .calculate(&input)
        .context("failed to price the selections")?;

    if json {
        print_json(&estimate)
    } else {
        render_estimate(&estimate);
        Ok(())
    }
}

fn handle_catalog(path: Option<PathBuf>, json: bool) -> Result<()> {
    let catalog = load_catalog(path)?;
    if json {
        return print_json(&catalog);
    }
    println!("Project types:");
    for option in &catalog.project_types {
        println!("- {} ({}) • {}", option.name, option.code, option.price);
    }
    println!("Features:");
    for option in &catalog.features {
        println!("- {} ({}) • {}", option.name, option.code, option.price);
    }
    println!("Technologies:");
    for option in &catalog.technologies {
        println!("- {} ({}) • {}", option.name, option.code, option.price);
    }
    Ok(())
}

async fn handle_expire(json: bool) -> Result<()> {
    let config = load_settings()?;
    let db_pool = db::establish_connection_from_app_config(&config)
        .await
        .context("failed to connect to database")?;
    let (event_sender, event_rx) = events::channel(config.event_channel_capacity);
    tokio::spawn(events::process_events(event_rx));

    let collaborators = Collaborators::from_config(&config)?;
    let services = AppServices::new(
        Arc::new(db_pool),
        Arc::new(event_sender),
        &config,
        collaborators,
    );
    let expired = services
        .quotes
        .expire_overdue(Utc::now())
        .await
        .context("expiry sweep failed")?;

    if json {
        print_json(&serde_json::json!({ "expired": expired }))
    } else {
        println!("Expired {} quote(s)", expired);
        Ok(())
    }
}

fn handle_token(args: TokenArgs, json: bool) -> Result<()> {
    let config = load_settings()?;
    let auth = AuthService::new(AuthConfig::from(&config));
    let user_id = args.user_id.unwrap_or_else(Uuid::new_v4);
    let roles = if args.admin {
        vec![ADMIN_ROLE.to_string()]
    } else {
        Vec::new()
    };
    let token = auth
        .issue_token(user_id, args.email, roles.clone())
        .context("failed to issue token")?;

    let issued = IssuedToken {
        user_id,
        roles,
        token,
    };
    if json {
        print_json(&issued)
    } else {
        println!("{}", issued.token);
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_estimate(estimate: &Estimate) {
    println!(
        "{} • {} complexity • {} {} (range {} – {})",
        estimate.project_type.name,
        estimate.complexity,
        estimate.base_estimate,
        estimate.currency,
        estimate.min_estimate,
        estimate.max_estimate
    );
    for feature in &estimate.breakdown.features {
        println!("  + {} {}", feature.name, feature.price);
    }
    for technology in &estimate.breakdown.technologies {
        println!("  + {} {}", technology.name, technology.price);
    }
}
