use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use vaif_api::db::{close_pool, establish_connection_with_config, DbConfig};
use vaif_api::migrator::Migrator;

/// Applies or rolls back the VAIF schema against `DATABASE_URL`.
#[derive(Parser)]
#[command(name = "migration", version)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://vaif.db?mode=rwc")]
    database_url: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Up,
    /// Roll back the last `steps` migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// List migrations that have not been applied
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let db = establish_connection_with_config(&DbConfig {
        url: cli.database_url,
        max_connections: 1,
        ..Default::default()
    })
    .await?;

    match cli.command.unwrap_or(Command::Up) {
        Command::Up => {
            Migrator::up(&db, None).await?;
            info!("Migration completed successfully");
        }
        Command::Down { steps } => {
            Migrator::down(&db, Some(steps)).await?;
            info!(steps, "Rollback completed successfully");
        }
        Command::Status => {
            let pending = Migrator::get_pending_migrations(&db).await?;
            if pending.is_empty() {
                info!("Schema is up to date");
            }
            for migration in pending {
                info!("pending: {}", migration.name());
            }
        }
    }

    close_pool(db).await?;
    Ok(())
}
