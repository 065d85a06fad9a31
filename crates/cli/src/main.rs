mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tern_core::{init_logging, AppConfigTrait, DatabaseSettings, LoggingConfig, MigratorConfig};
use tern_orm::MigrationDirection;

use commands::migrate;

#[derive(Parser, Debug)]
#[command(name = "tern")]
#[command(version)]
#[command(about = "Apply or revert PostgreSQL migrations recorded in a content-addressed ledger")]
struct Cli {
    /// `down` reverts applied migrations; anything else applies pending ones
    direction: Option<String>,

    /// Migration directory (overrides MIGRATIONS_DIR)
    #[arg(long, value_name = "PATH")]
    dir: Option<PathBuf>,

    /// Migrations to run at the same time (overrides MIGRATION_CONCURRENCY)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Print the plan without executing it
    #[arg(long)]
    dry_run: bool,

    /// Print the run result as JSON
    #[arg(long)]
    json: bool,

    /// Connection URL (overrides DATABASE_URL and POSTGRES_*)
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,
}

impl Cli {
    fn direction(&self) -> MigrationDirection {
        MigrationDirection::from_arg(self.direction.as_deref())
    }

    /// Command line flags win over the environment
    fn apply_overrides(&self, mut config: MigratorConfig) -> MigratorConfig {
        if let Some(dir) = &self.dir {
            config.migrations_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(url) = &self.database_url {
            config.database = Some(DatabaseSettings::Url(url.clone()));
        }
        config
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MigratorConfig> {
    let config = cli.apply_overrides(MigratorConfig::from_env()?);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(LoggingConfig::from_config(&config).with_service("tern")) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match migrate::run(&config, cli.direction(), cli.dry_run).await {
        Ok(result) => {
            if cli.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        tracing::error!("Failed to serialize run result: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", migrate::summary(&result));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
