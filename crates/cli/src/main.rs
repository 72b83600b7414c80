mod config;
mod serve;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::Config;
use crate::telemetry::LogFormat;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Terraform remote state backend with dependency tracking.
#[derive(Parser)]
#[command(
    name = "stategraph",
    version,
    about = "Terraform remote state backend with dependency tracking"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Log format on stderr (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    log_format: LogFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Path to the TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
        /// SQLite database path, or :memory: (overrides database.path)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Load and validate the config, then print the effective settings
    CheckConfig {
        /// Path to the TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create or upgrade the database schema and exit
    InitDb {
        /// Path to the TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// SQLite database path (overrides database.path)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match cli.command {
        Commands::Serve { config, port, db } => {
            let config = load_config(config.as_deref(), port, db);
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to start tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref(), None, None);
            cmd_check_config(&config, cli.output);
        }
        Commands::InitDb { config, db } => {
            let config = load_config(config.as_deref(), None, db);
            cmd_init_db(&config, cli.output, cli.quiet);
        }
    }
}

/// Load the config file and apply command-line overrides, exiting on error.
fn load_config(path: Option<&Path>, port: Option<u16>, db: Option<PathBuf>) -> Config {
    let loaded = Config::load(path).and_then(|mut config| {
        if let Some(port) = port {
            config.server.port = port;
        }
        if let Some(db) = db {
            config.database.path = db;
        }
        config.validate()?;
        Ok(config)
    });
    match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_check_config(config: &Config, output: OutputFormat) {
    let rendered = match output {
        OutputFormat::Json => serde_json::to_string_pretty(config).map_err(|e| e.to_string()),
        OutputFormat::Text => toml::to_string(config).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => {
            eprintln!("error: failed to render config: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_init_db(config: &Config, output: OutputFormat, quiet: bool) {
    if let Err(e) = serve::open_store(config) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
    match output {
        OutputFormat::Json => {
            let result = serde_json::json!({
                "database": config.database.path.display().to_string(),
                "status": "ok",
            });
            println!("{}", result);
        }
        OutputFormat::Text => {
            if !quiet {
                println!("database ready: {}", config.database.path.display());
            }
        }
    }
}
