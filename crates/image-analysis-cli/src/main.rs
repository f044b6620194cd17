use anyhow::Context;
use clap::{Parser, Subcommand};
use image_analysis_core::logging::{init_logger, level_from_env};
use image_analysis_core::persistence::open_store;
use image_analysis_core::export::export_to_file;
use image_analysis_core::{
    catalog, AnalysisRecord, Config, ExportFormat, ImageIdentity, Orchestrator, StoreBackend,
};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "image-analysis")]
#[command(about = "Incrementally analyze image directories with CLIP and LLM services")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every image below a directory, skipping work already done
    Process {
        /// Directory to scan for images
        #[arg(short, long)]
        input: PathBuf,

        /// Where records and summaries are written
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// SQLite database file (sqlite backend)
        #[arg(long)]
        database: Option<PathBuf>,

        /// Record store backend: json or sqlite
        #[arg(long)]
        backend: Option<String>,

        /// Re-run every task regardless of stored results
        #[arg(long)]
        force: bool,

        /// Process files on a worker pool
        #[arg(long)]
        parallel: bool,

        /// Number of worker threads (0 = auto)
        #[arg(long)]
        threads: Option<usize>,

        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the analysis tasks in execution order
    Catalog,

    /// Browse stored analysis records
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Path to save configuration file
        #[arg(default_value = "image-analysis.json")]
        path: PathBuf,
    },

    /// Check a configuration file and the task catalog it produces
    ValidateConfig,
}

#[derive(Subcommand)]
enum RecordsAction {
    /// One line per stored record
    List,

    /// Print a full record as JSON
    Show { identity: String },

    /// Delete a record so its image is analyzed again
    Remove { identity: String },

    /// Write every stored record to a file
    Export {
        /// Output format: json or csv
        #[arg(short, long, default_value = "json")]
        format: String,

        /// File to write
        path: PathBuf,
    },
}

fn main() -> Result<(), anyhow::Error> {
    // API keys and the CLIP password may live in a .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    // Set log level based on verbosity
    config.log_level = match cli.verbose {
        0 => config.log_level,
        1 => image_analysis_core::config::LogLevel::Debug,
        _ => image_analysis_core::config::LogLevel::Trace,
    };
    init_logging(&config)?;

    match cli.command {
        Commands::Process {
            input,
            output,
            database,
            backend,
            force,
            parallel,
            threads,
            quiet,
        } => {
            // Override config with command line arguments
            if let Some(output) = output {
                config.store.output_directory = output;
            }
            if let Some(database) = database {
                config.store.database_path = database;
            }
            if let Some(backend) = backend {
                config.store.backend = backend.parse::<StoreBackend>()?;
            }
            if parallel {
                config.processing.parallel = true;
            }
            if let Some(threads) = threads {
                config.processing.threads = threads;
            }

            let orchestrator = Orchestrator::from_config(config)?.with_progress(!quiet);

            let shutdown = orchestrator.shutdown_handle();
            ctrlc::set_handler(move || {
                if !shutdown.swap(true, Ordering::SeqCst) {
                    eprintln!("Interrupt received, finishing in-flight files...");
                }
            })
            .context("Failed to install Ctrl-C handler")?;

            info!("Starting image analysis of {}", input.display());
            let summary = orchestrator.run(&input, force)?;

            println!("{}", summary);
            for failure in &summary.failures {
                println!("  FAILED {}: {}", failure.path.display(), failure.message);
            }
            Ok(())
        }

        Commands::Catalog => {
            let catalog = catalog(&config)?;
            for key in catalog.iter() {
                println!("{}", key);
            }
            Ok(())
        }

        Commands::Records { action } => {
            let store = open_store(&config)?;
            match action {
                RecordsAction::List => {
                    for record in with_current_status(store.list()?, &config) {
                        println!(
                            "{}  {:<8}  {}/{}",
                            record.identity().short(),
                            record.processing_status(),
                            record.file_info.directory,
                            record.file_info.filename
                        );
                    }
                }
                RecordsAction::Show { identity } => {
                    let identity = ImageIdentity::from_hex(identity);
                    match store.load(&identity)? {
                        Some(record) => {
                            let record = with_current_status(vec![record], &config);
                            println!("{}", serde_json::to_string_pretty(&record[0])?)
                        }
                        None => anyhow::bail!("No record for identity {}", identity),
                    }
                }
                RecordsAction::Remove { identity } => {
                    let identity = ImageIdentity::from_hex(identity);
                    if store.remove(&identity)? {
                        println!("Removed record {}", identity);
                    } else {
                        warn!("No record for identity {}", identity);
                        println!("No record for identity {}", identity);
                    }
                }
                RecordsAction::Export { format, path } => {
                    let format = format.parse::<ExportFormat>()?;
                    let records = with_current_status(store.list()?, &config);
                    export_to_file(&records, format, &path)
                        .with_context(|| format!("Failed to export to {}", path.display()))?;
                    println!("Exported {} records to {}", records.len(), path.display());
                }
            }
            Ok(())
        }

        Commands::GenerateConfig { path } => {
            let config = Config::default();
            config.save_to_file(&path)?;
            println!("Configuration file generated at: {}", path.display());
            Ok(())
        }

        Commands::ValidateConfig => {
            config.validate()?;
            let catalog = catalog(&config)?;
            println!("Configuration is valid ({} tasks per image)", catalog.len());
            Ok(())
        }
    }
}

/// Judge status against the configured catalog when it is valid
fn with_current_status(mut records: Vec<AnalysisRecord>, config: &Config) -> Vec<AnalysisRecord> {
    match catalog(config) {
        Ok(current) => {
            for record in &mut records {
                record.refresh_status(&current);
            }
        }
        Err(e) => warn!("Showing stored results without a catalog: {}", e),
    }
    records
}

/// Explicit path, else the platform default if present, else built-in defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    match Config::default_path().filter(|p| p.exists()) {
        Some(default) => Config::from_file(&default)
            .with_context(|| format!("Failed to load config {}", default.display())),
        None => Ok(Config::default()),
    }
}

/// Rotating file log when a log directory is configured, console otherwise
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = config.log_level.to_level_filter();

    if let Some(log_dir) = &config.log_dir {
        init_logger(log_dir, level, true).context("Failed to initialize logging")?;
    } else {
        env_logger::Builder::new()
            .filter_level(level_from_env().unwrap_or(level))
            .init();
    }
    Ok(())
}
