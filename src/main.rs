//! answerbank CLI entry point

use answerbank::{
    commands::{
        cmd_cleanup, cmd_init, cmd_migrate, cmd_query, cmd_status, cmd_validate, cmd_versions,
        print_cleanup_stats, print_init, print_integrity, print_migrate_outcome,
        print_query_results, print_status, print_versions, InitOptions, MigrateOptions,
        QueryOptions,
    },
    config::{BackendKind, Config},
    embed::create_embedder,
    error::{Error, Result},
    progress::{LogWriterFactory, PipelineProgress},
    store::{Storage, StorageBackend},
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status when an integrity check finds problems
const EXIT_INVALID: i32 = 2;

#[derive(Parser)]
#[command(name = "answerbank")]
#[command(version, about = "Versioned embedding storage and retrieval for support knowledge bases", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "ANSWERBANK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the storage schema
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,

        /// Storage backend to configure (embedded or networked)
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Embed new and changed entries, migrating when the model changed
    Migrate {
        /// Storage backend for this run only
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Entries per provider call
        #[arg(long)]
        batch_size: Option<usize>,

        /// Re-embed entries whose content is unchanged
        #[arg(long)]
        force: bool,

        /// Run an integrity check after committing
        #[arg(long)]
        validate: bool,

        /// Print the change set without calling the provider or writing
        #[arg(long)]
        dry_run: bool,

        /// Knowledge-base file (overrides source.path)
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Check every stored vector against its version
    Validate,

    /// Show storage and version status
    Status,

    /// List embedding versions with record counts
    Versions,

    /// Delete retired embedding versions and their records
    Cleanup {
        /// Actually delete; without this only a preview is printed
        #[arg(long)]
        yes: bool,
    },

    /// Search one category of the knowledge base
    Query {
        /// The search text
        query: String,

        /// Category to search within
        #[arg(long)]
        category: String,

        /// Narrow to one subcategory
        #[arg(long)]
        subcategory: Option<String>,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json_layer = cli
        .log_json
        .then(|| fmt::layer().json().with_writer(LogWriterFactory));
    let text_layer = (!cli.log_json).then(|| fmt::layer().with_writer(LogWriterFactory));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();

    // Commands that don't need an existing config
    match cli.command {
        Commands::Init { force, backend } => {
            let (base_dir, config_path) = init_paths(cli.config.as_deref());
            let config = cmd_init(InitOptions {
                base_dir,
                config_path,
                backend,
                force,
            })
            .await?;
            if cli.json {
                emit_json(&config)?;
            } else {
                print_init(&config);
            }
            return Ok(0);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "answerbank", &mut std::io::stdout());
            return Ok(0);
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Migrate {
            backend,
            batch_size,
            force,
            validate,
            dry_run,
            source,
        } => {
            let embedder = create_embedder(&config.embedding)?;
            let progress = if cli.json {
                PipelineProgress::hidden()
            } else {
                PipelineProgress::visible()
            };
            let options = MigrateOptions {
                backend,
                batch_size,
                source,
                force,
                validate,
                dry_run,
            };
            let outcome = cmd_migrate(&config, embedder.as_ref(), options, &progress).await?;
            if cli.json {
                emit_json(&outcome)?;
            } else {
                print_migrate_outcome(&outcome);
            }
            if outcome.failed_validation() {
                return Ok(EXIT_INVALID);
            }
        }

        Commands::Validate => {
            let storage = Storage::open(&config).await?;
            let report = cmd_validate(&storage).await;
            storage.close().await;
            let report = report?;
            if cli.json {
                emit_json(&report)?;
            } else {
                print_integrity(&report);
            }
            if !report.valid {
                return Ok(EXIT_INVALID);
            }
        }

        Commands::Status => {
            let storage = Storage::open(&config).await?;
            let status = cmd_status(&config, &storage).await;
            storage.close().await;
            let status = status?;
            if cli.json {
                emit_json(&status)?;
            } else {
                print_status(&status);
            }
        }

        Commands::Versions => {
            let storage = Storage::open(&config).await?;
            let versions = cmd_versions(&storage).await;
            storage.close().await;
            let versions = versions?;
            if cli.json {
                emit_json(&versions)?;
            } else {
                print_versions(&versions);
            }
        }

        Commands::Cleanup { yes } => {
            let storage = Storage::open(&config).await?;
            let stats = cmd_cleanup(&storage, yes).await;
            storage.close().await;
            let stats = stats?;
            if cli.json {
                emit_json(&stats)?;
            } else {
                print_cleanup_stats(&stats);
            }
        }

        Commands::Query {
            query,
            category,
            subcategory,
            top_k,
        } => {
            let embedder = create_embedder(&config.embedding)?;
            let storage = Storage::open(&config).await?;
            let options = QueryOptions {
                category,
                subcategory,
                top_k,
            };
            let result = cmd_query(&config, &storage, embedder.as_ref(), &query, options).await;
            storage.close().await;
            let result = result?;
            if cli.json {
                emit_json(&result)?;
            } else {
                print_query_results(&result);
            }
        }
    }

    Ok(0)
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Base directory and config file for `init`.
///
/// A `.toml` path is used as the config file itself; any other path is a directory.
fn init_paths(path: Option<&Path>) -> (PathBuf, PathBuf) {
    match path {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            (base, path.to_path_buf())
        }
        Some(dir) => (dir.to_path_buf(), dir.join("config.toml")),
        None => {
            let base = Config::default_base_dir();
            let config = base.join("config.toml");
            (base, config)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        return Err(Error::NotInitialized);
    }

    Config::load(&config_path)
}
