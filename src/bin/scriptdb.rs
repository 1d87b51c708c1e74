//! Command-line front-end over a JSON file backed script store.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use scriptdb::{Config, HttpFetcher, JsonFileBackend, ScriptSource, ScriptStore, init_tracing};

#[derive(Parser)]
#[command(name = "scriptdb")]
#[command(about = "Manage a local userscript database")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, env = "SCRIPTDB_CONFIG")]
    config: Option<PathBuf>,

    /// Data file, overrides the configured one
    #[arg(long)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install or update a script from a file
    Install {
        file: PathBuf,
        /// URL the script came from, used to resolve relative dependencies
        #[arg(long)]
        url: Option<String>,
        /// Fail when a script with the same name and namespace exists
        #[arg(long)]
        new: bool,
    },
    /// List installed scripts
    List {
        /// Include scripts marked for removal
        #[arg(long)]
        all: bool,
    },
    /// Mark a script for removal
    Remove { id: u64 },
    /// Bring back a script marked for removal
    Restore { id: u64 },
    /// Delete a script right away
    Purge { id: u64 },
    /// Move a script up (negative) or down in the execution order
    Move {
        id: u64,
        #[arg(allow_hyphen_values = true)]
        offset: i64,
    },
    /// Delete orphaned blobs and refetch missing dependencies
    Vacuum,
    /// Show the scripts that would run on a page
    Inject {
        url: String,
        /// Treat the page as a sub-frame
        #[arg(long)]
        frame: bool,
    },
    /// Purge scripts whose removal grace period has ended
    CheckRemove {
        /// Purge every script marked for removal
        #[arg(long)]
        force: bool,
    },
    /// Show storage used per script
    Sizes,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data) = cli.data {
        config.data_file = data;
    }
    if let Err(e) = init_tracing(&config.log) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let backend = JsonFileBackend::open(&config.data_file)
        .await
        .with_context(|| format!("Failed to open {}", config.data_file.display()))?;
    let fetcher = HttpFetcher::new(&config.fetch).context("Failed to build HTTP client")?;
    let store = ScriptStore::builder(Arc::new(backend), Arc::new(fetcher))
        .config(config)
        .open()
        .await
        .context("Failed to load scripts")?;

    match cli.command {
        Commands::Install { file, url, new } => {
            let code = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let outcome = store
                .install(ScriptSource {
                    code,
                    url,
                    is_new: new,
                    ..Default::default()
                })
                .await?;
            println!("#{} {}: {}", outcome.script.id(), outcome.script.display_name(), outcome.message);
            if let Some(error) = outcome.error {
                eprintln!("{}", error);
            }
        }
        Commands::List { all } => {
            for script in store.list(!all)? {
                println!(
                    "{:>4} #{:<4} {}{}{}",
                    script.props.position,
                    script.id(),
                    script.display_name(),
                    script.meta.version.as_deref().map(|v| format!(" {}", v)).unwrap_or_default(),
                    match (script.config.removed, script.config.enabled) {
                        (true, _) => " (removed)",
                        (false, false) => " (disabled)",
                        _ => "",
                    }
                );
            }
        }
        Commands::Remove { id } => {
            if !store.remove(id).await? {
                bail!("Script not found: #{}", id);
            }
        }
        Commands::Restore { id } => {
            store.mark_removed(id, false).await?;
        }
        Commands::Purge { id } => {
            if !store.purge(id).await? {
                bail!("Script not found: #{}", id);
            }
        }
        Commands::Move { id, offset } => {
            let changed = store.move_script(id, offset).await?;
            println!("{} scripts renumbered", changed);
        }
        Commands::Vacuum => print_json(&store.vacuum().await)?,
        Commands::Inject { url, frame } => {
            let env = store.scripts_for_url(&url, !frame).await?;
            print_json(&env.start)?;
            if let Some(deferred) = env.deferred {
                print_json(&deferred.wait().await?)?;
            }
            if !env.disabled_ids.is_empty() {
                println!("Disabled: {:?}", env.disabled_ids);
            }
        }
        Commands::CheckRemove { force } => {
            println!("{} scripts purged", store.check_remove(force).await?);
        }
        Commands::Sizes => print_json(&store.sizes(None).await?)?,
    }
    Ok(())
}
