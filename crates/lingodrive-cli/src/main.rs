//! lingodrive CLI
//!
//! Thin wrapper around lingodrive-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show configuration and module availability
//! lingodrive info
//!
//! # Connect to a drive and keep its mirror up to date
//! lingodrive connect <drive-key>
//!
//! # Translate through the drive's translations.json
//! lingodrive translate <drive-key> --from en --to es "Hello world"
//!
//! # Print one document from the drive
//! lingodrive read <drive-key> translations.json
//!
//! # Publish a directory as a drive
//! lingodrive serve ./words
//!
//! # Write a default config file
//! lingodrive config init
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lingodrive_core::logging::{filter_for_verbosity, LoggingBuilder};
use lingodrive_core::{
    BlobStore, Config, DataSourceKind, ModuleProbe, Orchestrator, Publisher, StatusEvent, Storage,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// lingodrive - replicated dictionary drives
#[derive(Parser)]
#[command(name = "lingodrive")]
#[command(version = "0.1.0")]
#[command(about = "lingodrive - replicated dictionary drives")]
#[command(
    long_about = "Connects to a peer-to-peer drive by its key, mirrors it into a local directory and translates text with the drive's translations.json. Falls back to a local directory when peer-to-peer networking is unavailable."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Base directory for state, mirror, fallback and logs (default: ~/.lingodrive)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/lingodrive/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Disable peer-to-peer networking and use the local fallback directory
    #[arg(long, global = true)]
    no_p2p: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and module availability
    Info,

    /// Connect to a drive and mirror it until Ctrl+C
    Connect {
        /// Drive key (hex)
        key: String,

        /// Exit after the first mirror pass
        #[arg(long)]
        once: bool,
    },

    /// Translate text with the drive's dictionary
    Translate {
        /// Drive key (hex)
        key: String,

        /// Source language code
        #[arg(short, long, default_value = "en")]
        from: String,

        /// Target language code
        #[arg(short, long, default_value = "es")]
        to: String,

        /// Text to translate
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Print one document from the drive
    Read {
        /// Drive key (hex)
        key: String,

        /// Path inside the drive
        path: String,
    },

    /// Publish a directory as a drive until Ctrl+C
    Serve {
        /// Directory to publish
        dir: PathBuf,

        /// Seconds between rescans of the directory
        #[arg(long, default_value_t = 5)]
        rescan_secs: u64,
    },

    /// Config file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbosity: u8, config: &Config) {
    let mut builder = LoggingBuilder::new(filter_for_verbosity(verbosity));
    if config.logging.jsonl {
        builder = builder.with_jsonl(&config.logging.logs_dir, &config.logging.instance);
    }
    if let Err(e) = builder.init() {
        eprintln!("Warning: logging not initialized: {}", e);
    }
}

/// Effective config: file (or defaults), then command-line overrides.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(base) = &cli.data_dir {
        let based = Config::with_base(base);
        config.data_dir = based.data_dir;
        config.snapshot_dir = based.snapshot_dir;
        config.fallback_dir = based.fallback_dir;
        config.logging.logs_dir = based.logging.logs_dir;
    }
    if cli.no_p2p {
        config.p2p.enabled = false;
    }
    Ok(config)
}

fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => Config::default_path().context("No config directory on this platform"),
    }
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = config_path(cli)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let config = match &cli.data_dir {
        Some(base) => Config::with_base(base),
        None => Config::default(),
    };
    config.save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Print status events until the channel closes.
fn print_status(mut events: broadcast::Receiver<StatusEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("[{}] {}", timestamp(), event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    println!("[{}] ({} status events skipped)", timestamp(), skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Connect quietly, for one-shot commands.
/// Connect, stopping early on Ctrl+C.
///
/// On failure or interrupt the orchestrator is shut down before returning.
async fn connect_interruptible(orchestrator: &Orchestrator, key: &str) -> Result<DataSourceKind> {
    let connect = orchestrator.connect(key);
    tokio::pin!(connect);

    let finished = tokio::select! {
        result = &mut connect => Some(result),
        Ok(()) = tokio::signal::ctrl_c() => None,
    };
    match finished {
        Some(Ok(kind)) => Ok(kind),
        Some(Err(e)) => {
            orchestrator.shutdown().await;
            Err(e.into())
        }
        None => {
            warn!("Interrupted while connecting");
            // Shutdown abandons the connect, which then releases what it opened.
            let _ = tokio::join!(connect, orchestrator.shutdown());
            anyhow::bail!("Interrupted while connecting")
        }
    }
}

async fn connect_quiet(config: Config, key: &str) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::new(config);
    let kind = connect_interruptible(&orchestrator, key).await?;
    info!(source = %kind, "Connected");
    Ok(orchestrator)
}

fn print_endpoint_id(state_db: &Path) {
    if !state_db.exists() {
        println!("  Endpoint ID: (created on first connect)");
        return;
    }
    let secret = Storage::new(state_db).and_then(|storage| storage.load_endpoint_secret_key());
    match secret {
        Ok(Some(bytes)) => {
            let id = iroh::SecretKey::from(bytes).public();
            println!("  Endpoint ID: {}", hex::encode(id.as_bytes()));
        }
        Ok(None) => println!("  Endpoint ID: (created on first connect)"),
        Err(e) => println!("  Endpoint ID: (unavailable: {})", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init writes a file that may not exist yet, so it runs before loading.
    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return init_config(&cli, *force);
    }

    let config = resolve_config(&cli)?;
    setup_logging(cli.verbose, &config);

    match cli.command {
        Commands::Info => {
            println!("lingodrive v0.1.0");
            println!();
            println!("Directories:");
            println!("  Data directory: {}", config.data_dir.display());
            println!("  Mirror root: {}", config.snapshot_dir.display());
            println!("  Fallback directory: {}", config.fallback_dir.display());
            println!();
            println!("Node:");
            print_endpoint_id(&config.state_db_path());
            println!();

            let probe = ModuleProbe::standard(config.p2p.enabled, config.blob_dir());
            println!("Peer-to-peer:");
            println!("  Enabled: {}", config.p2p.enabled);
            println!("  Modules: {}", probe.probe());
            for failure in probe.failures() {
                println!("    - {}", failure);
            }
            println!("  Serve replicated drives: {}", config.p2p.serve);
            println!("  Bootstrap peers: {}", config.p2p.bootstrap_peers.len());
        }

        Commands::Connect { key, once } => {
            let fallback_dir = config.fallback_dir.clone();
            let orchestrator = Orchestrator::new(config);
            let printer = print_status(orchestrator.subscribe_status());

            let kind = match connect_interruptible(&orchestrator, &key).await {
                Ok(kind) => kind,
                Err(e) => {
                    printer.abort();
                    return Err(e);
                }
            };

            match kind {
                DataSourceKind::PeerToPeer => {
                    if let Some(session) = orchestrator.session() {
                        println!(
                            "Connected to drive {} (version {})",
                            session.key().short(),
                            session.version().unwrap_or(0)
                        );
                        println!(
                            "Mirror: {}",
                            orchestrator.config().mirror_dir(session.key()).display()
                        );
                    }
                }
                DataSourceKind::LocalFallback => {
                    println!("Peer-to-peer unavailable, reading {}", fallback_dir.display());
                }
            }

            if !once {
                println!();
                println!("Press Ctrl+C to stop.");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                println!();
                println!("Shutting down...");
            }

            orchestrator.wait_mirror_idle().await;
            orchestrator.shutdown().await;
            // Let the printer drain the final events.
            tokio::time::sleep(Duration::from_millis(50)).await;
            printer.abort();
        }

        Commands::Translate {
            key,
            from,
            to,
            text,
        } => {
            let orchestrator = connect_quiet(config, &key).await?;
            let result = orchestrator.translate(&text.join(" "), &from, &to).await;
            orchestrator.shutdown().await;
            println!("{}", result?);
        }

        Commands::Read { key, path } => {
            let orchestrator = connect_quiet(config, &key).await?;
            let result = orchestrator.read(&path).await;
            orchestrator.shutdown().await;

            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&result?)?;
            stdout.flush()?;
        }

        Commands::Serve { dir, rescan_secs } => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("Cannot publish {}", dir.display()))?;
            std::fs::create_dir_all(&config.data_dir)?;
            let storage = Storage::new(config.state_db_path())?;
            let blobs = BlobStore::new_persistent(&config.blob_dir()).await?;

            let publisher =
                Publisher::start(&dir, blobs, storage, config.p2p.bootstrap_ids()?).await?;

            println!("Publishing {}", dir.display());
            println!();
            println!("Drive key: {}", publisher.key());
            println!("Version: {}", publisher.version());
            println!();
            println!("Readers connect with:");
            println!("  lingodrive connect {}", publisher.key());
            println!();
            println!("Press Ctrl+C to stop.");

            let mut rescan = tokio::time::interval(Duration::from_secs(rescan_secs.max(1)));
            rescan.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = rescan.tick() => {
                        match publisher.rescan().await {
                            Ok(Some(version)) => {
                                println!("[{}] published version {}", timestamp(), version);
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Rescan failed"),
                        }
                    }
                }
            }

            publisher.shutdown().await;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            // Handled before the config is loaded.
            ConfigAction::Init { .. } => {}
        },
    }

    Ok(())
}
