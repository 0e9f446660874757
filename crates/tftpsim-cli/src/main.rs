//! tftpsim CLI
//!
//! Trivial file transfer client, server and fault-injecting relay

mod commands;
mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tftpsim_core::{Client, Fanout, Server, SharedSink, TracingSink};
use tftpsim_faults::Relay;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use commands::{RELAY_HELP, RelayCommand, SERVER_HELP, ServerCommand};
use config::Config;
use progress::{TransferProgress, format_bytes};

/// tftpsim - file transfer over UDP with fault injection
#[derive(Parser)]
#[command(name = "tftpsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a file from a server
    Read {
        /// File name on the server
        #[arg(required = true)]
        remote: String,

        /// Local path (defaults to the remote file name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Send the request to the configured relay instead of the server
        #[arg(long)]
        via_relay: bool,
    },

    /// Store a local file on a server
    Write {
        /// Local file to send
        #[arg(required = true)]
        local: PathBuf,

        /// File name on the server (defaults to the local file name)
        #[arg(short, long)]
        remote_name: Option<String>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Send the request to the configured relay instead of the server
        #[arg(long)]
        via_relay: bool,
    },

    /// Serve files from a directory
    Server {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Directory to serve
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Relay transfers to a server, injecting one fault per session
    Relay {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Server address
        #[arg(short, long)]
        server: Option<String>,

        /// Fault, e.g. drop:3, delay:2:500, duplicate:1:100,
        /// change-opcode:4:9 or wrong-sender:2
        #[arg(short, long)]
        fault: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Read {
            remote,
            output,
            server,
            via_relay,
        } => {
            read_file(&remote, output, server.as_deref(), via_relay, &config).await?;
        }
        Commands::Write {
            local,
            remote_name,
            server,
            via_relay,
        } => {
            write_file(&local, remote_name, server.as_deref(), via_relay, &config).await?;
        }
        Commands::Server { bind, dir } => {
            run_server(bind.as_deref(), dir.as_deref(), &config).await?;
        }
        Commands::Relay {
            bind,
            server,
            fault,
        } => {
            run_relay(bind.as_deref(), server.as_deref(), fault.as_deref(), &config).await?;
        }
    }

    Ok(())
}

fn client_sink(progress: Arc<TransferProgress>) -> SharedSink {
    let progress: SharedSink = progress;
    Arc::new(Fanout::new(vec![progress, TracingSink::shared("client")]))
}

/// Fetch `remote` from the server
async fn read_file(
    remote: &str,
    output: Option<PathBuf>,
    server: Option<&str>,
    via_relay: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let client_config = config.client_config(server, via_relay)?;
    let output = match output {
        Some(path) => path,
        None => Path::new(remote)
            .file_name()
            .map(PathBuf::from)
            .with_context(|| format!("cannot derive a local name from {remote:?}, use --output"))?,
    };

    tracing::info!(
        "Reading {remote} from {} into {}",
        client_config.server,
        output.display()
    );

    let progress = Arc::new(TransferProgress::download(remote));
    let client = Client::new(client_config, client_sink(progress));
    let summary = client
        .read(remote, &output)
        .await
        .with_context(|| format!("read of {remote} failed"))?;

    tracing::debug!("received {} in {} blocks", format_bytes(summary.bytes), summary.blocks);
    Ok(())
}

/// Store `local` on the server
async fn write_file(
    local: &Path,
    remote_name: Option<String>,
    server: Option<&str>,
    via_relay: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let client_config = config.client_config(server, via_relay)?;

    let metadata = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("File not found: {}", local.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a regular file", local.display());
    }

    let remote = match remote_name {
        Some(name) => name,
        None => local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a remote name from {}", local.display()))?,
    };

    tracing::info!(
        "Writing {} ({}) to {} as {remote}",
        local.display(),
        format_bytes(metadata.len()),
        client_config.server
    );

    let progress = Arc::new(TransferProgress::upload(metadata.len(), &remote));
    let client = Client::new(client_config, client_sink(progress));
    client
        .write(local, &remote)
        .await
        .with_context(|| format!("write of {remote} failed"))?;

    Ok(())
}

/// Run the server until `shutdown` or Ctrl+C
async fn run_server(bind: Option<&str>, dir: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    let server_config = config.server_config(bind, dir)?;
    let bind_addr = server_config.bind_addr;
    let server = Server::start(server_config, TracingSink::shared("server"))
        .await
        .with_context(|| format!("failed to start server on {bind_addr}"))?;

    println!("tftpsim server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", server.local_addr());
    println!("Directory: {}", server.directory().await.display());
    println!("Type 'help' for commands, Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match commands::parse_server(&line) {
                    None => {}
                    Some(Err(message)) => println!("{message}"),
                    Some(Ok(ServerCommand::Help)) => println!("{SERVER_HELP}"),
                    Some(Ok(ServerCommand::Shutdown)) => break,
                    Some(Ok(ServerCommand::ChangeDir(dir))) => {
                        match server.set_directory(&dir).await {
                            Ok(()) => println!("Directory: {}", server.directory().await.display()),
                            Err(e) => println!("cannot serve {}: {e}", dir.display()),
                        }
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    let report = server.shutdown().await;
    println!("{report}");
    Ok(())
}

/// Run the relay until `shutdown` or Ctrl+C
async fn run_relay(
    bind: Option<&str>,
    server: Option<&str>,
    fault: Option<&str>,
    config: &Config,
) -> anyhow::Result<()> {
    let relay_config = config.relay_config(bind, server, fault)?;
    let bind_addr = relay_config.bind_addr;
    let server_addr = relay_config.server_addr;
    let relay = Relay::bind(relay_config)
        .await
        .with_context(|| format!("failed to start relay on {bind_addr}"))?;

    println!("tftpsim relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", relay.local_addr());
    println!("Server: {server_addr}");
    print_fault(&relay).await;
    println!("Type 'help' for commands, Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match commands::parse_relay(&line) {
                    None => {}
                    Some(Err(message)) => println!("{message}"),
                    Some(Ok(RelayCommand::Help)) => println!("{RELAY_HELP}"),
                    Some(Ok(RelayCommand::Shutdown)) => break,
                    Some(Ok(RelayCommand::Show)) => print_fault(&relay).await,
                    Some(Ok(RelayCommand::Clear)) => {
                        relay.set_fault(None).await;
                        print_fault(&relay).await;
                    }
                    Some(Ok(RelayCommand::SetFault(spec))) => {
                        relay.set_fault(Some(spec)).await;
                        print_fault(&relay).await;
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    let cut = relay.shutdown().await;
    println!("{cut} session(s) still active at shutdown");
    Ok(())
}

async fn print_fault(relay: &Relay) {
    match relay.fault().await {
        Some(spec) => println!("Fault: {spec} (applies to new sessions)"),
        None => println!("Fault: none"),
    }
}
