//! ctlwire - Command-line client for remote controllers
//!
//! Connects to a controller, issues one command and prints the JSON result.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use ctlwire_client::{Client, ClientConfig, LifecycleEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctlwire")]
#[command(about = "Command-line client for remote input and display controllers")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "CTLWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Controller endpoint (tcp://host:port, host:port or ws://host:port/path)
    #[arg(short, long, env = "CTLWIRE_ENDPOINT")]
    endpoint: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "CTLWIRE_TOKEN")]
    token: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print command metrics to stderr on exit
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Send a raw command
    Send {
        /// Command type
        command_type: String,

        /// Payload JSON (or @file.json to read from file)
        payload: Option<String>,

        /// Explicit command ID
        #[arg(long)]
        id: Option<String>,
    },

    /// Move the pointer to absolute coordinates
    MouseMove { x: i32, y: i32 },

    /// Click a mouse button
    MouseClick {
        /// Button: left, right or middle
        #[arg(short, long, default_value = "left")]
        button: String,

        #[arg(short, long)]
        x: Option<i32>,

        #[arg(short, long)]
        y: Option<i32>,

        /// Double click
        #[arg(short, long)]
        double: bool,
    },

    /// Scroll by the given deltas
    Scroll {
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        dx: i32,

        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        dy: i32,

        /// Scroll at this position (x,y)
        #[arg(long, value_delimiter = ',', num_args = 2)]
        at: Option<Vec<i32>>,
    },

    /// Press a key
    KeyPress {
        key: String,

        /// Modifiers, comma separated (ctrl,shift,alt,meta)
        #[arg(short, long, value_delimiter = ',')]
        modifiers: Vec<String>,
    },

    /// Release a key
    KeyRelease {
        key: String,

        #[arg(short, long, value_delimiter = ',')]
        modifiers: Vec<String>,
    },

    /// Type text
    Type {
        text: String,

        /// Delay between characters in milliseconds
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Capture a display
    Capture {
        /// Display ID (primary display if omitted)
        #[arg(long)]
        display: Option<u32>,

        /// Image format
        #[arg(short, long, default_value = "png")]
        format: String,

        /// JPEG quality (1-100)
        #[arg(short, long)]
        quality: Option<u8>,
    },

    /// List displays
    Displays,

    /// List windows
    Windows,

    /// Describe the window at a position (focused window if omitted)
    WindowAt {
        x: Option<i32>,
        y: Option<i32>,
    },

    /// Stream unsolicited messages and connection events until Ctrl+C
    Watch,
}

/// Builds the client configuration: file, then environment, then flags.
fn build_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(ref path) = cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref token) = cli.token {
        config = config.with_auth_token(token);
    }
    if let Some(ms) = cli.timeout {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = build_config(&cli).map_err(|e| {
        eprintln!("{}: {}", "Configuration error".red(), e);
        e
    })?;
    let client = Client::new(config)?;

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let failed = match cli.command {
        Commands::Watch => {
            watch(&client).await;
            false
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => {
                println!("{}", output);
                false
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                true
            }
        },
    };

    if cli.stats {
        if let Ok(report) = client.metrics() {
            eprintln!("{}\n{}", "Metrics".bold(), report);
        }
    }

    client.disconnect().await?;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints unsolicited documents to stdout and lifecycle events to stderr.
async fn watch(client: &Client) {
    let mut unsolicited = client.subscribe_unsolicited();
    let mut lifecycle = client.subscribe_lifecycle();

    eprintln!(
        "{} {}",
        "Watching".green(),
        "(press Ctrl+C to stop)".dimmed()
    );

    loop {
        tokio::select! {
            doc = unsolicited.recv() => {
                match doc {
                    Ok(doc) => println!("{}", doc),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} messages", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = lifecycle.recv() => {
                match event {
                    Ok(LifecycleEvent::ReconnectionExhausted { attempts }) => {
                        eprintln!(
                            "{}: gave up after {} reconnection attempts",
                            "Error".red(),
                            attempts
                        );
                        break;
                    }
                    Ok(event) => eprintln!("{}", commands::format_event(&event).dimmed()),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                break;
            }
        }
    }
}
