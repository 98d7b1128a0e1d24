//! worksync server binary.
//!
//! # Commands
//!
//! - `serve` - Run the sync server
//! - `issue-token` - Print an authentication token for a subject

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use worksync_server::{AuthConfig, ServerConfig, SyncServer, TokenValidator};

/// worksync real-time sync server.
#[derive(Parser)]
#[command(name = "worksync-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7420")]
        bind: SocketAddr,

        /// Maximum concurrent connections
        #[arg(long, default_value_t = 1000)]
        max_connections: usize,

        /// Broadcast events buffered per connection
        #[arg(long, default_value_t = 256)]
        outbound_capacity: usize,

        /// Shared secret; enables token authentication
        #[arg(long)]
        auth_secret: Option<String>,
    },

    /// Print an authentication token for a subject
    IssueToken {
        /// Subject the token is issued for
        subject: String,

        /// Shared secret the server was started with
        #[arg(long)]
        auth_secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag.
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            max_connections,
            outbound_capacity,
            auth_secret,
        } => {
            let mut config = ServerConfig::new(bind)
                .with_max_connections(max_connections)
                .with_outbound_capacity(outbound_capacity);
            if let Some(secret) = auth_secret {
                config = config.with_auth(secret.into_bytes());
            }
            serve(config).await?;
        }
        Commands::IssueToken {
            subject,
            auth_secret,
        } => {
            let validator = TokenValidator::new(AuthConfig::new(auth_secret.into_bytes()));
            let token = validator.create_token(&subject)?;
            let hex: String = token.iter().map(|b| format!("{b:02x}")).collect();
            println!("{hex}");
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        addr = %config.bind_addr,
        auth = config.require_auth,
        max_connections = config.max_connections,
        "starting worksync server"
    );
    let server = Arc::new(SyncServer::new(config));
    let listener = server.listen().await?;

    let signal = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => server.shutdown(),
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        }
    });

    server.serve(listener).await?;
    signal.abort();

    let stats = server.stats();
    info!(
        connections = stats.connections_accepted,
        requests = stats.requests_handled,
        commits = stats.mutations_committed,
        "worksync server stopped"
    );
    Ok(())
}
