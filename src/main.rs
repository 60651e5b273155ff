//! Chunnel CLI - tunnel raw TCP streams over chunked HTTP
//!
//! Run one peer as the initiator (TCP listener + outbound HTTP) and
//! the other as the acceptor (HTTP listener + backend TCP client).

use anyhow::{Context, Result};
use chunnel_acceptor::{AcceptorConfig, AcceptorServer};
use chunnel_initiator::{InitiatorConfig, InitiatorServer};
use chunnel_proto::Handshake;
use chunnel_router::RouteTable;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Chunnel - carry TCP connections across HTTP-only networks
#[derive(Parser, Debug)]
#[command(name = "chunnel")]
#[command(about = "Tunnel raw TCP streams over long-lived chunked HTTP requests")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept local TCP connections and forward each one as an
    /// outbound chunked HTTP request
    #[command(long_about = r#"
Listen on a local TCP address; every accepted connection becomes one
long-lived chunked PUT request to the remote acceptor.

EXAMPLES:
  # Reach the remote /ssh route through an HTTP-only network
  chunnel initiator --bind 127.0.0.1:8124 \
    --remote http://relay.example:8080/ssh

ENVIRONMENT VARIABLES:
  CHUNNEL_BIND       Local TCP listen address
  CHUNNEL_REMOTE     Remote acceptor URL
  CHUNNEL_HANDSHAKE  Client handshake token
    "#)]
    Initiator {
        /// Local TCP listen address
        #[arg(long, env = "CHUNNEL_BIND", default_value = chunnel_initiator::DEFAULT_BIND_ADDR)]
        bind: SocketAddr,

        /// Remote acceptor URL (e.g. http://relay.example:8080/ssh)
        #[arg(long, env = "CHUNNEL_REMOTE", default_value = "http://127.0.0.1:8080/ssh")]
        remote: Url,

        /// Client handshake token
        #[arg(long, env = "CHUNNEL_HANDSHAKE", default_value = "<")]
        client_token: String,

        /// Expected server handshake token
        #[arg(long, default_value = ">")]
        server_token: String,
    },

    /// Accept chunked HTTP requests and relay them to backend TCP
    /// services selected by request path
    #[command(long_about = r#"
Listen on an HTTP address; requests whose path matches a configured
route are relayed to that route's backend TCP service. Unmatched
paths get 404, non-chunked requests get 403.

EXAMPLES:
  # Expose local sshd and a web server
  chunnel acceptor --bind 0.0.0.0:8080 \
    --route /ssh=127.0.0.1:22 --route /web=127.0.0.1:80

ENVIRONMENT VARIABLES:
  CHUNNEL_BIND       HTTP listen address
  CHUNNEL_HANDSHAKE  Expected client handshake token
    "#)]
    Acceptor {
        /// HTTP listen address
        #[arg(long, env = "CHUNNEL_BIND", default_value = chunnel_acceptor::DEFAULT_BIND_ADDR)]
        bind: SocketAddr,

        /// Route mapping, repeatable: /path=host:port
        #[arg(long = "route")]
        routes: Vec<String>,

        /// JSON file mapping request paths to backend addresses
        #[arg(long)]
        routes_file: Option<PathBuf>,

        /// Trusted header carrying the client address (for reverse
        /// proxy deployments); empty disables header trust
        #[arg(long, default_value = "client_ip")]
        address_header: String,

        /// Expected client handshake token
        #[arg(long, env = "CHUNNEL_HANDSHAKE", default_value = "<")]
        client_token: String,

        /// Server handshake token
        #[arg(long, default_value = ">")]
        server_token: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_routes(specs: &[String], file: Option<&PathBuf>) -> Result<RouteTable> {
    let mut table = match file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read routes file {}", path.display()))?;
            RouteTable::from_json(&json).context("Failed to parse routes file")?
        }
        None => RouteTable::new(),
    };

    for spec in specs {
        table
            .insert_spec(spec)
            .with_context(|| format!("Invalid --route {}", spec))?;
    }

    if table.is_empty() {
        table = RouteTable::defaults();
        info!("No routes configured; using defaults (/ssh, /web)");
    }

    Ok(table)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Initiator {
            bind,
            remote,
            client_token,
            server_token,
        } => {
            let config = InitiatorConfig {
                bind_addr: bind,
                remote_url: remote,
                handshake: Handshake::new(client_token, server_token),
            };

            let server = InitiatorServer::bind(config)
                .await
                .context("Failed to start initiator")?;
            server.run().await.context("Initiator terminated")?;
        }
        Commands::Acceptor {
            bind,
            routes,
            routes_file,
            address_header,
            client_token,
            server_token,
        } => {
            let config = AcceptorConfig {
                bind_addr: bind,
                routes: build_routes(&routes, routes_file.as_ref())?,
                address_header: (!address_header.is_empty()).then_some(address_header),
                handshake: Handshake::new(client_token, server_token),
            };

            let server = AcceptorServer::bind(config)
                .await
                .context("Failed to start acceptor")?;
            server.run().await.context("Acceptor terminated")?;
        }
    }

    Ok(())
}
