//! Sandbox server - runs inside the container
//!
//! Serves the newline-delimited JSON protocol on TCP for the owning host, or
//! answers a single request given with `--request` and exits (the fallback
//! path used through container exec). Logs go to stderr so one-shot stdout
//! carries nothing but the response line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agentvisor::backend::ExecLimits;
use agentvisor::protocol::SandboxServer;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox_agent", about = "In-sandbox protocol server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:7070")]
    listen: SocketAddr,

    /// Directory relative request paths resolve against
    #[arg(long, default_value = "/workspace")]
    root: PathBuf,

    /// Handle this single JSON request, print the response and exit
    #[arg(long)]
    request: Option<String>,

    /// Default exec timeout
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Per-stream cap on captured exec output
    #[arg(long, default_value_t = 100 * 1024)]
    max_output_bytes: usize,

    /// Maximum glob and grep matches
    #[arg(long, default_value_t = 1000)]
    max_results: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let server = SandboxServer::new(
        args.root,
        ExecLimits {
            timeout: Duration::from_secs(args.timeout_secs),
            max_output_bytes: args.max_output_bytes,
        },
        args.max_results,
    );

    if let Some(request) = args.request {
        println!("{}", server.one_shot(&request).await);
        return Ok(());
    }

    std::fs::create_dir_all(server.root())?;
    info!(listen = %args.listen, "Starting sandbox server");
    let listener = TcpListener::bind(args.listen).await?;
    server.serve(listener).await?;
    Ok(())
}
