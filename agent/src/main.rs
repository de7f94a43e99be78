//! # termlink Agent — entry point
//!
//! Spawns the coding-assistant CLI inside a PTY, serves the token-gated
//! HTTP surface on a local port, and (when relay credentials are given)
//! dials into the relay so phones can reach the terminal without a tunnel.

use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use termlink_agent::{http, link, pty};
use termlink_protocol::auth::{generate_secret, ACCESS_TOKEN_BYTES};

#[derive(Parser, Debug)]
#[command(
    name = "termlink-agent",
    about = "Host a coding-assistant CLI in a PTY, reachable from phone or browser"
)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Workspace directory the child is launched in. Defaults to the
    /// current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Path to the CLI to run inside the PTY.
    #[arg(long, default_value = "claude")]
    command_path: PathBuf,

    /// Access token for browser sessions. Generated when omitted.
    #[arg(long)]
    token: Option<String>,

    /// Relay base URL (ws:// or wss://). Enables the dial-in link;
    /// requires --agent-id and --agent-key from the relay registration.
    #[arg(long)]
    relay_url: Option<String>,

    /// Agent id issued by the relay.
    #[arg(long)]
    agent_id: Option<String>,

    /// Agent key issued by the relay, shown once at registration.
    #[arg(long)]
    agent_key: Option<String>,
}

fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 });
    })
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termlink_agent=info".into()),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let workspace = match args.workspace.clone() {
        Some(path) => path,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} is not accessible", workspace.display()))?;

    let link_config = match (&args.relay_url, &args.agent_id, &args.agent_key) {
        (Some(relay_url), Some(agent_id), Some(agent_key)) => {
            let parsed = url::Url::parse(relay_url).context("invalid --relay-url")?;
            anyhow::ensure!(
                matches!(parsed.scheme(), "ws" | "wss"),
                "--relay-url must use ws:// or wss://"
            );
            Some(link::LinkConfig {
                relay_url: relay_url.clone(),
                agent_id: agent_id.clone(),
                agent_key: agent_key.clone(),
            })
        }
        (None, _, _) => None,
        _ => anyhow::bail!("--relay-url requires --agent-id and --agent-key"),
    };

    let token = args
        .token
        .clone()
        .unwrap_or_else(|| generate_secret(ACCESS_TOKEN_BYTES));

    let session = Arc::new(pty::PtySession::new(
        workspace.clone(),
        args.command_path.clone(),
    ));
    session
        .start()
        .await
        .context("failed to start the terminal session")?;

    let shutdown = CancellationToken::new();
    let state = http::HttpState::new(session.clone(), token.clone(), shutdown.clone());
    let app = http::router(state);

    let addr = SocketAddr::from((args.host, args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let link_task = link_config.as_ref().map(|config| {
        tokio::spawn(link::run_link(
            session.clone(),
            config.clone(),
            shutdown.clone(),
        ))
    });

    print_banner(&args, &token, link_config.as_ref());
    info!("termlink agent listening on {} (workspace {})", addr, workspace.display());

    let shutdown_signal = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        // Ends every SSE stream and the relay link before the PTY goes away.
        shutdown_signal.cancel();
    });
    serve.await.context("server error")?;

    if let Some(task) = link_task {
        task.abort();
    }
    session.stop().await;
    info!("Stopped");
    Ok(())
}

/// Startup banner with the access URL. This is where an auto-generated
/// token is surfaced to the operator.
fn print_banner(args: &Args, token: &str, link: Option<&link::LinkConfig>) {
    let bar = "=".repeat(58);
    println!();
    println!("{bar}");
    println!("  termlink agent");
    println!("{bar}");
    println!();
    println!("  Local:  http://{}:{}/?token={}", args.host, args.port, token);
    if let Some(config) = link {
        println!("  Relay:  {} (agent {})", config.relay_url, config.agent_id);
    }
    println!();
    println!("  Open the address above in a phone or desktop browser");
    println!();
    println!("{bar}");
    println!();
}
