#![forbid(unsafe_code)]

//! # conch
//!
//! WebSocket gateway that relays an interactive SSH shell to browser
//! terminals.
//!
//! ## Usage
//!
//! ```bash
//! SSH_HOST=box.lan SSH_USERNAME=me SSH_PASSWORD=... conch --port 3001
//! ```

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conch::{Cli, GatewayBuilder, SshConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    init_tracing(&cli);

    let settings = cli.relay_settings();
    if !settings.credentials.is_configured() {
        warn!("SSH host or authentication not configured; connect requests will fail");
    }

    let gateway = GatewayBuilder::new()
        .address(cli.address().to_string())
        .connector(SshConnector::new().known_hosts_check(cli.known_hosts_check))
        .settings(settings)
        .max_sessions(cli.max_sessions)
        .frontend_url(cli.frontend_url.clone());
    let gateway = match &cli.allowed_origin {
        Some(origin) => gateway.allowed_origin(origin.clone()),
        None => gateway,
    }
    .build()
    .context("invalid gateway configuration")?;

    info!(address = %gateway.address(), "Starting conch");

    gateway
        .listen_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("gateway failed")?;

    Ok(())
}

/// `RUST_LOG` wins over `-v` when set.
fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
