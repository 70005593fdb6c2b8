use blds::{status, Config, Server};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve data from arrays or files to remote clients.
#[derive(Parser)]
#[command(name = "blds", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "blds.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blds=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);

    // Failure to bind the main listener fails startup.
    let server = Server::bind(config.clone()).await?;
    let cancel = server.cancellation_token();

    // The HTTP status server is best-effort; the data server runs without it.
    match TcpListener::bind(("0.0.0.0", config.http_port)).await {
        Ok(listener) => {
            info!(
                "HTTP status server listening at {}.",
                listener.local_addr()?.port()
            );
            let app = status::router(server.shared_status());
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = result {
                    warn!("HTTP status server error: {}", e);
                }
            });
        }
        Err(e) => warn!("Could not initialize HTTP status server: {}", e),
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await
}
