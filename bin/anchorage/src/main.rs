//! Service entry point: env config → context → router → serve.

use std::net::SocketAddr;

use anchorage_service::{AppState, ServiceConfig, build_context, router};
use clap::Parser;
use eyre::WrapErr as _;
use metrics_exporter_prometheus::PrometheusBuilder;

#[derive(Debug, Parser)]
#[command(name = "anchorage", about = "Streaming data-item upload service")]
struct Args {
    /// Address the HTTP surface binds to.
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServiceConfig::from_env().wrap_err("read configuration")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("install metrics recorder")?;

    let ctx = build_context(&config).await?;
    let app = router(AppState { ctx, metrics });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .wrap_err_with(|| format!("bind {}", args.listen))?;
    tracing::info!(listen = %args.listen, "upload service listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(Into::into)
}
