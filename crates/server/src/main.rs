//! plinthd: HTTP front for the provisioning orchestrator.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use plinth_core::{CloudCredentials, ProgressSink, StdoutSink};
use plinth_image::{DockerImageBuilder, RegistryConfig};
use plinth_provision::Provisioner;
use plinth_stack::{KubeEngine, StackManager};

mod routes;

fn init_tracing() {
    let env = std::env::var("PLINTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PLINTH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PLINTH_METRICS_ADDR; expected host:port");
        }
    }
}

fn local_mode() -> bool {
    std::env::var("PLINTH_LOCAL")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    init_metrics();

    // Required credentials are read once, before anything listens.
    // Missing values are fatal here, not at request time.
    let creds = match CloudCredentials::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup error: {e}");
            std::process::exit(1);
        }
    };

    let sink: Arc<dyn ProgressSink> = Arc::new(StdoutSink);
    let builder = Arc::new(DockerImageBuilder::new(RegistryConfig::from_env(), sink.clone()));
    let engine = Arc::new(KubeEngine::from_env());
    let manager = StackManager::new(engine, sink);
    let provisioner = Arc::new(Provisioner::new(builder, manager, creds, local_mode()));

    let app = routes::router(routes::AppState { provisioner });
    let addr = std::env::var("PLINTH_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "plinthd listening");
    axum::serve(listener, app).await?;
    Ok(())
}
