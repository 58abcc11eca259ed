use anyhow::Context;
use dotenvy::dotenv;
use minivault::config::Config;
use minivault::interactions::InteractionLog;
use minivault::model::ollama::OllamaBackend;
use minivault::model::LlmBackend;
use minivault::relay::Relay;
use minivault::validate::Validator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};


#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
dotenv().ok();
let cfg = <Config as clap::Parser>::parse();


// logs
let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
fmt().with_env_filter(filter).init();


let validator = Arc::new(Validator::generate_request()?);
let log = Arc::new(InteractionLog::open(&cfg.log_file).context("open interaction log")?);


// upstream runtime
let backend = OllamaBackend::from_config(&cfg)?;
tracing::info!(ollama_url = backend.base_url(), default_model = %cfg.ollama_model, "starting MiniVault API");
match backend.list_models().await {
Ok(models) => tracing::info!(?models, "ollama is available"),
Err(e) => tracing::warn!(error = %e, "ollama is not available, fallback responses will be used"),
}
let relay = Arc::new(Relay::new(backend, cfg.ollama_model.clone()));


let app = minivault::api::routes(relay, log, validator);
let addr: SocketAddr = cfg.bind_addr.parse().with_context(|| format!("parse bind address {:?}", cfg.bind_addr))?;


tracing::info!(%addr, log_file = ?cfg.log_file, "listening");
axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
.with_graceful_shutdown(shutdown_signal())
.await?;
Ok(())
}


async fn shutdown_signal() {
let ctrl_c = async {
if let Err(e) = signal::ctrl_c().await {
tracing::error!(error = %e, "failed to install Ctrl+C handler");
std::future::pending::<()>().await;
}
};

#[cfg(unix)]
let terminate = async {
match signal::unix::signal(signal::unix::SignalKind::terminate()) {
Ok(mut sig) => { sig.recv().await; }
Err(e) => {
tracing::error!(error = %e, "failed to install SIGTERM handler");
std::future::pending::<()>().await;
}
}
};

#[cfg(not(unix))]
let terminate = std::future::pending::<()>();

tokio::select! {
_ = ctrl_c => {},
_ = terminate => {},
}

tracing::info!("shutdown signal received");
}
