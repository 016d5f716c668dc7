use anyhow::{Context, Result};
use route_guard::{
    Config, DEFAULT_CONFIG_FILE, DecisionEngine, RouteService, load_config,
    load_upstream_tls_config, serve,
};
use std::{env, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

fn read_config() -> Result<Config> {
    if let Some(path) = env::args().nth(1) {
        let config = load_config(Path::new(&path))?;
        info!(config_file = %path, "Configuration loaded");
        return Ok(config);
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILE);
    if default_path.exists() {
        let config = load_config(default_path)?;
        info!(config_file = DEFAULT_CONFIG_FILE, "Configuration loaded");
        Ok(config)
    } else {
        info!("No configuration file, using defaults and environment");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = read_config()?;
    config.apply_overrides(|key| env::var(key).ok())?;

    // Invalid rules abort startup.
    let engine = DecisionEngine::new(&config.rules).context("Invalid access rules")?;
    let tls_config = load_upstream_tls_config(&config.upstream)?;
    let service = Arc::new(RouteService::new(engine, tls_config));

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        https_upstreams = config.upstream.ca_file.is_some(),
        "Route service listening"
    );

    serve(listener, service).await
}
