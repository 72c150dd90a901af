//! Gateway process entrypoint.

use envconfig::Envconfig;
use fanout_gateway::config::Config;
use fanout_gateway::server::Gateway;

#[tokio::main]
async fn main() {
    let config = match Config::init_from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}, falling back to defaults");
            Config::default()
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        shard_count = config.shard_count,
        lb_addr = %config.lb_addr,
        "starting fanout-gateway"
    );

    if let Err(e) = Gateway::build(config).run().await {
        tracing::error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}
