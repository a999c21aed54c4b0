use anyhow::Result;
use tracing::{info, warn};

fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedgate=info".into()),
        )
        .init();

    let config_path =
        std::env::var("FEEDGATE_CONFIG").unwrap_or_else(|_| "feedgate.toml".to_string());
    let mut config = match feedgate::config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
            feedgate::config::FeedgateConfig::default()
        }
    };
    config.apply_env_overrides();

    info!(
        auth_service = %config.services.auth_service,
        data_service = %config.services.data_service,
        "Feedgate configured"
    );

    // The distribution core is embedded by a host that supplies the provider
    // transport and feeds the event channel; see Distributor::new.
    Ok(())
}
