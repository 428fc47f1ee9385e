//! `ironloop config`: print the effective configuration.

use ironloop_config::AppConfig;

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    println!("{}", redacted(config).to_toml()?);
    Ok(())
}

/// The config with every secret masked.
fn redacted(mut config: AppConfig) -> AppConfig {
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("***".into());
        }
    };
    mask(&mut config.api_key);
    for provider in config.providers.values_mut() {
        mask(&mut provider.api_key);
    }
    config
}
