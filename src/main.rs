use std::path::Path;

use tracing_subscriber::EnvFilter;

use busload::config::{Config, ConfigError, DEFAULT_CONFIG_PATH};

const USAGE: &str = "usage: busload <service|agent> [config.toml]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("busload=debug".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (role, config_path) = match args.as_slice() {
        [role] => (role.as_str(), None),
        [role, path] => (role.as_str(), Some(path.as_str())),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let config = load_config(config_path)?;

    match role {
        "service" => busload::api::serve(config.service).await?,
        "agent" => {
            if let Err(e) = busload::agent::run(config.agent).await {
                tracing::error!(error = %e, "agent stopped");
                return Err(e.into());
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

/// An explicit path must exist; the default one may be absent.
fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => {
            tracing::info!(path, "loading config");
            Config::load_from(path)
        }
        None if !Path::new(DEFAULT_CONFIG_PATH).exists() => {
            tracing::info!("no {} found, using defaults", DEFAULT_CONFIG_PATH);
            Ok(Config::default())
        }
        None => Config::load(),
    }
}
