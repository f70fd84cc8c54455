use authgate::{config::AuthGateConfig, init_server, init_tracing};
use std::env;
use std::path::PathBuf;
use std::process;

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("{}", e);
        process::exit(1);
    }

    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/authgate.yaml".to_string());

    let config = match AuthGateConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: authgate [config_file]");
            process::exit(1);
        }
    };

    if let Err(e) = init_server(config, Some(PathBuf::from(config_path))).await {
        eprintln!("authgate error: {}", e);
        process::exit(1);
    }
}
