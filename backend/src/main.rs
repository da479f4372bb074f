// Faultline Control Plane server entry point

use faultline_control_plane::{config::AppConfig, init_tracing, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("FAULTLINE_CONFIG") {
        Ok(path) => AppConfig::from_file(&path)?,
        Err(_) => AppConfig::from_env()?,
    };

    init_tracing(&config.log);
    run(config).await
}
