use ztex_miner::{config::MinerConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = match MinerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            ::tracing::error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    Daemon::new(config).run().await
}
