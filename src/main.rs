use clap::{Arg, Command};
use sshmux::{Manager, Settings, Store};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize logging
    sshmux::init_logging()?;

    let matches = Command::new("sshmux")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SSH fleet to SOCKS5 port matching and tunnel lifecycle engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Settings file path (created with defaults if missing)")
                .default_value("data/settings.json"),
        )
        .arg(
            Arg::new("db")
                .short('d')
                .long("db")
                .value_name("FILE")
                .help("Store file path")
                .default_value("data/sshmux.db"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");
    let db_path = matches.get_one::<String>("db").expect("db has a default");

    let settings = Settings::load_or_create(config_path)?;
    info!("Loaded settings from {config_path}");
    info!(
        "SSH checks: {} concurrent, {}s timeout; port operations: {} concurrent",
        settings.ssh_tasks_count, settings.ssh_test_timeout, settings.port_tasks_count
    );

    let store = Store::open(db_path).await?;
    info!("Opened store at {db_path}");

    let mut manager = Manager::new(store, settings.into_shared()).await;
    manager.start().await?;

    info!("Engine running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    manager.stop().await;
    info!("Shutdown complete");

    Ok(())
}
