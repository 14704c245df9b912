//! sshmux - SSH fleet to SOCKS5 port matching engine
//!
//! Keeps a fleet of SSH credentials and a fleet of local SOCKS5 ports
//! continuously matched: live credentials are discovered by a per-SSH
//! liveness loop, assigned to managed ports under uniqueness constraints,
//! carried as SSH-backed dynamic forwarding tunnels, health-checked through
//! egress probes, and optionally rotated on a timer so each port
//! periodically changes its exit IP.
//!
//! # Features
//!
//! - One supervised task per SSH and per port, reconciled against the store
//! - External SSH client driven as a black box (plink-compatible flags)
//! - End-to-end egress verification before a tunnel is handed out
//! - Atomic SSH-to-port reservation (an SSH serves at most one port)
//! - Runtime-adjustable concurrency bounds and rotation settings
//! - Bulk credential ingestion from text files or an external feed
//!
//! # Example
//!
//! ```rust,no_run
//! use sshmux::{Manager, Settings, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::open("data/sshmux.db").await?;
//!     let settings = Settings::default().into_shared();
//!
//!     let mut manager = Manager::new(store, settings).await;
//!     manager.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop().await;
//!
//!     Ok(())
//! }
//! ```

pub mod checker;
pub mod config;
pub mod error;
pub mod feed;
pub mod manager;
pub mod net;
pub mod ports;
pub mod probe;
pub mod ssh;
pub mod store;
pub mod supervisor;

pub use config::{Settings, SharedSettings};
pub use error::{Error, Result, SshError};
pub use manager::Manager;
pub use probe::IpProber;
pub use ssh::{SshClient, Tunnel};
pub use store::{NewSsh, Port, Ssh, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing
pub fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sshmux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Config(e.to_string()))?;

    Ok(())
}
