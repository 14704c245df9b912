use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checker::SshChecker;
use crate::config::SharedSettings;
use crate::error::Result;
use crate::feed::FeedIngester;
use crate::ports::PortWorker;
use crate::ssh::SshClient;
use crate::store::Store;
use crate::supervisor::Supervisor;

/// Top-level engine: one supervisor per entity kind plus the feed ingester.
///
/// Startup discards all connection state left over from a previous run (no
/// tunnel survives a restart), then brings up the SSH liveness supervisor,
/// the port supervisor and the feed loop under one shutdown token. Stopping
/// cancels everything, waits for acknowledgement and finally kills any SSH
/// client child still tracked by the driver.
pub struct Manager {
    store: Store,
    settings: SharedSettings,
    driver: Arc<SshClient>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Manager {
    pub async fn new(store: Store, settings: SharedSettings) -> Self {
        let driver = {
            let settings = settings.read().await;
            Arc::new(
                SshClient::new(settings.ssh_client.clone())
                    .with_connect_timeout(Duration::from_secs(settings.ssh_test_timeout.max(1))),
            )
        };

        Self {
            store,
            settings,
            driver,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Start all background loops. Returns once they are spawned.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting SSH/port matching engine");

        self.store.reset_runtime_state().await?;

        let (ssh_limit, port_limit) = {
            let settings = self.settings.read().await;
            (settings.ssh_tasks_count, settings.port_tasks_count)
        };

        let checker = SshChecker::new(
            self.store.clone(),
            self.settings.clone(),
            self.driver.clone(),
        );
        let ports = PortWorker::new(
            self.store.clone(),
            self.settings.clone(),
            self.driver.clone(),
        );
        let feed = FeedIngester::new(self.store.clone(), self.settings.clone());

        self.workers.push(tokio::spawn(
            Supervisor::new(checker, ssh_limit).run(self.shutdown.child_token()),
        ));
        self.workers.push(tokio::spawn(
            Supervisor::new(ports, port_limit).run(self.shutdown.child_token()),
        ));
        self.workers
            .push(tokio::spawn(feed.run(self.shutdown.child_token())));

        info!("Engine started");
        Ok(())
    }

    /// Cancel every task, wait until all have acknowledged, then sweep any
    /// child process the driver still tracks.
    pub async fn stop(&mut self) {
        info!("Stopping SSH/port matching engine");

        self.shutdown.cancel();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                error!("Worker failed during shutdown: {err}");
            }
        }

        self.driver.registry().kill_all();
        info!("Engine stopped");
    }

    /// Shared settings handle, for the API surface
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Repository handle, for the API surface
    pub fn store(&self) -> Store {
        self.store.clone()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // Backstop when stop() was never awaited: detached workers observe
        // the token and wind themselves down
        self.shutdown.cancel();
    }
}
