use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SharedSettings;
use crate::error::Result;
use crate::ssh::SshClient;
use crate::store::Store;
use crate::supervisor::{ConcurrencyGate, EntityWorker, Flow};

/// Per-SSH liveness worker.
///
/// Each pass establishes a throwaway tunnel on an ephemeral port, records
/// the outcome and sleeps. The check never leaves a tunnel running: the
/// driver tears the connection down as part of verification.
#[derive(Clone)]
pub struct SshChecker {
    store: Store,
    settings: SharedSettings,
    driver: Arc<SshClient>,
}

impl SshChecker {
    pub fn new(store: Store, settings: SharedSettings, driver: Arc<SshClient>) -> Self {
        Self {
            store,
            settings,
            driver,
        }
    }

    async fn check_once(
        &self,
        id: i64,
        gate: &ConcurrencyGate,
        cancel: &CancellationToken,
    ) -> Result<Flow> {
        let Some(ssh) = self.store.get_ssh(id).await? else {
            return Ok(Flow::Exit);
        };

        let (test_timeout, auto_delete) = {
            let settings = self.settings.read().await;
            (
                Duration::from_secs(settings.ssh_test_timeout.max(1)),
                settings.ssh_auto_delete_died,
            )
        };

        let _permit = gate.acquire().await;
        let started = Instant::now();

        let is_live = match timeout(
            test_timeout,
            self.driver
                .verify(&ssh.ip, &ssh.username, &ssh.password, ssh.ssh_port, cancel),
        )
        .await
        {
            Ok(is_live) => is_live,
            Err(_) => {
                debug!(
                    "{:>15} ({:4.1}s) - Test timeout exceeded",
                    ssh.ip,
                    started.elapsed().as_secs_f32()
                );
                false
            }
        };

        // Cancellation means the entity was deleted or the engine is
        // shutting down; either way nothing may be written on its behalf
        if cancel.is_cancelled() {
            return Ok(Flow::Exit);
        }

        self.store.finish_ssh_check(id, is_live).await?;

        if !is_live && auto_delete && self.store.delete_ssh_if_dead(id).await? {
            info!("{:>15} - Died and was auto-deleted", ssh.ip);
            return Ok(Flow::Exit);
        }

        Ok(Flow::Continue)
    }
}

impl EntityWorker for SshChecker {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn limit(&self) -> usize {
        self.settings.read().await.ssh_tasks_count
    }

    async fn list_ids(&self) -> Result<Vec<i64>> {
        self.store.list_ssh_ids().await
    }

    async fn run(&self, id: i64, cancel: CancellationToken, gate: ConcurrencyGate) {
        loop {
            let flow = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.check_once(id, &gate, &cancel) => match result {
                    Ok(flow) => flow,
                    Err(err) => {
                        debug!("SSH {id} check pass failed: {err}");
                        Flow::Continue
                    }
                }
            };

            if flow == Flow::Exit {
                break;
            }

            let recheck =
                Duration::from_secs(self.settings.read().await.ssh_recheck_interval.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(recheck) => {}
            }
        }
    }
}
