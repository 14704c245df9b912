use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SharedSettings;
use crate::error::{Result, SshError};
use crate::probe::IpProber;
use crate::ssh::{SshClient, Tunnel};
use crate::store::Store;
use crate::supervisor::{ConcurrencyGate, EntityWorker, Flow};

/// Sleep between two passes over the same port
const PASS_INTERVAL: Duration = Duration::from_secs(1);

/// Probe attempts per health check
const HEALTH_PROBE_TRIES: u32 = 3;

/// True when an egress probe result means the tunnel no longer works:
/// nothing answered, or the exit IP no longer belongs to the assigned SSH.
fn tunnel_died(probe_ip: &str, assigned_ip: Option<&str>) -> bool {
    if probe_ip.is_empty() {
        return true;
    }
    match assigned_ip {
        Some(expected) => probe_ip != expected,
        None => false,
    }
}

/// True when a connected port has carried its tunnel longer than the
/// configured rotation interval.
fn rotation_due(
    time_connected: Option<DateTime<Utc>>,
    interval_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    match time_connected {
        Some(connected_at) => now - connected_at >= chrono::Duration::seconds(interval_secs as i64),
        None => false,
    }
}

/// Per-port worker: keeps one managed port matched with a live SSH.
///
/// Each pass runs Health -> Assign -> Rotate in order; passes for the same
/// port never interleave because the port's single task is the only place
/// they run. The task exclusively owns the port's tunnel handle, so
/// cancellation (port deleted, shutdown) releases the child process on the
/// way out.
#[derive(Clone)]
pub struct PortWorker {
    store: Store,
    settings: SharedSettings,
    driver: Arc<SshClient>,
    prober: IpProber,
}

impl PortWorker {
    pub fn new(store: Store, settings: SharedSettings, driver: Arc<SshClient>) -> Self {
        Self {
            store,
            settings,
            driver,
            prober: IpProber::default(),
        }
    }

    async fn pass(
        &self,
        id: i64,
        tunnel: &mut Option<Tunnel>,
        gate: &ConcurrencyGate,
        cancel: &CancellationToken,
    ) -> Result<Flow> {
        let Some(port) = self.store.get_port(id).await? else {
            return Ok(Flow::Exit);
        };
        let assigned = self.store.assigned_ssh(id).await?;
        let settings = self.settings.read().await.clone();

        let _permit = gate.acquire().await;

        // The repository may have been mutated from outside (API detach);
        // a handle without a connected port is dead weight
        if !port.is_connected && tunnel.is_some() {
            drop(tunnel.take());
        }

        // Health: verify the tunnel still reaches the outside world
        if port.is_connected {
            let ip = self
                .prober
                .probe(&port.proxy_address(), HEALTH_PROBE_TRIES)
                .await;
            if cancel.is_cancelled() {
                return Ok(Flow::Exit);
            }
            self.store.finish_port_check(id, &ip).await?;

            if tunnel_died(&ip, assigned.as_ref().map(|ssh| ssh.ip.as_str())) {
                info!(
                    "Port {:<5} -> SSH {:<15} - PROXY DIED",
                    port.port_number,
                    assigned.as_ref().map(|ssh| ssh.ip.as_str()).unwrap_or("-")
                );
                drop(tunnel.take());
                self.store.detach_ssh_from_port(id, false).await?;
                // Optionally pull the SSH out of the live pool so the next
                // assignment picks a different one; the liveness checker
                // re-judges it with its own standalone verification
                if settings.port_auto_replace_died_ssh
                    && let Some(ssh) = &assigned
                {
                    self.store.set_ssh_live(ssh.id, false).await?;
                }
                return Ok(Flow::Continue);
            }

            // Healthy; fall through to the rotation check
        } else if let Some(ssh) = &assigned {
            // Reserved but never connected: a previous pass died between
            // reservation and connect. Release so assignment can retry.
            debug!(
                "Port {:<5} -> SSH {:<15} - Releasing stale reservation",
                port.port_number, ssh.ip
            );
            self.store.detach_ssh_from_port(id, false).await?;
            return Ok(Flow::Continue);
        }

        // Assign: find a live SSH for an idle port
        if !port.is_connected {
            if !port.auto_connect {
                return Ok(Flow::Continue);
            }

            let Some(candidate) = self
                .store
                .reserve_ssh_for_port(id, settings.use_unique_ssh)
                .await?
            else {
                return Ok(Flow::Continue);
            };

            info!(
                "Port {:<5} -> SSH {:<15} - CONNECTING",
                port.port_number, candidate.ip
            );

            match self
                .driver
                .connect(
                    &candidate.ip,
                    &candidate.username,
                    &candidate.password,
                    Some(port.port_number),
                    candidate.ssh_port,
                    cancel,
                )
                .await
            {
                Ok(established) => {
                    self.store.mark_port_connected(id, candidate.id).await?;
                    *tunnel = Some(established);
                    info!(
                        "Port {:<5} -> SSH {:<15} - CONNECTED SUCCESSFULLY",
                        port.port_number, candidate.ip
                    );
                }
                Err(SshError::Cancelled) => return Ok(Flow::Exit),
                Err(err) => {
                    info!(
                        "Port {:<5} -> SSH {:<15} - CONNECTION FAILED ({err})",
                        port.port_number, candidate.ip
                    );
                    // End-to-end verification failed: erase the pairing and
                    // mark the SSH dead
                    self.store.detach_ssh_from_port(id, true).await?;
                    self.store.set_ssh_live(candidate.id, false).await?;
                }
            }
            return Ok(Flow::Continue);
        }

        // Rotate: change the exit IP once the tunnel is old enough
        if settings.auto_reset_ports
            && rotation_due(port.time_connected, settings.port_reset_interval, Utc::now())
        {
            info!("Port {:<5} - RESETTING", port.port_number);
            drop(tunnel.take());
            self.store.detach_ssh_from_port(id, false).await?;
            if settings.port_reset_delete_ssh
                && let Some(ssh) = &assigned
            {
                self.store.delete_ssh(ssh.id).await?;
            }
        }

        Ok(Flow::Continue)
    }
}

impl EntityWorker for PortWorker {
    fn kind(&self) -> &'static str {
        "port"
    }

    async fn limit(&self) -> usize {
        self.settings.read().await.port_tasks_count
    }

    async fn list_ids(&self) -> Result<Vec<i64>> {
        self.store.list_port_ids().await
    }

    async fn run(&self, id: i64, cancel: CancellationToken, gate: ConcurrencyGate) {
        let mut tunnel: Option<Tunnel> = None;

        loop {
            let flow = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.pass(id, &mut tunnel, &gate, &cancel) => match result {
                    Ok(flow) => flow,
                    Err(err) => {
                        debug!("Port {id} pass failed: {err}");
                        Flow::Continue
                    }
                }
            };

            if flow == Flow::Exit {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(PASS_INTERVAL) => {}
            }
        }

        // Guaranteed release on every exit path, cancellation included
        if let Some(tunnel) = tunnel.take() {
            tunnel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::NewSsh;

    async fn worker_fixture() -> (tempfile::TempDir, Store, SharedSettings, PortWorker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("ports.db")).await.unwrap();
        let settings = Settings::default().into_shared();
        // A driver that can never spawn: every connect attempt fails
        let driver = Arc::new(SshClient::new("definitely-not-a-real-ssh-client"));
        let worker = PortWorker::new(store.clone(), settings.clone(), driver);
        (dir, store, settings, worker)
    }

    /// Put a port into the connected state against an SSH that nothing
    /// actually serves, so the next health probe comes back empty.
    async fn connected_port(store: &Store, port_number: u16) -> (i64, i64) {
        let port_id = store.create_port(port_number, true).await.unwrap();
        let ssh_id = live_ssh(store, "1.2.3.4").await;
        let reserved = store.reserve_ssh_for_port(port_id, false).await.unwrap().unwrap();
        store.mark_port_connected(port_id, reserved.id).await.unwrap();
        (port_id, ssh_id)
    }

    async fn live_ssh(store: &Store, ip: &str) -> i64 {
        let id = store
            .create_ssh(&NewSsh {
                ip: ip.to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
                ssh_port: 22,
            })
            .await
            .unwrap()
            .unwrap();
        store.set_ssh_live(id, true).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_dead_probe_always_clears_connection() {
        let (_dir, store, settings, worker) = worker_fixture().await;
        settings.write().await.port_auto_replace_died_ssh = false;
        let (port_id, ssh_id) = connected_port(&store, 30000).await;

        let gate = ConcurrencyGate::new(4);
        let cancel = CancellationToken::new();
        let mut tunnel = None;
        let flow = worker.pass(port_id, &mut tunnel, &gate, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        // Remediation is unconditional: connection state cleared, SSH detached
        let port = store.get_port(port_id).await.unwrap().unwrap();
        assert!(!port.is_connected);
        assert!(port.time_connected.is_none());
        assert!(store.assigned_ssh(port_id).await.unwrap().is_none());
        // With auto-replace off the SSH keeps its liveness verdict
        assert!(store.get_ssh(ssh_id).await.unwrap().unwrap().is_live);
    }

    #[tokio::test]
    async fn test_dead_probe_condemns_ssh_when_auto_replace_is_on() {
        let (_dir, store, _settings, worker) = worker_fixture().await;
        let (port_id, ssh_id) = connected_port(&store, 30001).await;

        let gate = ConcurrencyGate::new(4);
        let cancel = CancellationToken::new();
        let mut tunnel = None;
        let flow = worker.pass(port_id, &mut tunnel, &gate, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert!(store.assigned_ssh(port_id).await.unwrap().is_none());
        // Out of the eligible pool until its checker verifies it again
        assert!(!store.get_ssh(ssh_id).await.unwrap().unwrap().is_live);
    }

    #[tokio::test]
    async fn test_manual_port_is_never_assigned() {
        let (_dir, store, _settings, worker) = worker_fixture().await;
        let port_id = store.create_port(30000, false).await.unwrap();
        live_ssh(&store, "1.2.3.4").await;

        let gate = ConcurrencyGate::new(4);
        let cancel = CancellationToken::new();
        let mut tunnel = None;
        let flow = worker.pass(port_id, &mut tunnel, &gate, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert!(store.assigned_ssh(port_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_detaches_and_marks_dead() {
        let (_dir, store, _settings, worker) = worker_fixture().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = live_ssh(&store, "1.2.3.4").await;

        let gate = ConcurrencyGate::new(4);
        let cancel = CancellationToken::new();
        let mut tunnel = None;
        let flow = worker.pass(port_id, &mut tunnel, &gate, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert!(tunnel.is_none());

        // End-to-end failure: pairing erased, SSH marked dead
        let ssh = store.get_ssh(ssh_id).await.unwrap().unwrap();
        assert!(!ssh.is_live);
        assert!(ssh.port_id.is_none());
        assert!(store.used_ssh_ids(port_id).await.unwrap().is_empty());

        let port = store.get_port(port_id).await.unwrap().unwrap();
        assert!(!port.is_connected);
    }

    #[tokio::test]
    async fn test_pass_on_deleted_port_exits() {
        let (_dir, _store, _settings, worker) = worker_fixture().await;

        let gate = ConcurrencyGate::new(4);
        let cancel = CancellationToken::new();
        let mut tunnel = None;
        let flow = worker.pass(9999, &mut tunnel, &gate, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Exit);
    }

    #[test]
    fn test_tunnel_died_on_empty_probe() {
        assert!(tunnel_died("", Some("1.2.3.4")));
        assert!(tunnel_died("", None));
    }

    #[test]
    fn test_tunnel_died_on_ip_mismatch() {
        assert!(tunnel_died("5.6.7.8", Some("1.2.3.4")));
        assert!(!tunnel_died("1.2.3.4", Some("1.2.3.4")));
    }

    #[test]
    fn test_tunnel_survives_without_assignment_expectation() {
        // No assigned SSH to compare against: any non-empty answer passes
        assert!(!tunnel_died("5.6.7.8", None));
    }

    #[test]
    fn test_rotation_due_boundaries() {
        let now = Utc::now();

        assert!(!rotation_due(None, 60, now));
        assert!(!rotation_due(
            Some(now - chrono::Duration::seconds(30)),
            60,
            now
        ));
        assert!(rotation_due(
            Some(now - chrono::Duration::seconds(60)),
            60,
            now
        ));
        assert!(rotation_due(
            Some(now - chrono::Duration::seconds(65)),
            60,
            now
        ));
    }
}
