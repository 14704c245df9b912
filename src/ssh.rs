use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SshError;
use crate::net;
use crate::probe::IpProber;

/// Probe attempts used to verify a freshly forwarded proxy end-to-end
const VERIFY_PROBE_TRIES: u32 = 3;

/// Classification of one line of SSH client output while awaiting forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineClass {
    /// Dynamic SOCKS forwarding is active
    ForwardingReady,
    /// The server rejected the credentials
    AuthFailed,
    /// The client reported an unrecoverable error
    Fatal,
    /// Anything else (verbose chatter, host key prompts)
    Noise,
}

pub(crate) fn classify_line(line: &str) -> LineClass {
    if line.contains("SOCKS dynamic forwarding") {
        LineClass::ForwardingReady
    } else if line.contains("Password authentication failed") || line.contains("Access denied") {
        LineClass::AuthFailed
    } else if line.contains("FATAL ERROR") {
        LineClass::Fatal
    } else {
        LineClass::Noise
    }
}

/// Pids of every SSH client child the driver currently owns.
///
/// Tunnel handles unregister themselves on teardown; whatever is left at
/// shutdown gets killed in one sweep so no child outlives the engine.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRegistry {
    fn register(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
    }

    fn unregister(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.remove(&pid);
        }
    }

    /// Number of children currently tracked
    pub fn tracked(&self) -> usize {
        self.pids.lock().map(|pids| pids.len()).unwrap_or(0)
    }

    /// Kill every tracked child. Called once at shutdown, after the tasks
    /// owning the tunnels have been joined.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = match self.pids.lock() {
            Ok(mut pids) => pids.drain().collect(),
            Err(_) => return,
        };

        for pid in pids {
            debug!("Killing leftover SSH client process {pid}");
            kill_pid(pid);
        }
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

/// A live SSH connection exposing a local SOCKS5 listener.
///
/// The handle exclusively owns the child process: dropping it kills the
/// child on every exit path, including cancellation.
#[derive(Debug)]
pub struct Tunnel {
    local_port: u16,
    egress_ip: String,
    child: Option<Child>,
    pid: Option<u32>,
    registry: ProcessRegistry,
    // Held open so the client never sees EOF on its confirmation prompt
    // or EPIPE on its verbose output while the tunnel is carried
    _stdin: ChildStdin,
    _stdout: ChildStdout,
    _stderr: ChildStderr,
}

impl Tunnel {
    /// Local port the SOCKS5 listener is bound to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Egress IP observed during establishment
    pub fn egress_ip(&self) -> &str {
        &self.egress_ip
    }

    /// SOCKS5 address of the listener, reachable from this machine
    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.local_port)
    }

    /// Graceful teardown: kill the child and reap it.
    pub async fn close(mut self) {
        if let Some(pid) = self.pid.take() {
            self.registry.unregister(pid);
        }
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.kill().await
        {
            debug!("Error killing SSH client: {e}");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            self.registry.unregister(pid);
        }
        if let Some(mut child) = self.child.take() {
            // kill_on_drop is set as a backstop; signal eagerly so the
            // listener port frees before the runtime reaps the child.
            let _ = child.start_kill();
        }
    }
}

/// Driver for an external SSH client binary with plink-compatible flags.
///
/// One `connect` spawns `<client> [-P <port>] <user>@<host> -pw <password>
/// -D 0.0.0.0:<local_port> -v`, feeds host-key confirmations on stdin,
/// scans output until forwarding is reported active, then verifies the
/// proxy end-to-end before handing out the [`Tunnel`].
#[derive(Debug, Clone)]
pub struct SshClient {
    client_path: String,
    connect_timeout: Duration,
    prober: IpProber,
    registry: ProcessRegistry,
}

impl SshClient {
    /// Create a new driver around the given client binary
    pub fn new(client_path: impl Into<String>) -> Self {
        Self {
            client_path: client_path.into(),
            connect_timeout: Duration::from_secs(30),
            prober: IpProber::default(),
            registry: ProcessRegistry::default(),
        }
    }

    /// Override the deadline for one connect attempt
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Registry of child processes this driver has spawned
    pub fn registry(&self) -> ProcessRegistry {
        self.registry.clone()
    }

    /// Establish one SOCKS5 tunnel backed by one SSH authentication.
    ///
    /// With `local_port = None` a free ephemeral port is chosen. The attempt
    /// observes `cancel` at every stage and returns [`SshError::Cancelled`]
    /// with the child already terminated when it fires.
    pub async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
        local_port: Option<u16>,
        ssh_port: u16,
        cancel: &CancellationToken,
    ) -> Result<Tunnel, SshError> {
        let port = match local_port {
            Some(port) => port,
            None => net::free_port()
                .await
                .ok_or_else(|| SshError::Spawn("No free local port available".to_string()))?,
        };

        let started = Instant::now();
        let run_time = move || format!("{:4.1}", started.elapsed().as_secs_f32());

        let target = format!("{username}@{host}");
        let args = build_args(&target, password, port, ssh_port);

        let mut cmd = Command::new(&self.client_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SshError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SshError::Spawn("SSH client stdin unavailable".to_string()))?;
        // Auto-accept host keys; the client may prompt several times
        if let Err(e) = stdin.write_all(&b"y\n".repeat(50)).await {
            debug!("{host:>15} | {port:<5} - stdin write failed: {e}");
        }
        let _ = stdin.flush().await;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SshError::Spawn("SSH client stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SshError::Spawn("SSH client stderr unavailable".to_string()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;

        let deadline = sleep(self.connect_timeout);
        tokio::pin!(deadline);

        // Await the forwarding-active report, failing fast on fatal output
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(SshError::Cancelled);
                }
                _ = &mut deadline => {
                    debug!("{host:>15} | {port:<5} ({}s) - Handshake timed out", run_time());
                    terminate(&mut child).await;
                    return Err(SshError::HandshakeTimeout);
                }
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => format!("SSH client exited with {status}"),
                        Err(e) => format!("SSH client wait failed: {e}"),
                    };
                    debug!("{host:>15} | {port:<5} ({}s) - {detail}", run_time());
                    return Err(SshError::NetworkUnreachable(detail));
                }
                line = out_lines.next_line(), if !out_done => {
                    match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            out_done = true;
                            None
                        }
                    }
                }
                line = err_lines.next_line(), if !err_done => {
                    match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            err_done = true;
                            None
                        }
                    }
                }
            };

            let Some(line) = line else { continue };
            match classify_line(&line) {
                LineClass::ForwardingReady => break,
                LineClass::AuthFailed => {
                    debug!("{host:>15} | {port:<5} ({}s) - {line}", run_time());
                    terminate(&mut child).await;
                    return Err(SshError::AuthFailed);
                }
                LineClass::Fatal => {
                    debug!("{host:>15} | {port:<5} ({}s) - {line}", run_time());
                    terminate(&mut child).await;
                    return Err(SshError::NetworkUnreachable(line));
                }
                LineClass::Noise => {}
            }
        }

        // Forwarding is up; require an end-to-end egress probe before
        // handing the tunnel out
        let proxy_url = format!("socks5://127.0.0.1:{port}");
        let egress_ip = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(SshError::Cancelled);
            }
            ip = self.prober.probe(&proxy_url, VERIFY_PROBE_TRIES) => ip,
        };

        if egress_ip.is_empty() {
            debug!("{host:>15} | {port:<5} ({}s) - Cannot connect through proxy", run_time());
            terminate(&mut child).await;
            return Err(SshError::ProxyUnusable);
        }

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(pid);
        }
        debug!("{host:>15} | {port:<5} ({}s) - Connected successfully", run_time());

        Ok(Tunnel {
            local_port: port,
            egress_ip,
            child: Some(child),
            pid,
            registry: self.registry.clone(),
            _stdin: stdin,
            _stdout: out_lines.into_inner().into_inner(),
            _stderr: err_lines.into_inner().into_inner(),
        })
    }

    /// Check whether the credentials can carry a working tunnel:
    /// connect on an ephemeral port, then tear straight down.
    pub async fn verify(
        &self,
        host: &str,
        username: &str,
        password: &str,
        ssh_port: u16,
        cancel: &CancellationToken,
    ) -> bool {
        match self.connect(host, username, password, None, ssh_port, cancel).await {
            Ok(tunnel) => {
                tunnel.close().await;
                true
            }
            Err(err) => {
                if !err.is_cancelled() {
                    debug!("{host:>15} - Verification failed: {err}");
                }
                false
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Error killing SSH client process: {e}");
    }
}

/// Build the client argument list:
/// `[-P <ssh_port>] <user>@<host> -pw <password> -D 0.0.0.0:<local_port> -v`
fn build_args(target: &str, password: &str, local_port: u16, ssh_port: u16) -> Vec<String> {
    let mut args = Vec::new();
    if ssh_port != 22 {
        args.push("-P".to_string());
        args.push(ssh_port.to_string());
    }
    args.push(target.to_string());
    args.push("-pw".to_string());
    args.push(password.to_string());
    args.push("-D".to_string());
    args.push(format!("0.0.0.0:{local_port}"));
    args.push("-v".to_string());
    args
}
