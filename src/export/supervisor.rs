use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{ExportError, ImageServerSpec, OrphanProcess};

/// Bounded wait for the server socket to accept connections after spawn.
const START_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervises out-of-process image servers, one per export port.
///
/// The server is an external binary on purpose: a crash in the format
/// handler must not take down the control plane, and restart recovery can
/// enumerate leftovers by process name and port. A died server is never
/// restarted; its death is the owning job's failure.
#[async_trait]
pub trait ImageServerSupervisor: Send + Sync {
    /// Spawn an image server for the spec and return its PID.
    async fn start(&self, spec: &ImageServerSpec) -> Result<u32, ExportError>;

    /// Stop the server on a port: signal, bounded wait, then force-kill.
    /// Stopping an unknown port is a no-op.
    async fn stop(&self, port: u16) -> Result<(), ExportError>;

    /// Ports with a live supervised process.
    async fn running_ports(&self) -> Vec<u16>;

    /// Scan the OS for image-server processes in our port range that we are
    /// not supervising (crash leftovers).
    async fn find_orphans(&self) -> Result<Vec<OrphanProcess>, ExportError>;

    /// Force-kill an arbitrary PID (orphan reconciliation).
    async fn kill_pid(&self, pid: u32) -> Result<(), ExportError>;
}

struct Supervised {
    child: Child,
    pid: u32,
}

/// qemu-nbd implementation of the supervisor.
pub struct QemuNbdSupervisor {
    binary: String,
    pid_dir: PathBuf,
    port_range: Range<u16>,
    children: Mutex<HashMap<u16, Supervised>>,
}

impl QemuNbdSupervisor {
    pub fn new(binary: impl Into<String>, pid_dir: impl Into<PathBuf>, port_range: Range<u16>) -> Self {
        Self {
            binary: binary.into(),
            pid_dir: pid_dir.into(),
            port_range,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn pid_file(&self, port: u16) -> PathBuf {
        self.pid_dir.join(format!("qemu-nbd-{}.pid", port))
    }

    async fn write_pid_file(&self, port: u16, pid: u32) {
        if let Err(e) = tokio::fs::create_dir_all(&self.pid_dir).await {
            warn!("Cannot create pid dir {}: {}", self.pid_dir.display(), e);
            return;
        }
        if let Err(e) = tokio::fs::write(self.pid_file(port), pid.to_string()).await {
            warn!("Cannot write pid file for port {}: {}", port, e);
        }
    }

    async fn remove_pid_file(&self, port: u16) {
        let _ = tokio::fs::remove_file(self.pid_file(port)).await;
    }

    /// Poll the TCP socket until the server accepts or the child dies.
    async fn await_listening(&self, child: &mut Child, port: u16) -> Result<(), ExportError> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(ExportError::StartTimeout(port));
            }
            if let Some(status) = child.try_wait()? {
                return Err(ExportError::ImageServerFailed(format!(
                    "qemu-nbd exited during startup with {}",
                    status
                )));
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl ImageServerSupervisor for QemuNbdSupervisor {
    async fn start(&self, spec: &ImageServerSpec) -> Result<u32, ExportError> {
        let mut children = self.children.lock().await;
        if children.contains_key(&spec.port) {
            return Err(ExportError::ImageServerFailed(format!(
                "port {} already has a running image server",
                spec.port
            )));
        }

        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg("qcow2")
            .arg("-x")
            .arg(&spec.export_name)
            .arg("-p")
            .arg(spec.port.to_string())
            .arg("-b")
            .arg("127.0.0.1")
            .arg("-t")
            .arg(&spec.image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| ExportError::ImageServerFailed("spawned process has no pid".into()))?;

        if let Err(e) = self.await_listening(&mut child, spec.port).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        self.write_pid_file(spec.port, pid).await;
        info!(
            "Started image server pid {} on port {} exporting {} ({})",
            pid,
            spec.port,
            spec.export_name,
            spec.image_path.display()
        );

        children.insert(spec.port, Supervised { child, pid });
        Ok(pid)
    }

    async fn stop(&self, port: u16) -> Result<(), ExportError> {
        let supervised = {
            let mut children = self.children.lock().await;
            children.remove(&port)
        };

        let mut supervised = match supervised {
            Some(s) => s,
            None => return Ok(()),
        };

        // SIGTERM first so qemu-nbd can flush and close the export cleanly
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(supervised.pid.to_string())
            .status()
            .await;

        match tokio::time::timeout(STOP_TIMEOUT, supervised.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Image server on port {} exited with {}", port, status);
            }
            Ok(Err(e)) => {
                warn!("Waiting for image server on port {}: {}", port, e);
            }
            Err(_) => {
                warn!(
                    "Image server on port {} ignored SIGTERM, force-killing pid {}",
                    port, supervised.pid
                );
                let _ = supervised.child.kill().await;
            }
        }

        self.remove_pid_file(port).await;
        Ok(())
    }

    async fn running_ports(&self) -> Vec<u16> {
        let mut children = self.children.lock().await;
        let mut dead = Vec::new();
        for (port, supervised) in children.iter_mut() {
            if let Ok(Some(_)) = supervised.child.try_wait() {
                dead.push(*port);
            }
        }
        for port in &dead {
            children.remove(port);
        }
        children.keys().copied().collect()
    }

    async fn find_orphans(&self) -> Result<Vec<OrphanProcess>, ExportError> {
        let supervised: Vec<u32> = {
            let children = self.children.lock().await;
            children.values().map(|s| s.pid).collect()
        };

        let output = Command::new("pgrep").arg("-a").arg("qemu-nbd").output().await?;
        // pgrep exits 1 when nothing matches
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let mut orphans = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.split_whitespace();
            let pid = match parts.next().and_then(|p| p.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            if supervised.contains(&pid) {
                continue;
            }

            let cmdline: Vec<&str> = parts.collect();
            let port = cmdline
                .windows(2)
                .find(|w| w[0] == "-p")
                .and_then(|w| w[1].parse::<u16>().ok())
                .filter(|p| self.port_range.contains(p));

            // Only processes in our port range are ours to reap
            if port.is_some() {
                orphans.push(OrphanProcess { pid, port });
            }
        }
        Ok(orphans)
    }

    async fn kill_pid(&self, pid: u32) -> Result<(), ExportError> {
        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .await?;
        if !status.success() {
            warn!("kill -9 {} exited with {}", pid, status);
        }
        Ok(())
    }
}
