use log::{info, warn};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;

use crate::db::queries::backup as backup_queries;
use crate::db::queries::nbd_export as export_queries;
use crate::models::backup::{disk_status, BackupDisk};

use super::{Export, ExportError, ImageServerSpec, ImageServerSupervisor, PortAllocator};

/// Composes the port allocator and the image-server supervisor behind a
/// single create/destroy contract. Any partial failure rolls back: a started
/// process is stopped and the port returned before the error surfaces.
pub struct ExportBroker {
    pool: Pool<Sqlite>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<dyn ImageServerSupervisor>,
}

impl ExportBroker {
    pub fn new(
        pool: Pool<Sqlite>,
        ports: Arc<PortAllocator>,
        supervisor: Arc<dyn ImageServerSupervisor>,
    ) -> Self {
        Self {
            pool,
            ports,
            supervisor,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Stand up the NBD export for one backup disk.
    pub async fn create_export(
        &self,
        vm_name: &str,
        disk: &BackupDisk,
    ) -> Result<Export, ExportError> {
        let export_name = format!("{}-disk{}", vm_name, disk.disk_index);
        let owner_key = disk.job_id.to_string();

        let port = self
            .ports
            .allocate(owner_key.as_str(), vm_name, export_name.as_str())?;

        let spec = ImageServerSpec {
            port,
            export_name: export_name.clone(),
            image_path: PathBuf::from(&disk.image_path),
            owner_key: owner_key.clone(),
            vm_name: vm_name.to_string(),
            disk_index: disk.disk_index,
        };

        let pid = match self.supervisor.start(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        if let Err(e) = export_queries::create_export(
            &self.pool,
            disk.job_id,
            disk.id,
            port as i64,
            &export_name,
            Some(pid as i64),
        )
        .await
        {
            let _ = self.supervisor.stop(port).await;
            self.ports.release(port);
            return Err(e.into());
        }

        info!(
            "Export up for job {} disk {}: port {}, export {}, pid {}",
            disk.job_id, disk.disk_index, port, export_name, pid
        );
        Ok(Export {
            port,
            export_name,
            pid,
        })
    }

    /// Tear down one export. Idempotent: a port with no server and no lease
    /// is already destroyed.
    pub async fn destroy_export(&self, port: u16) -> Result<(), ExportError> {
        self.supervisor.stop(port).await?;
        self.ports.release(port);
        export_queries::delete_export_by_port(&self.pool, port as i64).await?;
        Ok(())
    }

    /// Tear down every export belonging to a job.
    pub async fn destroy_exports_for_job(&self, job_id: i64) {
        let mut ports: Vec<u16> = self
            .ports
            .ports_for_owner(&job_id.to_string())
            .into_iter()
            .collect();

        // Rows may know about ports the allocator lost across a restart
        if let Ok(rows) = export_queries::list_exports_for_job(&self.pool, job_id).await {
            for row in rows {
                let port = row.port as u16;
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }

        for port in ports {
            if let Err(e) = self.destroy_export(port).await {
                warn!("Teardown of export on port {} failed: {}", port, e);
            }
        }
    }

    /// Startup crash recovery: kill image servers with no live backup disk
    /// and reap export rows whose process is gone. Orphan ports return to
    /// the pool simply by never being re-adopted.
    pub async fn reconcile_orphans(&self) -> Result<(), ExportError> {
        // Pass 1: processes on disk vs. live disks in the database
        let orphans = self.supervisor.find_orphans().await?;
        for orphan in &orphans {
            let keep = match orphan.port {
                Some(port) => self.export_backs_live_disk(port).await?,
                None => false,
            };
            if keep {
                // A surviving export: the allocator must know the port is
                // held so it never hands it out again.
                if let Some(port) = orphan.port {
                    if let Some(row) = export_queries::list_all_exports(&self.pool)
                        .await?
                        .into_iter()
                        .find(|r| r.port == port as i64)
                    {
                        self.ports.adopt(
                            port,
                            row.job_id.to_string(),
                            "recovered",
                            row.export_name.as_str(),
                        );
                    }
                }
                continue;
            }
            warn!(
                "Killing orphaned image server pid {} (port {:?})",
                orphan.pid, orphan.port
            );
            self.supervisor.kill_pid(orphan.pid).await?;
            if let Some(port) = orphan.port {
                self.ports.release(port);
                export_queries::delete_export_by_port(&self.pool, port as i64).await?;
            }
        }

        // Pass 2: rows with no matching process
        let live_ports = self.supervisor.running_ports().await;
        let orphan_ports: Vec<u16> = orphans.iter().filter_map(|o| o.port).collect();
        for row in export_queries::list_all_exports(&self.pool).await? {
            let port = row.port as u16;
            if live_ports.contains(&port) || orphan_ports.contains(&port) {
                continue;
            }
            info!("Reaping stale export row for port {}", port);
            export_queries::delete_export_by_port(&self.pool, row.port).await?;
            self.ports.release(port);
        }

        Ok(())
    }

    /// Whether the export on this port backs a disk that is still being
    /// written by a live job.
    async fn export_backs_live_disk(&self, port: u16) -> Result<bool, ExportError> {
        let rows = export_queries::list_all_exports(&self.pool).await?;
        let row = match rows.into_iter().find(|r| r.port == port as i64) {
            Some(row) => row,
            None => return Ok(false),
        };

        let disk = backup_queries::get_disk_by_id(&self.pool, row.backup_disk_id).await?;
        Ok(matches!(
            disk,
            Some(d) if d.status == disk_status::PENDING || d.status == disk_status::RUNNING
        ))
    }
}
