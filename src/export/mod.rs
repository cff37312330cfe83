use std::path::PathBuf;
use thiserror::Error;

pub mod broker;
pub mod port_allocator;
pub mod supervisor;

pub use broker::ExportBroker;
pub use port_allocator::PortAllocator;
pub use supervisor::{ImageServerSupervisor, QemuNbdSupervisor};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No free ports in the export pool")]
    NoFreePorts,

    #[error("Port {0} is not allocated")]
    PortNotAllocated(u16),

    #[error("Image server failed: {0}")]
    ImageServerFailed(String),

    #[error("Image server on port {0} did not come up in time")]
    StartTimeout(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Everything the supervisor needs to expose one image over NBD.
#[derive(Debug, Clone)]
pub struct ImageServerSpec {
    pub port: u16,
    pub export_name: String,
    pub image_path: PathBuf,
    pub owner_key: String,
    pub vm_name: String,
    pub disk_index: i64,
}

/// The tuple that makes one backup image writable as a network block device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Export {
    pub port: u16,
    pub export_name: String,
    pub pid: u32,
}

impl Export {
    /// NBD URL the capture agent dials.
    pub fn device_url(&self, host: &str) -> String {
        format!("nbd://{}:{}/{}", host, self.port, self.export_name)
    }
}

/// A leftover image-server process discovered during startup reconciliation.
#[derive(Debug, Clone)]
pub struct OrphanProcess {
    pub pid: u32,
    pub port: Option<u16>,
}
