use colored::Colorize;
use log::{error, info, warn};
use rocket::{self, get, routes};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod api;
mod chain;
pub mod config;
mod db;
mod db_manager;
mod export;
mod image;
mod logging;
mod models;
mod repository;
mod restore;
mod tracker;
mod workflow;

use api::auth::AuthConfig;
use chain::ChainManager;
use db_manager::DatabaseManager;
use export::{ExportBroker, PortAllocator, QemuNbdSupervisor};
use image::{ImageDriver, Qcow2Driver};
use repository::RepositoryManager;
use restore::mount_manager::MountSettings;
use restore::{NbdDevicePool, RestoreMountManager, SystemMountBackend};
use tracker::JobTracker;
use workflow::engine::EngineSettings;
use workflow::{BackupWorkflowEngine, CaptureAgent, CaptureAgentClient};

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse {
    status: String,
    message: String,
}

#[get("/health")]
async fn health_check() -> rocket::serde::json::Json<ApiResponse> {
    rocket::serde::json::Json(ApiResponse {
        status: "ok".to_string(),
        message: "Service is healthy".to_string(),
    })
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::init();

    logging::print_banner("OmniVault Backup Hub", |s| s.bright_green());

    let config = config::SERVER_CONFIG.clone();

    let db = DatabaseManager::new(&config.database_path).await?;
    let pool = db.get_main_pool().clone();

    let driver: Arc<dyn ImageDriver> = Arc::new(Qcow2Driver::new(config.qemu_img_binary.clone()));
    let repositories = Arc::new(RepositoryManager::new(pool.clone(), driver.clone()));
    let chains = Arc::new(ChainManager::new(pool.clone(), driver.clone()));

    let ports = Arc::new(PortAllocator::new(config.nbd_port_range()));
    let supervisor = Arc::new(QemuNbdSupervisor::new(
        config.qemu_nbd_binary.clone(),
        config.pid_dir.clone(),
        config.nbd_port_range(),
    ));
    let broker = Arc::new(ExportBroker::new(pool.clone(), ports.clone(), supervisor));

    let agent: Arc<dyn CaptureAgent> = Arc::new(CaptureAgentClient::new(config.agent_url.clone()));
    let job_tracker = Arc::new(JobTracker::with_default_sinks(pool.clone()));

    let engine = Arc::new(BackupWorkflowEngine::new(
        pool.clone(),
        repositories.clone(),
        chains.clone(),
        broker,
        agent,
        job_tracker.clone(),
        EngineSettings {
            callback_base_url: config.callback_base_url.clone(),
            nbd_host: "127.0.0.1".to_string(),
            job_timeout: Duration::from_secs(config.job_timeout_minutes.max(1) as u64 * 60),
        },
    ));

    let mounts = Arc::new(RestoreMountManager::new(
        pool.clone(),
        NbdDevicePool::new(config.restore_device_count),
        Arc::new(SystemMountBackend::new(config.qemu_nbd_binary.clone())),
        MountSettings {
            mount_root: config.restore_mount_root.clone().into(),
            ttl: chrono::Duration::minutes(config.restore_mount_ttl_minutes),
            idle_timeout: chrono::Duration::minutes(config.restore_idle_timeout_minutes),
        },
    ));

    // Crash recovery before anything can allocate: adopt surviving restore
    // mounts, fail jobs orphaned by the restart, reconcile processes/ports.
    logging::print_section("startup recovery");
    if let Err(e) = mounts.adopt_existing_mounts().await {
        warn!("Adopting existing restore mounts failed: {}", e);
    }
    if let Err(e) = engine.recover_interrupted_jobs().await {
        error!("Startup job recovery failed: {}", e);
    }

    spawn_background_tasks(&config, mounts.clone(), repositories.clone());

    info!(
        "Control API listening on {}:{}, export ports {:?}",
        config.address,
        config.port,
        config.nbd_port_range()
    );

    let address: std::net::IpAddr = config.address.parse()?;
    let _rocket = rocket::build()
        .configure(rocket::Config {
            port: config.port,
            address,
            ..Default::default()
        })
        .manage(pool)
        .manage(repositories)
        .manage(chains)
        .manage(engine)
        .manage(mounts)
        .manage(job_tracker)
        .manage(AuthConfig {
            jwt_secret: config.auth_secret.clone(),
        })
        .mount("/", routes![health_check])
        .mount("/api/v1", api::v1::routes())
        .launch()
        .await?;

    Ok(())
}

/// Periodic sweeps: the idle-mount reaper and the immutability-flag pass.
/// Sweep errors are logged and never abort the service.
fn spawn_background_tasks(
    config: &config::ServerConfig,
    mounts: Arc<RestoreMountManager>,
    repositories: Arc<RepositoryManager>,
) {
    let reaper_interval = config.restore_cleanup_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(reaper_interval));
        loop {
            ticker.tick().await;
            let reaped = mounts.cleanup_expired().await;
            if reaped > 0 {
                info!("Mount reaper collected {} idle mounts", reaped);
            }
        }
    });

    let sweep_interval = config.retention_sweep_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            repositories.retention_sweep().await;
        }
    });
}
