use rocket::routes;

pub mod backups;
pub mod jobs;
pub mod repositories;
pub mod restore;

use backups::*;
use jobs::*;
use repositories::*;
use restore::*;

pub fn routes() -> Vec<rocket::Route> {
    routes![
        // backups
        start_backup,
        get_backup,
        list_backups,
        get_backup_chain,
        complete_backup_disk,
        fail_backup_disk,
        record_backup_telemetry,
        cancel_backup,
        delete_backup,
        validate_backup_chain,
        // tracked jobs
        get_tracked_job,
        // restore
        mount_backup,
        list_restore_files,
        download_restore_file,
        download_restore_directory,
        unmount_restore,
        list_restore_mounts,
        // repositories
        list_repositories,
        get_repository,
        create_repository,
        set_repository_enabled,
        delete_repository,
    ]
}
