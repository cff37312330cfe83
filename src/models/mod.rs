pub mod backup;
pub mod chain;
pub mod nbd_export;
pub mod repository;
pub mod restore_mount;
pub mod tracker;
