pub mod auth;
pub mod error;
pub mod v1;

pub use error::ApiError;
