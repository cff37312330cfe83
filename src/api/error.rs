use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::{json, Json};
use serde_json::Value;

use crate::chain::ChainError;
use crate::image::ImageError;
use crate::repository::RepositoryError;
use crate::restore::RestoreError;
use crate::tracker::TrackerError;
use crate::workflow::WorkflowError;

/// Stable machine-readable error surfaced by every API endpoint as
/// `{"error": <code>, "message": <text>}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: Status,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Status, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, "VALIDATION", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::InternalServerError, "INTERNAL", message)
    }

    fn body(&self) -> Value {
        json!({ "error": self.code, "message": self.message })
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let body = Json(self.body());
        (self.status, body).respond_to(request)
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let message = e.to_string();
        match e {
            WorkflowError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            WorkflowError::Validation(_) => Self::new(Status::BadRequest, "VALIDATION", message),
            WorkflowError::ParentMissing(_) => {
                Self::new(Status::Conflict, "PARENT_MISSING", message)
            }
            WorkflowError::Conflict(_) => Self::new(Status::Conflict, "CONFLICT", message),
            WorkflowError::AgentUnreachable(_) => {
                Self::new(Status::BadGateway, "CAPTURE_AGENT_UNREACHABLE", message)
            }
            WorkflowError::Timeout(_) => Self::new(Status::GatewayTimeout, "TIMEOUT", message),
            WorkflowError::Cancelled => Self::new(Status::Conflict, "CANCELLED", message),
            WorkflowError::Repository(inner) => inner.into(),
            WorkflowError::Chain(inner) => inner.into(),
            WorkflowError::Export(_) => {
                Self::new(Status::BadGateway, "IMAGE_SERVER_FAILED", message)
            }
            WorkflowError::Tracker(inner) => inner.into(),
            WorkflowError::Database(_) | WorkflowError::Internal(_) => {
                Self::new(Status::InternalServerError, "INTERNAL", message)
            }
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        let message = e.to_string();
        match e {
            RepositoryError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            RepositoryError::Disabled(_) => Self::new(Status::Conflict, "CONFLICT", message),
            RepositoryError::InsufficientSpace(_) => Self::new(
                Status::InsufficientStorage,
                "INSUFFICIENT_SPACE",
                message,
            ),
            RepositoryError::RetentionLocked(_) => {
                Self::new(Status::Locked, "RETENTION_LOCKED", message)
            }
            RepositoryError::DependencyPresent(_) => {
                Self::new(Status::Conflict, "DEPENDENCY_PRESENT", message)
            }
            RepositoryError::Unsupported(_) | RepositoryError::Config(_) => {
                Self::new(Status::BadRequest, "VALIDATION", message)
            }
            RepositoryError::Image(inner) => inner.into(),
            RepositoryError::Mount(_) => {
                Self::new(Status::BadGateway, "IMAGE_SERVER_FAILED", message)
            }
            RepositoryError::Database(_) | RepositoryError::Io(_) => {
                Self::new(Status::InternalServerError, "INTERNAL", message)
            }
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        let message = e.to_string();
        match e {
            ChainError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            ChainError::AlreadyExists { .. } | ChainError::Conflict(_) => {
                Self::new(Status::Conflict, "CONFLICT", message)
            }
            ChainError::Broken { .. } => {
                Self::new(Status::Conflict, "CHAIN_BROKEN", message)
            }
            ChainError::DependencyPresent(_) => {
                Self::new(Status::Conflict, "DEPENDENCY_PRESENT", message)
            }
            ChainError::Image(inner) => inner.into(),
            ChainError::Database(_) => Self::new(Status::InternalServerError, "INTERNAL", message),
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(e: ImageError) -> Self {
        let message = e.to_string();
        match e {
            ImageError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            ImageError::CorruptImage { .. } => {
                Self::new(Status::UnprocessableEntity, "CORRUPT_IMAGE", message)
            }
            ImageError::MissingBackingFile { .. } => {
                Self::new(Status::UnprocessableEntity, "CORRUPT_IMAGE", message)
            }
            ImageError::Timeout(_) => Self::new(Status::GatewayTimeout, "TIMEOUT", message),
            _ => Self::new(Status::InternalServerError, "INTERNAL", message),
        }
    }
}

impl From<RestoreError> for ApiError {
    fn from(e: RestoreError) -> Self {
        let message = e.to_string();
        match e {
            RestoreError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            RestoreError::Conflict(_) => Self::new(Status::Conflict, "CONFLICT", message),
            RestoreError::NoCapacity => {
                Self::new(Status::ServiceUnavailable, "NO_CAPACITY", message)
            }
            RestoreError::InvalidPath(_) => Self::new(Status::BadRequest, "VALIDATION", message),
            RestoreError::MountFailed(_) => {
                Self::new(Status::BadGateway, "IMAGE_SERVER_FAILED", message)
            }
            RestoreError::Timeout(_) => Self::new(Status::GatewayTimeout, "TIMEOUT", message),
            RestoreError::Archive(_) | RestoreError::Io(_) | RestoreError::Database(_) => {
                Self::new(Status::InternalServerError, "INTERNAL", message)
            }
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        let message = e.to_string();
        match e {
            TrackerError::NotFound(_) => Self::new(Status::NotFound, "NOT_FOUND", message),
            _ => Self::new(Status::InternalServerError, "INTERNAL", message),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        Self::internal(e.to_string())
    }
}
