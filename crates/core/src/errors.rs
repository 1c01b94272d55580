use thiserror::Error;

use crate::domain::actor::Role;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("a note is required for `{action}`")]
    MissingNote { action: String },
    #[error("required field `{field}` is missing for agreement `{agreement_type}`")]
    MissingRequiredField { agreement_type: String, field: String },
    #[error("{0}")]
    Invalid(String),
}

/// Failure taxonomy of the funnel. Every variant except `Conflict` means nothing was
/// written; `Conflict` means the state moved and the caller should re-read and re-decide.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FunnelError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),
    #[error("role `{}` is not allowed to {action}", .role.as_str())]
    Authorization { role: Role, action: String },
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FunnelError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} `{id}`"))
    }

    pub fn forbidden(role: Role, action: impl Into<String>) -> Self {
        Self::Authorization { role, action: action.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authorization { .. } => "authorization",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Funnel(#[from] FunnelError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ValidationFailure> for ApplicationError {
    fn from(failure: ValidationFailure) -> Self {
        Self::Funnel(FunnelError::Validation(failure))
    }
}

impl ApplicationError {
    pub fn funnel(&self) -> Option<&FunnelError> {
        match self {
            Self::Funnel(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "Your role does not allow this action.",
            Self::NotFound { .. } => "The requested record does not exist or is not applicable.",
            Self::Conflict { .. } => {
                "The record changed while you were working. Refresh it and decide again."
            }
            Self::Unprocessable { .. } => "The funnel configuration change is not valid.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Forbidden { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::Unprocessable { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Unprocessable { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Funnel(error) => {
                let message = error.to_string();
                match error {
                    FunnelError::Validation(_) => Self::BadRequest { message, correlation_id },
                    FunnelError::Authorization { .. } => Self::Forbidden { message, correlation_id },
                    FunnelError::NotFound(_) => Self::NotFound { message, correlation_id },
                    FunnelError::Conflict(_) => Self::Conflict { message, correlation_id },
                    FunnelError::Config(_) => Self::Unprocessable { message, correlation_id },
                }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
