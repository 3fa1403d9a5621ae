use crate::api::ApiResponse;
use crate::courses::CourseError;
use crate::exam_service::ExamError;
use crate::llm_client::LLMError;
use crate::review_service::ReviewError;
use axum::{http::StatusCode, response::Json};
use tracing::{error, info, warn};

/// Errors surfaced by HTTP handlers, each mapped to one status code
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),

    /// Carries the user-facing message of the failed LLM call
    #[error("LLM service error: {0}")]
    LLMError(String),

    #[error("Resource already exists: {0}")]
    DuplicateResource(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Error context for structured logging
#[derive(Debug)]
pub struct ErrorContext {
    pub operation: String,
    pub resource_id: Option<String>,
    pub resource_type: String,
    pub user_friendly_message: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: &str, resource_type: &str) -> Self {
        Self {
            operation: operation.to_string(),
            resource_id: None,
            resource_type: resource_type.to_string(),
            user_friendly_message: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn with_user_message(mut self, message: &str) -> Self {
        self.user_friendly_message = Some(message.to_string());
        self
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::DuplicateResource(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::LLMError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DatabaseError(_) | ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert API error to HTTP response with consistent structure and logging
    pub fn to_response_with_context(self, context: ErrorContext) -> (StatusCode, Json<ApiResponse<()>>) {
        let status = self.status_code();

        match &self {
            ApiError::NotFound(_) => info!(
                operation = %context.operation,
                resource_type = %context.resource_type,
                resource_id = ?context.resource_id,
                error = %self,
                "Resource not found"
            ),
            ApiError::DatabaseError(_) | ApiError::InternalError(_) | ApiError::LLMError(_) => error!(
                operation = %context.operation,
                resource_type = %context.resource_type,
                resource_id = ?context.resource_id,
                error = %self,
                status = status.as_u16(),
                "Request failed"
            ),
            _ => warn!(
                operation = %context.operation,
                resource_type = %context.resource_type,
                resource_id = ?context.resource_id,
                error = %self,
                status = status.as_u16(),
                "Request rejected"
            ),
        }

        let message = match self {
            ApiError::NotFound(message)
            | ApiError::ValidationError(message)
            | ApiError::DuplicateResource(message)
            | ApiError::Conflict(message)
            | ApiError::PayloadTooLarge(message)
            | ApiError::BadRequest(message)
            | ApiError::LLMError(message) => message,
            ApiError::DatabaseError(_) => "Database operation failed. Please try again.".to_string(),
            ApiError::InternalError(_) => "An internal error occurred. Please try again.".to_string(),
        };

        (
            status,
            Json(ApiResponse::error(context.user_friendly_message.unwrap_or(message))),
        )
    }
}

/// Helper macro for structured error responses
#[macro_export]
macro_rules! api_error {
    (not_found, $operation:expr, $resource_type:expr, $id:expr) => {
        $crate::errors::ApiError::NotFound(format!("{} '{}' not found", $resource_type, $id))
            .to_response_with_context(
                $crate::errors::ErrorContext::new($operation, $resource_type).with_id(&$id.to_string()),
            )
    };

    (validation, $operation:expr, $resource_type:expr, $message:expr) => {
        $crate::errors::ApiError::ValidationError($message.to_string())
            .to_response_with_context($crate::errors::ErrorContext::new($operation, $resource_type))
    };

    (service, $operation:expr, $resource_type:expr, $error:expr) => {
        $crate::errors::classify_service_error(&$error)
            .to_response_with_context($crate::errors::ErrorContext::new($operation, $resource_type))
    };
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(anyhow::Error::from(err))
    }
}

impl From<LLMError> for ApiError {
    fn from(err: LLMError) -> Self {
        ApiError::LLMError(err.user_message().to_string())
    }
}

impl From<&CourseError> for ApiError {
    fn from(err: &CourseError) -> Self {
        match err {
            CourseError::NotFound(_) => ApiError::NotFound(err.to_string()),
            CourseError::AlreadyExists(_) => ApiError::DuplicateResource(err.to_string()),
            CourseError::Protected(_) => ApiError::BadRequest(err.to_string()),
            CourseError::EmptyName | CourseError::InvalidKnowledgeBase(_) => {
                ApiError::ValidationError(err.to_string())
            }
        }
    }
}

impl From<&ReviewError> for ApiError {
    fn from(err: &ReviewError) -> Self {
        match err {
            ReviewError::MissingFilename | ReviewError::EmptyFile | ReviewError::UnsupportedType(_) => {
                ApiError::ValidationError(err.to_string())
            }
            ReviewError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            ReviewError::NotFound(_) | ReviewError::FileMissing(_) => ApiError::NotFound(err.to_string()),
            ReviewError::AlreadyReviewed(_) => ApiError::Conflict(err.to_string()),
        }
    }
}

impl From<&ExamError> for ApiError {
    fn from(err: &ExamError) -> Self {
        match err {
            ExamError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ExamError::NoQuestionTypes => ApiError::ValidationError(err.to_string()),
            ExamError::CorruptRecord(_) => ApiError::InternalError(err.to_string()),
        }
    }
}

/// Maps a service failure to an [`ApiError`], looking for typed errors first
pub fn classify_service_error(error: &anyhow::Error) -> ApiError {
    if let Some(err) = error.downcast_ref::<LLMError>() {
        return err.clone().into();
    }
    if let Some(err) = error.downcast_ref::<CourseError>() {
        return err.into();
    }
    if let Some(err) = error.downcast_ref::<ReviewError>() {
        return err.into();
    }
    if let Some(err) = error.downcast_ref::<ExamError>() {
        return err.into();
    }
    classify_database_error(error)
}

/// Helper function to detect error types from anyhow error messages
pub fn classify_database_error(error: &anyhow::Error) -> ApiError {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("already exists") || error_str.contains("unique constraint") {
        // Extract the relevant part of the error message
        if let Some(start) = error_str.find('\'') {
            if let Some(end) = error_str[start + 1..].find('\'') {
                let identifier = &error_str[start + 1..start + 1 + end];
                return ApiError::DuplicateResource(format!("Resource '{}' already exists", identifier));
            }
        }
        ApiError::DuplicateResource("Resource already exists".to_string())
    } else if error_str.contains("no rows") {
        ApiError::NotFound("Resource not found".to_string())
    } else if error_str.contains("cannot be null") || error_str.contains("not null constraint") {
        ApiError::ValidationError("Required field is missing or invalid".to_string())
    } else {
        ApiError::DatabaseError(anyhow::anyhow!("{:#}", error))
    }
}
