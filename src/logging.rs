// Macros file - tracing macros are imported within the macro definitions

/// Standardized logging macros for consistent field names and message patterns across the application
///
/// These macros ensure:
/// - Consistent field naming conventions
/// - Appropriate logging levels for different scenarios
/// - Structured logging with context

// ============================================================================
// API Operation Logging Macros
// ============================================================================

/// Log the start of an API operation with consistent fields
#[macro_export]
macro_rules! log_api_start {
    ($operation:expr, username = $username:expr) => {
        tracing::debug!(
            operation = $operation,
            username = %$username,
            "API operation started"
        );
    };
    ($operation:expr, exam_id = $exam_id:expr) => {
        tracing::debug!(
            operation = $operation,
            exam_id = %$exam_id,
            "API operation started"
        );
    };
    ($operation:expr, record_id = $record_id:expr) => {
        tracing::debug!(
            operation = $operation,
            record_id = %$record_id,
            "API operation started"
        );
    };
    ($operation:expr, task_id = $task_id:expr) => {
        tracing::debug!(
            operation = $operation,
            task_id = %$task_id,
            "API operation started"
        );
    };
    ($operation:expr) => {
        tracing::debug!(
            operation = $operation,
            "API operation started"
        );
    };
}

/// Log successful completion of an API operation
#[macro_export]
macro_rules! log_api_success {
    ($operation:expr, username = $username:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            username = %$username,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, exam_id = $exam_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            exam_id = %$exam_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, record_id = $record_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            record_id = %$record_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, task_id = $task_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            task_id = %$task_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, count = $count:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            count = $count,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            "API operation completed: {}", $msg
        );
    };
}

/// Log API operation errors with consistent structure
#[macro_export]
macro_rules! log_api_error {
    ($operation:expr, exam_id = $exam_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            exam_id = %$exam_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, record_id = $record_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            record_id = %$record_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
}

/// Log API warnings with context
#[macro_export]
macro_rules! log_api_warn {
    ($operation:expr, task_id = $task_id:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            task_id = %$task_id,
            "API operation warning: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            "API operation warning: {}", $msg
        );
    };
}

// ============================================================================
// Service Layer Logging Macros
// ============================================================================

/// Log service operation start with context
#[macro_export]
macro_rules! log_service_start {
    ($service:expr, $operation:expr, item_count = $count:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            item_count = $count,
            "Service operation started"
        );
    };
    ($service:expr, $operation:expr, chapter = $chapter:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            chapter = %$chapter,
            "Service operation started"
        );
    };
    ($service:expr, $operation:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation started"
        );
    };
}

/// Log service operation success
#[macro_export]
macro_rules! log_service_success {
    ($service:expr, $operation:expr, item_count = $count:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            item_count = $count,
            duration_ms = $duration,
            "Service operation completed successfully"
        );
    };
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation completed: {}", $msg
        );
    };
}

/// Log service operation errors
#[macro_export]
macro_rules! log_service_error {
    ($service:expr, $operation:expr, error = $error:expr) => {
        tracing::error!(
            service = $service,
            operation = $operation,
            error = %$error,
            "Service operation failed"
        );
    };
}

/// Log service warnings
#[macro_export]
macro_rules! log_service_warn {
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::warn!(
            service = $service,
            operation = $operation,
            "Service warning: {}",
            $msg
        );
    };
}

// ============================================================================
// Database Operation Logging Macros
// ============================================================================

/// Log database operation performance and results
#[macro_export]
macro_rules! log_db_operation {
    (debug, $operation:expr, count = $count:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            result_count = $count,
            duration_ms = $duration,
            "Database operation completed"
        );
    };
    (info, $operation:expr, $msg:expr) => {
        tracing::info!(
            component = "database",
            operation = $operation,
            "Database operation: {}", $msg
        );
    };
    (error, $operation:expr, error = $error:expr) => {
        tracing::error!(
            component = "database",
            operation = $operation,
            error = %$error,
            "Database operation failed"
        );
    };
}

// ============================================================================
// LLM Client Logging Macros
// ============================================================================

/// Log LLM requests with endpoint context
#[macro_export]
macro_rules! log_llm_operation {
    (start, $operation:expr, model = $model:expr, attempt = $attempt:expr, max_attempts = $max:expr) => {
        tracing::info!(
            component = "llm_client",
            operation = $operation,
            model = %$model,
            attempt = $attempt,
            max_attempts = $max,
            "LLM request started"
        );
    };
    (success, $operation:expr, model = $model:expr, duration_ms = $duration:expr, response_length = $len:expr) => {
        tracing::info!(
            component = "llm_client",
            operation = $operation,
            model = %$model,
            duration_ms = $duration,
            response_length = $len,
            "LLM request completed successfully"
        );
    };
    (error, $operation:expr, model = $model:expr, error = $error:expr, retry_count = $retry:expr) => {
        tracing::error!(
            component = "llm_client",
            operation = $operation,
            model = %$model,
            error = %$error,
            retry_count = $retry,
            "LLM request failed"
        );
    };
    (warn, $operation:expr, $msg:expr) => {
        tracing::warn!(
            component = "llm_client",
            operation = $operation,
            "LLM request warning: {}", $msg
        );
    };
}

// ============================================================================
// Task Tracker Logging Macros
// ============================================================================

/// Log background task lifecycle events
#[macro_export]
macro_rules! log_task_event {
    (submitted, task_id = $task_id:expr) => {
        tracing::info!(
            component = "task_tracker",
            task_id = %$task_id,
            "Task submitted"
        );
    };
    (running, task_id = $task_id:expr) => {
        tracing::debug!(
            component = "task_tracker",
            task_id = %$task_id,
            "Task running"
        );
    };
    (completed, task_id = $task_id:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            component = "task_tracker",
            task_id = %$task_id,
            duration_ms = $duration,
            "Task completed"
        );
    };
    (failed, task_id = $task_id:expr, error = $error:expr) => {
        tracing::error!(
            component = "task_tracker",
            task_id = %$task_id,
            error = %$error,
            "Task failed"
        );
    };
    (swept, count = $count:expr) => {
        tracing::info!(
            component = "task_tracker",
            evicted = $count,
            "Expired tasks evicted"
        );
    };
}

// ============================================================================
// System Event Logging Macros
// ============================================================================

/// Log system startup and shutdown events
#[macro_export]
macro_rules! log_system_event {
    (startup, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "startup",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (shutdown, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "shutdown",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (config, $msg:expr) => {
        tracing::info!(event_type = "configuration", "System event: {}", $msg);
    };
}

// ============================================================================
// Validation Logging Macros
// ============================================================================

/// Log validation results consistently
#[macro_export]
macro_rules! log_validation {
    (success, $component:expr, $msg:expr) => {
        tracing::debug!(
            event_type = "validation",
            component = $component,
            result = "success",
            "Validation completed: {}", $msg
        );
    };
    (failure, $component:expr, error = $error:expr) => {
        tracing::warn!(
            event_type = "validation",
            component = $component,
            result = "failure",
            error = %$error,
            "Validation failed"
        );
    };
}
