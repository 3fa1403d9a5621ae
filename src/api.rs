use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::Config,
    courses::{CourseService, FileCourseRepository},
    database::Database,
    errors::{classify_service_error, ApiError, ErrorContext},
    exam_service::ExamService,
    explanation_cache::ExplanationCache,
    learning_service::LearningService,
    llm_client::LLMClient,
    llm_service::LLMService,
    models::*,
    review_service::ReviewService,
    settings::{SettingsDefaults, SettingsStore},
    tasks::{TaskSnapshot, TaskTracker},
};

use crate::{api_error, log_api_error, log_api_start, log_api_success, log_api_warn};

pub const DEFAULT_USERNAME: &str = "anonymous";
const USERNAME_HEADER: &str = "x-username";
const USERNAME_COOKIE: &str = "username";

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub llm: LLMService,
    pub settings: Arc<SettingsStore>,
    pub courses: CourseService,
    pub learning: LearningService,
    pub exams: Arc<ExamService>,
    pub reviews: Arc<ReviewService>,
    pub tasks: TaskTracker,
    pub required_files: Vec<PathBuf>,
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Wires every service from configuration. The persisted settings decide the
    /// active LLM endpoint once they exist.
    pub async fn new(config: &Config, db: Database) -> Self {
        let storage = &config.storage;

        let settings = Arc::new(
            SettingsStore::open(
                storage.settings_file(),
                SettingsDefaults {
                    llm_api_url: config.llm.api_url.clone(),
                    llm_model: config.llm.model.clone(),
                    current_course: storage.default_course.clone(),
                },
            )
            .await,
        );

        let client = LLMClient::new(&config.llm);
        let current = settings.get().await;
        client.set_endpoint(&current.llm_api_url, &current.llm_model);
        let llm = LLMService::new(client);

        let repo = Arc::new(FileCourseRepository::new(
            storage.default_course.clone(),
            storage.knowledge_base_file.clone(),
            storage.courses_dir.clone(),
        ));
        let courses = CourseService::new(repo, settings.clone(), llm.clone());

        let learning = LearningService::new(
            db.clone(),
            llm.clone(),
            ExplanationCache::new(storage.explanation_cache_dir()),
            courses.clone(),
            config.tasks.batch_delay(),
        );
        let exams = Arc::new(ExamService::new(
            db.clone(),
            llm.clone(),
            settings.clone(),
            storage.exam_template_file.clone(),
            storage.upload_dir.clone(),
        ));
        let reviews = Arc::new(ReviewService::new(
            db.clone(),
            llm.clone(),
            courses.clone(),
            storage.upload_dir.clone(),
            storage.max_upload_bytes,
        ));

        Self {
            db,
            llm,
            settings,
            courses,
            learning,
            exams,
            reviews,
            tasks: TaskTracker::new(config.tasks.workers, config.tasks.max_age()),
            required_files: vec![storage.knowledge_base_file.clone(), storage.exam_template_file.clone()],
            max_upload_bytes: storage.max_upload_bytes,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ErrorResponse = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ErrorResponse>;

/// Display name of the caller: `X-Username` header, then the `username` cookie,
/// then `anonymous`.
#[derive(Debug, Clone, PartialEq)]
pub struct Username(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Username {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Username(username_from_headers(&parts.headers)))
    }
}

fn username_from_headers(headers: &HeaderMap) -> String {
    let non_empty = |name: &str| Some(name.trim().to_string()).filter(|name| !name.is_empty());

    headers
        .get(USERNAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(non_empty)
        .or_else(|| {
            CookieJar::from_headers(headers)
                .get(USERNAME_COOKIE)
                .and_then(|cookie| non_empty(cookie.value()))
        })
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string())
}

fn username_cookie(username: String) -> Cookie<'static> {
    Cookie::build((USERNAME_COOKIE, username))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .permanent()
        .build()
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::ValidationError(format!("'{}' is required", field)))
}

fn service_error(operation: &str, resource_type: &str, error: &anyhow::Error) -> ErrorResponse {
    api_error!(service, operation, resource_type, *error)
}

// Knowledge base endpoints

pub async fn get_chapters(State(state): State<AppState>) -> ApiResult<Value> {
    log_api_start!("get_chapters");
    let overview = state.learning.chapters().await;
    log_api_success!("get_chapters", count = overview.chapters.len(), "chapters listed");
    Ok(Json(ApiResponse::success(json!({
        "subject": overview.subject,
        "chapters": overview.chapters,
    }))))
}

pub async fn get_chapter_content(
    State(state): State<AppState>,
    Path(chapter): Path<String>,
) -> ApiResult<crate::learning_service::ChapterContent> {
    match state.learning.chapter_content(&chapter).await {
        Some(content) => Ok(Json(ApiResponse::success(content))),
        None => Err(api_error!(not_found, "get_chapter_content", "Chapter", chapter)),
    }
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub keyword: Option<String>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Value> {
    let Some(keyword) = params.keyword.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) else {
        return Err(api_error!(validation, "search", "knowledge_base", "'keyword' is required"));
    };

    let results = state.learning.search(&keyword).await;
    debug!(keyword = %keyword, hits = results.len(), "Knowledge base searched");
    Ok(Json(ApiResponse::success(json!({
        "keyword": keyword,
        "results": results,
    }))))
}

// Explanation endpoints

async fn explain_with(
    state: &AppState,
    username: &str,
    request: ExplainRequest,
    regenerate: bool,
) -> ApiResult<crate::learning_service::Explanation> {
    let operation = if regenerate { "regenerate_explanation" } else { "explain" };
    let (chapter, concept) = match (required(request.chapter, "chapter"), required(request.concept, "concept")) {
        (Ok(chapter), Ok(concept)) => (chapter, concept),
        (Err(e), _) | (_, Err(e)) => {
            return Err(e.to_response_with_context(ErrorContext::new(operation, "explanation")));
        }
    };

    log_api_start!(operation, username = username);
    let result = if regenerate {
        state
            .learning
            .regenerate(username, &chapter, &concept, request.concept_type)
            .await
    } else {
        state
            .learning
            .explain(username, &chapter, &concept, request.concept_type)
            .await
    };

    match result {
        Ok(explanation) => {
            log_api_success!(operation, username = username, "explanation ready");
            Ok(Json(ApiResponse::success(explanation)))
        }
        Err(e) => {
            log_api_error!(operation, error = e, "explanation failed");
            Err(classify_service_error(&e)
                .to_response_with_context(ErrorContext::new(operation, "explanation").with_id(&concept)))
        }
    }
}

pub async fn explain(
    State(state): State<AppState>,
    Username(username): Username,
    Json(request): Json<ExplainRequest>,
) -> ApiResult<crate::learning_service::Explanation> {
    explain_with(&state, &username, request, false).await
}

pub async fn regenerate_explanation(
    State(state): State<AppState>,
    Username(username): Username,
    Json(request): Json<ExplainRequest>,
) -> ApiResult<crate::learning_service::Explanation> {
    explain_with(&state, &username, request, true).await
}

// Batch explanation endpoints

pub async fn batch_explain_chapter(
    State(state): State<AppState>,
    Json(request): Json<BatchChapterRequest>,
) -> ApiResult<Value> {
    let chapter = required(request.chapter, "chapter")
        .map_err(|e| e.to_response_with_context(ErrorContext::new("batch_explain_chapter", "task")))?;

    let learning = state.learning.clone();
    let job_chapter = chapter.clone();
    let task_id = state.tasks.submit(move |reporter| async move {
        let outcome = learning.batch_explain_chapter(&job_chapter, &reporter).await?;
        Ok(serde_json::to_value(outcome)?)
    });

    log_api_success!("batch_explain_chapter", task_id = task_id, "batch task submitted");
    Ok(Json(ApiResponse::success(json!({
        "task_id": task_id,
        "message": format!("Batch explanation started for '{}'", chapter),
    }))))
}

pub async fn batch_explain_all(State(state): State<AppState>) -> ApiResult<Value> {
    let learning = state.learning.clone();
    let task_id = state.tasks.submit(move |reporter| async move {
        let outcome = learning.batch_explain_all(&reporter).await?;
        Ok(serde_json::to_value(outcome)?)
    });

    log_api_success!("batch_explain_all", task_id = task_id, "batch task submitted");
    Ok(Json(ApiResponse::success(json!({
        "task_id": task_id,
        "message": "Batch explanation started for every chapter",
    }))))
}

pub async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskSnapshot> {
    let snapshot = Uuid::parse_str(&task_id).ok().and_then(|id| state.tasks.get(&id));
    match snapshot {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        None => {
            log_api_warn!("get_task_status", "task not found");
            Err(ApiError::NotFound(format!("Task '{}' not found", task_id))
                .to_response_with_context(ErrorContext::new("get_task_status", "task").with_id(&task_id)))
        }
    }
}

pub async fn get_progress(
    State(state): State<AppState>,
    Username(username): Username,
) -> ApiResult<LearningProgress> {
    state
        .learning
        .progress(&username)
        .await
        .map(|progress| Json(ApiResponse::success(progress)))
        .map_err(|e| service_error("get_progress", "learning_record", &e))
}

// Exam endpoints

pub async fn get_question_types(State(state): State<AppState>) -> ApiResult<Value> {
    let question_types = state.exams.question_types().await;
    Ok(Json(ApiResponse::success(json!({ "question_types": question_types }))))
}

pub async fn generate_exam(
    State(state): State<AppState>,
    Username(username): Username,
    Json(request): Json<GenerateExamRequest>,
) -> ApiResult<Value> {
    if request.chapters.is_empty() {
        return Err(ApiError::ValidationError("Select at least one chapter".to_string())
            .to_response_with_context(ErrorContext::new("generate_exam", "exam")));
    }

    log_api_start!("generate_exam", username = username);
    let created = state
        .exams
        .create_exam(&username, &request.chapters, &request.question_types)
        .await
        .map_err(|e| service_error("generate_exam", "exam", &e))?;

    let generated = state
        .exams
        .generate_questions(&created.exam_id, request.use_ai)
        .await
        .map_err(|e| {
            log_api_error!("generate_exam", exam_id = created.exam_id, error = e, "question generation failed");
            classify_service_error(&e)
                .to_response_with_context(ErrorContext::new("generate_exam", "exam").with_id(&created.exam_id))
        })?;

    log_api_success!("generate_exam", exam_id = created.exam_id, "exam generated");
    Ok(Json(ApiResponse::success(json!({
        "exam_id": created.exam_id,
        "record_id": created.record_id,
        "exam_paper": generated.exam_paper,
        "formatted_paper": generated.formatted_paper,
        "answer_key": generated.answer_key,
    }))))
}

pub async fn download_exam(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<Response, ErrorResponse> {
    log_api_start!("download_exam", exam_id = exam_id);
    let context = || ErrorContext::new("download_exam", "exam").with_id(&exam_id);

    let rendered = state
        .exams
        .render_stored(&exam_id)
        .await
        .map_err(|e| classify_service_error(&e).to_response_with_context(context()))?;
    let text = rendered.full_text();
    let saved = state
        .exams
        .save_exam_file(&exam_id, &text)
        .await
        .map_err(|e| classify_service_error(&e).to_response_with_context(context()))?;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", saved.filename))
        .map_err(|e| ApiError::InternalError(e.to_string()).to_response_with_context(context()))?;

    log_api_success!("download_exam", exam_id = exam_id, "exam paper sent");
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        text,
    )
        .into_response())
}

pub async fn get_exam_history(
    State(state): State<AppState>,
    Username(username): Username,
) -> ApiResult<Vec<ExamRecord>> {
    state
        .exams
        .history(&username)
        .await
        .map(|records| Json(ApiResponse::success(records)))
        .map_err(|e| service_error("get_exam_history", "exam", &e))
}

// Review endpoints

pub async fn upload_exam(
    State(state): State<AppState>,
    Username(username): Username,
    mut multipart: Multipart,
) -> ApiResult<crate::review_service::UploadedExam> {
    let context = || ErrorContext::new("upload_exam", "review_record");
    let multipart_error = |e: axum::extract::multipart::MultipartError| {
        let error = if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!("Upload exceeds the {} byte limit", state.max_upload_bytes))
        } else {
            ApiError::BadRequest(e.body_text())
        };
        error.to_response_with_context(context())
    };

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(ApiError::ValidationError("No file was selected".to_string()).to_response_with_context(context()));
    };

    log_api_start!("upload_exam", username = username);
    match state.reviews.upload(&username, &filename, &bytes).await {
        Ok(uploaded) => {
            log_api_success!("upload_exam", record_id = uploaded.record_id, "exam file stored");
            Ok(Json(ApiResponse::success(uploaded)))
        }
        Err(e) => Err(classify_service_error(&e).to_response_with_context(context().with_id(&filename))),
    }
}

pub async fn parse_exam(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
) -> ApiResult<crate::review_service::ParsedExam> {
    state
        .reviews
        .parse(record_id)
        .await
        .map(|parsed| Json(ApiResponse::success(parsed)))
        .map_err(|e| {
            classify_service_error(&e)
                .to_response_with_context(ErrorContext::new("parse_exam", "review_record").with_id(&record_id.to_string()))
        })
}

pub async fn review_exam(
    State(state): State<AppState>,
    Json(request): Json<ReviewExamRequest>,
) -> ApiResult<crate::review_service::ReviewOutcome> {
    let Some(record_id) = request.record_id else {
        return Err(ApiError::ValidationError("'record_id' is required".to_string())
            .to_response_with_context(ErrorContext::new("review_exam", "review_record")));
    };

    log_api_start!("review_exam", record_id = record_id);
    match state.reviews.review(record_id).await {
        Ok(outcome) => {
            log_api_success!("review_exam", record_id = record_id, "exam reviewed");
            Ok(Json(ApiResponse::success(outcome)))
        }
        Err(e) => {
            log_api_error!("review_exam", record_id = record_id, error = e, "review failed");
            Err(classify_service_error(&e)
                .to_response_with_context(ErrorContext::new("review_exam", "review_record").with_id(&record_id.to_string())))
        }
    }
}

pub async fn get_review_history(
    State(state): State<AppState>,
    Username(username): Username,
) -> ApiResult<Vec<ReviewRecord>> {
    state
        .reviews
        .history(&username)
        .await
        .map(|records| Json(ApiResponse::success(records)))
        .map_err(|e| service_error("get_review_history", "review_record", &e))
}

// Identity endpoints

pub async fn get_username(Username(username): Username) -> ApiResult<Value> {
    Ok(Json(ApiResponse::success(json!({ "username": username }))))
}

pub async fn set_username(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<SetUsernameRequest>,
) -> Result<(CookieJar, Json<ApiResponse<Value>>), ErrorResponse> {
    let context = || ErrorContext::new("set_username", "user");
    let username = request.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::ValidationError("Username must not be empty".to_string()).to_response_with_context(context()));
    }

    let user = state
        .db
        .get_or_create_user(&username)
        .await
        .map_err(|e| classify_service_error(&e).to_response_with_context(context()))?;

    log_api_success!("set_username", username = username, "username set");
    Ok((
        jar.add(username_cookie(username)),
        Json(ApiResponse::success(json!({ "username": user.username }))),
    ))
}

// Settings endpoints

pub async fn get_settings(State(state): State<AppState>) -> ApiResult<crate::settings::Settings> {
    Ok(Json(ApiResponse::success(state.settings.get().await)))
}

#[derive(Deserialize)]
pub struct ModelListParams {
    pub api_url: Option<String>,
}

pub async fn list_models(
    State(state): State<AppState>,
    Query(params): Query<ModelListParams>,
) -> ApiResult<Value> {
    let api_url = match params.api_url.filter(|url| !url.trim().is_empty()) {
        Some(url) => url,
        None => state.settings.get().await.llm_api_url,
    };

    match state.llm.client().list_models_at(&api_url).await {
        Ok(models) => Ok(Json(ApiResponse::success(json!({ "api_url": api_url, "models": models })))),
        Err(e) => Err(ApiError::from(e).to_response_with_context(ErrorContext::new("list_models", "llm_endpoint").with_id(&api_url))),
    }
}

fn endpoint_from(request: LLMEndpointRequest, operation: &str) -> Result<(String, String), ErrorResponse> {
    let context = || ErrorContext::new(operation, "llm_endpoint");
    let api_url = required(request.api_url, "api_url").map_err(|e| e.to_response_with_context(context()))?;
    let model = required(request.model_name, "model_name").map_err(|e| e.to_response_with_context(context()))?;

    if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
        return Err(ApiError::ValidationError("'api_url' must start with http:// or https://".to_string())
            .to_response_with_context(context()));
    }
    Ok((api_url, model))
}

pub async fn test_llm_endpoint(
    State(state): State<AppState>,
    Json(request): Json<LLMEndpointRequest>,
) -> ApiResult<Value> {
    let (api_url, model) = endpoint_from(request, "test_llm_endpoint")?;

    match state.llm.client().test_connection(&api_url, &model).await {
        Ok(reply) => Ok(Json(ApiResponse::success(json!({
            "message": "Connection succeeded",
            "response": reply,
        })))),
        Err(e) => Err(ApiError::from(e)
            .to_response_with_context(ErrorContext::new("test_llm_endpoint", "llm_endpoint").with_id(&api_url))),
    }
}

pub async fn save_llm_endpoint(
    State(state): State<AppState>,
    Json(request): Json<LLMEndpointRequest>,
) -> ApiResult<crate::settings::Settings> {
    let (api_url, model) = endpoint_from(request, "save_llm_endpoint")?;

    let saved = state
        .settings
        .update_llm(&api_url, &model)
        .await
        .map_err(|e| service_error("save_llm_endpoint", "settings", &e))?;
    state.llm.client().set_endpoint(&api_url, &model);

    info!(api_url = %api_url, model = %model, "LLM endpoint switched");
    Ok(Json(ApiResponse::success(saved)))
}

// Course endpoints

pub async fn list_courses(State(state): State<AppState>) -> ApiResult<Value> {
    let courses = state
        .courses
        .list()
        .await
        .map_err(|e| service_error("list_courses", "course", &e))?;
    let current = state.courses.current().await;
    log_api_success!("list_courses", count = courses.len(), "courses listed");
    Ok(Json(ApiResponse::success(json!({
        "courses": courses,
        "current_course": current,
    }))))
}

pub async fn create_course(
    State(state): State<AppState>,
    Json(request): Json<CreateCourseRequest>,
) -> ApiResult<crate::courses::CreatedCourse> {
    log_api_start!("create_course");
    let created = match request.knowledge_base {
        Some(knowledge_base) => {
            state
                .courses
                .create(&request.name, &request.description, Some(knowledge_base))
                .await
        }
        None => state.courses.create_with_ai(&request.name, &request.description).await,
    };
    created
        .map(|created| {
            log_api_success!("create_course", "course created");
            Json(ApiResponse::success(created))
        })
        .map_err(|e| {
            classify_service_error(&e)
                .to_response_with_context(ErrorContext::new("create_course", "course").with_id(&request.name))
        })
}

pub async fn delete_course(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    state
        .courses
        .delete(&name)
        .await
        .map(|()| Json(ApiResponse::success(json!({ "deleted": name }))))
        .map_err(|e| {
            classify_service_error(&e).to_response_with_context(ErrorContext::new("delete_course", "course").with_id(&name))
        })
}

pub async fn get_current_course(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(Json(ApiResponse::success(json!({
        "current_course": state.courses.current().await,
    }))))
}

pub async fn set_current_course(
    State(state): State<AppState>,
    Json(request): Json<SetCurrentCourseRequest>,
) -> ApiResult<Value> {
    let name = required(request.course_name, "course_name")
        .map_err(|e| e.to_response_with_context(ErrorContext::new("set_current_course", "course")))?;

    state
        .courses
        .set_current(&name)
        .await
        .map(|current| Json(ApiResponse::success(json!({ "current_course": current }))))
        .map_err(|e| {
            classify_service_error(&e)
                .to_response_with_context(ErrorContext::new("set_current_course", "course").with_id(&name))
        })
}

// Health

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = match state.db.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let mut files = serde_json::Map::new();
    let mut files_ok = true;
    for path in &state.required_files {
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        files_ok &= exists;
        files.insert(path.display().to_string(), json!(if exists { "ok" } else { "missing" }));
    }

    let healthy = database == "ok" && files_ok;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    if !healthy {
        log_api_warn!("health_check", "service unhealthy");
    }

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "database": database,
            "files": files,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

pub fn create_router(state: AppState) -> Router {
    // Leave headroom so oversized files reach the upload check and get a 413 from it
    let body_limit = state.max_upload_bytes.saturating_add(64 * 1024);

    Router::new()
        // Knowledge base
        .route("/api/chapters", get(get_chapters))
        .route("/api/chapters/:chapter/content", get(get_chapter_content))
        .route("/api/search", get(search))
        // Explanations
        .route("/api/explain", post(explain))
        .route("/api/regenerate-explain", post(regenerate_explanation))
        .route("/api/batch-explain-chapter", post(batch_explain_chapter))
        .route("/api/batch-explain-all", post(batch_explain_all))
        .route("/api/tasks/:task_id/status", get(get_task_status))
        .route("/api/progress", get(get_progress))
        // Exams
        .route("/api/exam/question-types", get(get_question_types))
        .route("/api/generate-exam", post(generate_exam))
        .route("/api/download-exam/:exam_id", get(download_exam))
        .route("/api/exam-history", get(get_exam_history))
        // Reviews
        .route("/api/upload-exam", post(upload_exam))
        .route("/api/parse-exam/:record_id", get(parse_exam))
        .route("/api/review-exam", post(review_exam))
        .route("/api/review-history", get(get_review_history))
        // Identity
        .route("/api/get-username", get(get_username))
        .route("/api/set-username", post(set_username))
        // Settings
        .route("/api/settings", get(get_settings))
        .route("/api/settings/ollama/models", get(list_models))
        .route("/api/settings/ollama/test", post(test_llm_endpoint))
        .route("/api/settings/ollama/save", post(save_llm_endpoint))
        // Courses
        .route("/api/courses", get(list_courses))
        .route("/api/courses/create", post(create_course))
        .route("/api/courses/:name/delete", delete(delete_course))
        .route("/api/courses/current", get(get_current_course).post(set_current_course))
        .route("/api/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
