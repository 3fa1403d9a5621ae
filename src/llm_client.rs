use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::config::LLMConfig;
use crate::log_llm_operation;
use crate::sanitize::clean_llm_output;

/// Failure modes of a chat-completion call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LLMError {
    #[error("LLM request timed out")]
    TimedOut,

    #[error("could not connect to the LLM service")]
    ConnectionFailed,

    #[error("LLM service returned HTTP {0}")]
    ServiceError(u16),

    #[error("LLM service returned a malformed response")]
    MalformedResponse,
}

impl LLMError {
    /// Message suitable for showing to a learner
    pub fn user_message(&self) -> &'static str {
        match self {
            LLMError::TimedOut => "The AI service took too long to respond. Please try again later.",
            LLMError::ConnectionFailed => {
                "Cannot connect to the AI service. Please make sure the Ollama service is running."
            }
            LLMError::ServiceError(_) => "The AI service is temporarily unavailable. Please try again later.",
            LLMError::MalformedResponse => "The AI service returned an unexpected response format.",
        }
    }
}

/// URL and model of the chat endpoint, changeable at runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub api_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<LLMMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Debug, Deserialize)]
struct TagsModel {
    name: String,
}

#[derive(Clone)]
pub struct LLMClient {
    http: Client,
    endpoint: Arc<RwLock<Endpoint>>,
    api_key: Option<String>,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl LLMClient {
    pub fn new(config: &LLMConfig) -> Self {
        Self {
            http: Client::new(),
            endpoint: Arc::new(RwLock::new(Endpoint {
                api_url: config.api_url.clone(),
                model: config.model.clone(),
            })),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries.max(1),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Delay before the second attempt after a timeout; doubles on each further attempt
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_endpoint(&self, api_url: &str, model: &str) {
        let mut endpoint = self.endpoint.write().unwrap_or_else(PoisonError::into_inner);
        endpoint.api_url = api_url.to_string();
        endpoint.model = model.to_string();
    }

    pub fn model_name(&self) -> String {
        self.endpoint().model
    }

    /// Sends one user prompt and returns the sanitized reply.
    ///
    /// Timeouts are retried with exponential backoff, non-success statuses are retried
    /// immediately, and a refused connection fails at once.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LLMError> {
        let endpoint = self.endpoint();
        let request_body = ChatRequest {
            model: &endpoint.model,
            messages: vec![LLMMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            options: ChatOptions {
                num_predict: max_tokens,
                temperature: 0.7,
            },
        };

        let mut last_error = LLMError::ServiceError(0);
        for attempt in 0..self.max_retries {
            log_llm_operation!(
                start,
                "complete",
                model = endpoint.model,
                attempt = attempt + 1,
                max_attempts = self.max_retries
            );
            let started = Instant::now();

            let mut request = self
                .http
                .post(&endpoint.api_url)
                .timeout(self.timeout)
                .json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    last_error = LLMError::TimedOut;
                    log_llm_operation!(warn, "complete", format!("request timed out (attempt {})", attempt + 1));
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
                    }
                    continue;
                }
                Err(e) if e.is_connect() => {
                    log_llm_operation!(error, "complete", model = endpoint.model, error = e, retry_count = attempt);
                    return Err(LLMError::ConnectionFailed);
                }
                Err(e) => {
                    log_llm_operation!(error, "complete", model = endpoint.model, error = e, retry_count = attempt);
                    last_error = LLMError::ConnectionFailed;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
                log_llm_operation!(
                    error,
                    "complete",
                    model = endpoint.model,
                    error = format!("HTTP {}: {}", status, error_text),
                    retry_count = attempt
                );
                last_error = LLMError::ServiceError(status.as_u16());
                continue;
            }

            let body: ChatResponse = match response.json().await {
                Ok(body) => body,
                Err(e) if e.is_timeout() => {
                    last_error = LLMError::TimedOut;
                    continue;
                }
                Err(e) => {
                    log_llm_operation!(error, "complete", model = endpoint.model, error = e, retry_count = attempt);
                    return Err(LLMError::MalformedResponse);
                }
            };

            let content = body
                .message
                .and_then(|message| message.content)
                .map(|content| clean_llm_output(&content))
                .filter(|content| !content.is_empty())
                .ok_or(LLMError::MalformedResponse)?;

            log_llm_operation!(
                success,
                "complete",
                model = endpoint.model,
                duration_ms = started.elapsed().as_millis() as u64,
                response_length = content.len()
            );
            return Ok(content);
        }

        Err(last_error)
    }

    /// Names of the models installed on the endpoint's server
    pub async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        self.list_models_at(&self.endpoint().api_url).await
    }

    pub async fn list_models_at(&self, api_url: &str) -> Result<Vec<String>, LLMError> {
        let tags_url = tags_url(api_url).ok_or(LLMError::ConnectionFailed)?;

        let response = self
            .http
            .get(tags_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { LLMError::TimedOut } else { LLMError::ConnectionFailed })?;

        if !response.status().is_success() {
            return Err(LLMError::ServiceError(response.status().as_u16()));
        }

        let tags: TagsResponse = response.json().await.map_err(|_| LLMError::MalformedResponse)?;
        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }

    /// Sends a tiny probe prompt to a candidate endpoint without touching the active one
    pub async fn test_connection(&self, api_url: &str, model: &str) -> Result<String, LLMError> {
        let probe = LLMClient {
            http: self.http.clone(),
            endpoint: Arc::new(RwLock::new(Endpoint {
                api_url: api_url.to_string(),
                model: model.to_string(),
            })),
            api_key: self.api_key.clone(),
            timeout: self.timeout,
            max_retries: 1,
            backoff_base: self.backoff_base,
        };
        probe.complete("Hello", 10).await
    }
}

fn tags_url(api_url: &str) -> Option<Url> {
    let mut url = Url::parse(api_url).ok()?;
    url.set_path("/api/tags");
    url.set_query(None);
    Some(url)
}

/// Pulls a JSON document out of a reply that may wrap it in prose or code fences
pub fn extract_json_from_response(content: &str) -> String {
    if let Some(start) = content.find("```json") {
        if let Some(end) = content[start + 7..].find("```") {
            let json_start = start + 7;
            return content[json_start..json_start + end].trim().to_string();
        }
    }

    if let Some(start) = content.find("```") {
        if let Some(end) = content[start + 3..].find("```") {
            let candidate = content[start + 3..start + 3 + end].trim();
            if candidate.starts_with('{') || candidate.starts_with('[') {
                return candidate.to_string();
            }
        }
    }

    // Whichever bracket opens first decides between an array and an object
    let array_first = match (content.find('['), content.find('{')) {
        (Some(array), Some(object)) => array < object,
        (Some(_), None) => true,
        _ => false,
    };
    let delimiters = if array_first { [('[', ']'), ('{', '}')] } else { [('{', '}'), ('[', ']')] };

    for (open, close) in delimiters {
        if let (Some(start), Some(end)) = (content.find(open), content.rfind(close)) {
            if end > start {
                return content[start..=end].to_string();
            }
        }
    }

    content.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        hits: Arc<AtomicUsize>,
        last_body: Arc<Mutex<Option<Value>>>,
        last_auth: Arc<Mutex<Option<String>>>,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/chat", addr)
    }

    fn client(api_url: &str, timeout_secs: u64) -> LLMClient {
        LLMClient::new(&LLMConfig {
            api_url: api_url.to_string(),
            model: "qwen3:14b".to_string(),
            api_key: Some("secret-key".to_string()),
            timeout_secs,
            max_retries: 3,
        })
        .with_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_complete_sends_chat_payload_and_cleans_reply() {
        let recorder = Recorder::default();
        let app = Router::new()
            .route(
                "/api/chat",
                post(|State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    rec.hits.fetch_add(1, Ordering::SeqCst);
                    *rec.last_body.lock().unwrap() = Some(body);
                    *rec.last_auth.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Json(json!({"message": {"role": "assistant", "content": "  \u{201C}hi\u{201D} eval(x)\u{200B} "}}))
                }),
            )
            .with_state(recorder.clone());
        let url = serve(app).await;

        let reply = client(&url, 5).complete("Explain joins", 256).await.unwrap();
        assert_eq!(reply, "\"hi\" eval_SAFE(x)");

        let body = recorder.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "qwen3:14b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Explain joins");
        assert_eq!(recorder.last_auth.lock().unwrap().as_deref(), Some("Bearer secret-key"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let recorder = Recorder::default();
        let app = Router::new()
            .route(
                "/api/chat",
                post(|State(rec): State<Recorder>| async move {
                    rec.hits.fetch_add(1, Ordering::SeqCst);
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "model crashed")
                }),
            )
            .with_state(recorder.clone());
        let url = serve(app).await;

        let result = client(&url, 5).complete("prompt", 10).await;
        assert_eq!(result, Err(LLMError::ServiceError(500)));
        assert_eq!(recorder.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_reported() {
        let recorder = Recorder::default();
        let app = Router::new()
            .route(
                "/api/chat",
                post(|State(rec): State<Recorder>| async move {
                    rec.hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Json(json!({"message": {"content": "late"}}))
                }),
            )
            .with_state(recorder.clone());
        let url = serve(app).await;

        let result = client(&url, 1).complete("prompt", 10).await;
        assert_eq!(result, Err(LLMError::TimedOut));
        assert_eq!(recorder.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connection_refused_fails_immediately() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = client(&format!("http://{}/api/chat", addr), 5).complete("prompt", 10).await;
        assert_eq!(result, Err(LLMError::ConnectionFailed));
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let app = Router::new().route("/api/chat", post(|| async { Json(json!({"done": true})) }));
        let url = serve(app).await;

        let result = client(&url, 5).complete("prompt", 10).await;
        assert_eq!(result, Err(LLMError::MalformedResponse));
    }

    #[tokio::test]
    async fn test_list_models_reads_tags() {
        let app = Router::new().route(
            "/api/tags",
            axum::routing::get(|| async { Json(json!({"models": [{"name": "qwen3:14b"}, {"name": "llama3"}]})) }),
        );
        let url = serve(app).await;

        let models = client(&url, 5).list_models().await.unwrap();
        assert_eq!(models, vec!["qwen3:14b", "llama3"]);
    }

    #[test]
    fn test_set_endpoint_replaces_url_and_model() {
        let client = client("http://127.0.0.1:11434/api/chat", 5);
        client.set_endpoint("http://10.0.0.5:11434/api/chat", "llama3");
        assert_eq!(
            client.endpoint(),
            Endpoint {
                api_url: "http://10.0.0.5:11434/api/chat".to_string(),
                model: "llama3".to_string()
            }
        );
    }

    #[test]
    fn test_extract_json_from_response() {
        assert_eq!(extract_json_from_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json_from_response("Here:\n```\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(extract_json_from_response("Sure! {\"a\": {\"b\": 2}} hope it helps"), "{\"a\": {\"b\": 2}}");
        assert_eq!(extract_json_from_response("list: [\"x\"]"), "[\"x\"]");
        assert_eq!(extract_json_from_response("  no json here "), "no json here");
    }

    #[test]
    fn test_extract_json_keeps_unfenced_arrays_of_objects() {
        let array = r#"[{"content": "Q1", "answer": "A1"}, {"content": "Q2", "answer": "A2"}]"#;
        assert_eq!(extract_json_from_response(array), array);

        let reply = format!("Here are the questions: {}\nGood luck!", array);
        let extracted = extract_json_from_response(&reply);
        assert_eq!(extracted, array);
        let items: Vec<serde_json::Value> = serde_json::from_str(&extracted).unwrap();
        assert_eq!(items.len(), 2);

        let object = r#"{"subject": "OS", "chapters": {"Ch 1": {"mainConcepts": ["Process"]}}}"#;
        assert_eq!(extract_json_from_response(&format!("Course: {}", object)), object);
    }

    #[test]
    fn test_every_error_has_a_user_message() {
        for error in [
            LLMError::TimedOut,
            LLMError::ConnectionFailed,
            LLMError::ServiceError(502),
            LLMError::MalformedResponse,
        ] {
            assert!(!error.user_message().is_empty());
        }
    }
}
