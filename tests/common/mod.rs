#![allow(dead_code)]

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use axum_test::TestServer;
use learning_assistant::config::{
    Config, DatabaseConfig, LLMConfig, LoggingConfig, ServerConfig, StorageConfig, TaskConfig,
};
use learning_assistant::{create_router, AppState, Database};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const FAILING_CONCEPT: &str = "FAIL_ME";

pub const KNOWLEDGE_BASE: &str = r#"{
    "科目": "Database Systems",
    "章节": {
        "Chapter 1 Introduction": {
            "mainConcepts": ["DBMS", "Data model"],
            "mainContents": ["Three-schema architecture"]
        },
        "Chapter 2 Relational Model": {
            "mainConcepts": ["Relation", "Primary key"],
            "mainContents": ["Relational algebra", "FAIL_ME"]
        }
    }
}"#;

pub const EXAM_TEMPLATE: &str = r#"{
    "考试信息": {
        "题型列表": [
            {"题型名称": "Multiple choice", "题量": 2, "总分": 20, "考查重点": "Core definitions"},
            {"题型名称": "Short answer", "题量": 3, "总分": 30, "答题要求": "Answer in full sentences"}
        ]
    }
}"#;

/// Counts requests to the in-process chat endpoint
#[derive(Clone, Default)]
pub struct MockLlm {
    pub chat_calls: Arc<AtomicUsize>,
}

impl MockLlm {
    pub fn calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }
}

async fn mock_chat(State(mock): State<MockLlm>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    mock.chat_calls.fetch_add(1, Ordering::SeqCst);
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();

    if prompt.contains(FAILING_CONCEPT) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "model crashed"})));
    }

    let content = if prompt.contains("Respond with a JSON array") {
        json!([
            {"content": "Which component manages stored data?", "options": ["A. DBMS", "B. Compiler"], "answer": "A", "analysis": "The DBMS manages data."},
            {"content": "Define a relation.", "options": [], "answer": "A set of tuples", "analysis": "Relations are sets."}
        ])
        .to_string()
    } else if prompt.contains("Grade the following exam paper") {
        "1. Correct.\n2. The definition of a key is incorrect.\nOverall solid work.\nTotal: 87".to_string()
    } else if prompt.contains("Give a student study advice") {
        "Review primary keys first, then practise normalisation.".to_string()
    } else if prompt.contains("curriculum designer") {
        format!(
            "Here is the course:\n```json\n{}\n```",
            json!({
                "subject": "Operating Systems",
                "chapters": {
                    "Chapter 1 Processes": {"mainConcepts": ["Process", "Thread"], "mainContents": ["Scheduling"]}
                }
            })
        )
    } else {
        "## 1. Definition\nA clear explanation.".to_string()
    };

    (
        StatusCode::OK,
        Json(json!({"message": {"role": "assistant", "content": content}, "done": true})),
    )
}

async fn mock_tags() -> Json<Value> {
    Json(json!({"models": [{"name": "qwen3:14b"}, {"name": "llama3:8b"}]}))
}

/// Starts the mock LLM on an ephemeral port and returns its chat URL
pub async fn spawn_mock_llm() -> (String, MockLlm) {
    let mock = MockLlm::default();
    let app = Router::new()
        .route("/api/chat", post(mock_chat))
        .route("/api/tags", get(mock_tags))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api/chat", addr), mock)
}

pub fn test_config(dir: &Path, llm_url: &str) -> Config {
    let data_dir = dir.join("data");
    Config {
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        llm: LLMConfig {
            api_url: llm_url.to_string(),
            model: "qwen3:14b".to_string(),
            api_key: None,
            timeout_secs: 5,
            max_retries: 1,
        },
        server: ServerConfig {
            port: 5000,
            host: "127.0.0.1".to_string(),
        },
        storage: StorageConfig {
            upload_dir: dir.join("uploads"),
            knowledge_base_file: data_dir.join("knowledge_base.json"),
            exam_template_file: data_dir.join("exam_template.json"),
            courses_dir: data_dir.join("courses"),
            default_course: "Database Systems".to_string(),
            max_upload_bytes: 64 * 1024,
            data_dir,
        },
        tasks: TaskConfig {
            workers: 2,
            max_age_hours: 24,
            sweep_interval_secs: 3600,
            batch_delay_ms: 0,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            file_enabled: false,
            console_enabled: false,
            log_directory: dir.join("logs").display().to_string(),
        },
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub llm: MockLlm,
    pub config: Config,
    pub dir: TempDir,
}

/// A full application over a temp directory, an in-memory database and a mock LLM
pub async fn spawn_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let (llm_url, llm) = spawn_mock_llm().await;
    let config = test_config(dir.path(), &llm_url);

    tokio::fs::create_dir_all(&config.storage.data_dir).await.unwrap();
    tokio::fs::write(&config.storage.knowledge_base_file, KNOWLEDGE_BASE).await.unwrap();
    tokio::fs::write(&config.storage.exam_template_file, EXAM_TEMPLATE).await.unwrap();

    let db = Database::new(&config.database.url).await.unwrap();
    let state = AppState::new(&config, db).await;
    let server = TestServer::new(create_router(state.clone())).unwrap();

    TestApp {
        server,
        state,
        llm,
        config,
        dir,
    }
}

/// Polls a task until it reaches a terminal status
pub async fn wait_for_task(server: &TestServer, task_id: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server.get(&format!("/api/tasks/{}/status", task_id)).await.json();
        let status = body["data"]["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return body["data"].clone();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("task {} did not finish", task_id);
}
