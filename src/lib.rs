pub mod api;
pub mod config;
pub mod courses;
pub mod database;
pub mod errors;
pub mod exam_service;
pub mod explanation_cache;
pub mod knowledge_base;
pub mod learning_service;
pub mod llm_client;
pub mod llm_service;
pub mod logging;
pub mod models;
pub mod review_service;
pub mod sanitize;
pub mod settings;
pub mod tasks;

pub use api::{create_router, AppState};
pub use config::Config;
pub use database::Database;
pub use errors::*;
pub use llm_client::{LLMClient, LLMError};
pub use llm_service::LLMService;
pub use tasks::TaskTracker;
