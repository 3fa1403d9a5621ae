use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Runtime settings persisted as a small JSON document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub llm_api_url: String,
    pub llm_model: String,
    pub current_course: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values used when no settings document exists yet
#[derive(Debug, Clone)]
pub struct SettingsDefaults {
    pub llm_api_url: String,
    pub llm_model: String,
    pub current_course: String,
}

// Every field optional so partially written documents still load
#[derive(Debug, Deserialize)]
struct StoredSettings {
    llm_api_url: Option<String>,
    llm_model: Option<String>,
    current_course: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads the settings document at `path`, falling back to `defaults` when
    /// the file is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>, defaults: SettingsDefaults) -> Self {
        let path = path.into();
        let settings = load(&path, &defaults).await;
        Self {
            path,
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn current_course(&self) -> String {
        self.current.read().await.current_course.clone()
    }

    pub async fn set_current_course(&self, course_name: &str) -> Result<Settings> {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.current_course = course_name.to_string();
        next.updated_at = Utc::now();

        save(&self.path, &next).await?;
        *current = next.clone();

        info!(course = %course_name, "Current course updated");
        Ok(next)
    }

    pub async fn update_llm(&self, api_url: &str, model: &str) -> Result<Settings> {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.llm_api_url = api_url.to_string();
        next.llm_model = model.to_string();
        next.updated_at = Utc::now();

        save(&self.path, &next).await?;
        *current = next.clone();

        info!(api_url = %api_url, model = %model, "LLM endpoint settings updated");
        Ok(next)
    }
}

async fn load(path: &Path, defaults: &SettingsDefaults) -> Settings {
    let now = Utc::now();
    let fallback = Settings {
        llm_api_url: defaults.llm_api_url.clone(),
        llm_model: defaults.llm_model.clone(),
        current_course: defaults.current_course.clone(),
        created_at: now,
        updated_at: now,
    };

    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No settings file found, using defaults");
            return fallback;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read settings file, using defaults");
            return fallback;
        }
    };

    match serde_json::from_str::<StoredSettings>(&raw) {
        Ok(stored) => Settings {
            llm_api_url: stored.llm_api_url.unwrap_or(fallback.llm_api_url),
            llm_model: stored.llm_model.unwrap_or(fallback.llm_model),
            current_course: stored.current_course.unwrap_or(fallback.current_course),
            created_at: stored.created_at.unwrap_or(now),
            updated_at: stored.updated_at.unwrap_or(now),
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Settings file is corrupt, using defaults");
            fallback
        }
    }
}

/// Writes `settings.json.tmp`, syncs it, then renames it over the target.
/// Readers only ever see the old or the new document.
async fn save(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp_path = temp_path(path);
    let body = serde_json::to_vec_pretty(settings)?;

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "settings.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn defaults() -> SettingsDefaults {
        SettingsDefaults {
            llm_api_url: "http://127.0.0.1:11434/api/chat".to_string(),
            llm_model: "qwen3:14b".to_string(),
            current_course: "Database Systems".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json"), defaults()).await;

        let settings = store.get().await;
        assert_eq!(settings.llm_model, "qwen3:14b");
        assert_eq!(settings.current_course, "Database Systems");
    }

    #[tokio::test]
    async fn test_updates_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path, defaults()).await;
        store.set_current_course("Operating Systems").await.unwrap();
        store.update_llm("http://10.0.0.2:11434/api/chat", "llama3").await.unwrap();

        let reopened = SettingsStore::open(&path, defaults()).await;
        let settings = reopened.get().await;
        assert_eq!(settings.current_course, "Operating Systems");
        assert_eq!(settings.llm_model, "llama3");
        assert_eq!(settings.llm_api_url, "http://10.0.0.2:11434/api/chat");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_crash_mid_write_keeps_committed_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path, defaults()).await;
        store.set_current_course("Compilers").await.unwrap();
        let committed = std::fs::read_to_string(&path).unwrap();

        // A write that died before the rename leaves only a partial temp file
        std::fs::write(temp_path(&path), "{\"current_course\": \"Netw").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), committed);
        let reopened = SettingsStore::open(&path, defaults()).await;
        assert_eq!(reopened.current_course().await, "Compilers");

        // The next save replaces the stale temp file
        reopened.set_current_course("Networks").await.unwrap();
        assert_eq!(reopened.current_course().await, "Networks");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let store = SettingsStore::open(&path, defaults()).await;
        assert_eq!(store.current_course().await, "Database Systems");
    }

    #[tokio::test]
    async fn test_partial_document_fills_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"llm_model": "mistral"}"#).unwrap();

        let store = SettingsStore::open(&path, defaults()).await;
        let settings = store.get().await;
        assert_eq!(settings.llm_model, "mistral");
        assert_eq!(settings.current_course, "Database Systems");
    }
}
