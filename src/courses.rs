use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::knowledge_base::KnowledgeBase;
use crate::llm_client::extract_json_from_response;
use crate::llm_service::LLMService;
use crate::settings::SettingsStore;
use crate::{log_service_error, log_service_start, log_service_success};

const COURSE_FILE_PREFIX: &str = "course_";
const DEFAULT_COURSE_DESCRIPTION: &str = "Built-in course";

#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    #[error("Course '{0}' not found")]
    NotFound(String),

    #[error("Course '{0}' is the default course and cannot be deleted")]
    Protected(String),

    #[error("Course '{0}' already exists")]
    AlreadyExists(String),

    #[error("Course name must not be empty")]
    EmptyName,

    #[error("Invalid knowledge base: {0}")]
    InvalidKnowledgeBase(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Course {
    pub name: String,
    pub description: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for course knowledge bases
#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Course>>;

    async fn get(&self, name: &str) -> Result<Option<Course>> {
        Ok(self.list().await?.into_iter().find(|c| c.name == name))
    }

    async fn create(&self, name: &str, description: &str, knowledge_base: &KnowledgeBase) -> Result<Course>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn knowledge_base(&self, name: &str) -> Result<KnowledgeBase>;

    fn default_course(&self) -> &str;
}

// On-disk shape of a non-default course file
#[derive(Debug, Serialize, Deserialize)]
struct CourseDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    knowledge_base: KnowledgeBase,
}

/// Courses stored as JSON files: the default course's knowledge base file plus
/// `course_{name}.json` documents in a directory.
pub struct FileCourseRepository {
    default_name: String,
    default_file: PathBuf,
    courses_dir: PathBuf,
}

impl FileCourseRepository {
    pub fn new(default_name: impl Into<String>, default_file: impl Into<PathBuf>, courses_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_name: default_name.into(),
            default_file: default_file.into(),
            courses_dir: courses_dir.into(),
        }
    }

    pub fn course_path(&self, name: &str) -> PathBuf {
        self.courses_dir.join(course_file_name(name))
    }

    async fn read_document(path: &Path) -> Result<CourseDocument> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    async fn default_entry(&self) -> Option<Course> {
        let metadata = tokio::fs::metadata(&self.default_file).await.ok()?;
        Some(Course {
            name: self.default_name.clone(),
            description: DEFAULT_COURSE_DESCRIPTION.to_string(),
            filename: self.default_file.display().to_string(),
            created_at: modified_at(&metadata),
        })
    }
}

#[async_trait]
impl CourseRepository for FileCourseRepository {
    async fn list(&self) -> Result<Vec<Course>> {
        let mut courses: Vec<Course> = self.default_entry().await.into_iter().collect();

        let mut entries = match tokio::fs::read_dir(&self.courses_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(courses),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.courses_dir.display()));
            }
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = file_name
                .strip_prefix(COURSE_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };

            let path = entry.path();
            let document = match Self::read_document(&path).await {
                Ok(document) => document,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable course file");
                    continue;
                }
            };

            let name = document
                .name
                .clone()
                .or_else(|| Some(document.knowledge_base.subject.clone()).filter(|s| !s.is_empty()))
                .unwrap_or_else(|| stem.to_string());
            let created_at = match document.created_at {
                Some(created_at) => created_at,
                None => entry.metadata().await.map(|m| modified_at(&m)).unwrap_or_else(|_| Utc::now()),
            };

            found.push(Course {
                description: document.description.unwrap_or_else(|| format!("{} course", name)),
                name,
                filename: path.display().to_string(),
                created_at,
            });
        }

        found.sort_by(|a, b| a.filename.cmp(&b.filename));
        courses.extend(found);
        Ok(courses)
    }

    async fn create(&self, name: &str, description: &str, knowledge_base: &KnowledgeBase) -> Result<Course> {
        if name == self.default_name || self.get(name).await?.is_some() {
            return Err(CourseError::AlreadyExists(name.to_string()).into());
        }

        let path = self.course_path(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(CourseError::AlreadyExists(name.to_string()).into());
        }

        tokio::fs::create_dir_all(&self.courses_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.courses_dir.display()))?;

        let created_at = Utc::now();
        let document = CourseDocument {
            name: Some(name.to_string()),
            description: Some(description.to_string()),
            created_at: Some(created_at),
            knowledge_base: knowledge_base.clone(),
        };
        tokio::fs::write(&path, serde_json::to_string_pretty(&document)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(course = %name, path = %path.display(), "Course created");
        Ok(Course {
            name: name.to_string(),
            description: description.to_string(),
            filename: path.display().to_string(),
            created_at,
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if name == self.default_name {
            return Err(CourseError::Protected(name.to_string()).into());
        }

        let course = self
            .get(name)
            .await?
            .ok_or_else(|| CourseError::NotFound(name.to_string()))?;

        tokio::fs::remove_file(&course.filename)
            .await
            .with_context(|| format!("Failed to delete {}", course.filename))?;

        info!(course = %name, "Course deleted");
        Ok(())
    }

    async fn knowledge_base(&self, name: &str) -> Result<KnowledgeBase> {
        if name == self.default_name {
            return Ok(KnowledgeBase::load(&self.default_file).await);
        }

        let course = self
            .get(name)
            .await?
            .ok_or_else(|| CourseError::NotFound(name.to_string()))?;
        Ok(Self::read_document(Path::new(&course.filename)).await?.knowledge_base)
    }

    fn default_course(&self) -> &str {
        &self.default_name
    }
}

fn course_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    format!("{}{}.json", COURSE_FILE_PREFIX, safe)
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedCourse {
    pub course: Course,
    pub knowledge_data: KnowledgeBase,
}

/// Course selection and creation on top of a [`CourseRepository`]
#[derive(Clone)]
pub struct CourseService {
    repo: Arc<dyn CourseRepository>,
    settings: Arc<SettingsStore>,
    llm: LLMService,
}

impl CourseService {
    pub fn new(repo: Arc<dyn CourseRepository>, settings: Arc<SettingsStore>, llm: LLMService) -> Self {
        Self { repo, settings, llm }
    }

    pub async fn list(&self) -> Result<Vec<Course>> {
        self.repo.list().await
    }

    pub async fn current(&self) -> String {
        self.settings.current_course().await
    }

    /// Knowledge base of the selected course, falling back to the default course
    /// when the selection no longer resolves.
    pub async fn current_knowledge_base(&self) -> KnowledgeBase {
        let course = self.settings.current_course().await;
        match self.repo.knowledge_base(&course).await {
            Ok(kb) => kb,
            Err(e) => {
                warn!(course = %course, error = %e, "Current course unavailable, using default course");
                self.repo
                    .knowledge_base(self.repo.default_course())
                    .await
                    .unwrap_or_default()
            }
        }
    }

    pub async fn create_with_ai(&self, name: &str, description: &str) -> Result<CreatedCourse> {
        self.create(name, description, None).await
    }

    /// Creates a course from a supplied knowledge base, or asks the LLM to write one
    pub async fn create(&self, name: &str, description: &str, supplied: Option<Value>) -> Result<CreatedCourse> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CourseError::EmptyName.into());
        }
        if name == self.repo.default_course() || self.repo.get(name).await?.is_some() {
            return Err(CourseError::AlreadyExists(name.to_string()).into());
        }

        let mut knowledge_base = match supplied {
            Some(value) => KnowledgeBase::from_value(value)
                .map_err(|e| CourseError::InvalidKnowledgeBase(e.to_string()))?,
            None => self.generate_knowledge_base(name, description).await?,
        };
        if knowledge_base.subject.trim().is_empty() {
            knowledge_base.subject = name.to_string();
        }
        knowledge_base
            .validate()
            .map_err(|e| CourseError::InvalidKnowledgeBase(e.to_string()))?;

        let course = self.repo.create(name, description, &knowledge_base).await?;
        Ok(CreatedCourse {
            course,
            knowledge_data: knowledge_base,
        })
    }

    async fn generate_knowledge_base(&self, name: &str, description: &str) -> Result<KnowledgeBase> {
        log_service_start!("course_service", "generate_knowledge_base");
        let start = std::time::Instant::now();

        let response = self.llm.generate_course(name, description).await.map_err(|e| {
            log_service_error!("course_service", "generate_knowledge_base", error = e);
            e
        })?;

        let json = extract_json_from_response(&response);
        let value: Value = serde_json::from_str(&json)
            .map_err(|e| CourseError::InvalidKnowledgeBase(format!("generated document is not JSON: {}", e)))?;
        let kb = KnowledgeBase::from_value(value).map_err(|e| CourseError::InvalidKnowledgeBase(e.to_string()))?;

        log_service_success!(
            "course_service",
            "generate_knowledge_base",
            item_count = kb.chapters.0.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(kb)
    }

    /// Deletes a course. Deleting the selected course reselects the default.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.repo.delete(name).await?;
        if self.settings.current_course().await == name {
            self.settings.set_current_course(self.repo.default_course()).await?;
        }
        Ok(())
    }

    pub async fn set_current(&self, name: &str) -> Result<String> {
        if self.repo.get(name).await?.is_none() {
            return Err(CourseError::NotFound(name.to_string()).into());
        }
        self.settings.set_current_course(name).await?;
        Ok(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_kb(subject: &str) -> KnowledgeBase {
        KnowledgeBase::from_value(json!({
            "subject": subject,
            "chapters": {
                "Chapter 1": {"mainConcepts": ["Ownership"], "mainContents": ["Borrowing rules"]}
            }
        }))
        .unwrap()
    }

    async fn repo(dir: &TempDir) -> FileCourseRepository {
        let default_file = dir.path().join("knowledge_base.json");
        tokio::fs::write(&default_file, serde_json::to_string(&sample_kb("Databases")).unwrap())
            .await
            .unwrap();
        FileCourseRepository::new("Databases", default_file, dir.path().join("courses"))
    }

    #[test]
    fn test_course_file_name_replaces_separators() {
        assert_eq!(course_file_name("Rust 101/a\\b"), "course_Rust_101_a_b.json");
    }

    #[tokio::test]
    async fn test_list_includes_default_and_created_courses() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        repo.create("Rust Basics", "Systems programming", &sample_kb("Rust Basics"))
            .await
            .unwrap();

        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Databases".to_string(), "Rust Basics".to_string()]);

        let kb = repo.knowledge_base("Rust Basics").await.unwrap();
        assert_eq!(kb.chapter_names(), vec!["Chapter 1".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_course_is_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        repo.create("Rust", "", &sample_kb("Rust")).await.unwrap();
        let err = repo.create("Rust", "", &sample_kb("Rust")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CourseError>(), Some(CourseError::AlreadyExists(_))));

        let err = repo.create("Databases", "", &sample_kb("Databases")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CourseError>(), Some(CourseError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_default_course_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        let err = repo.delete("Databases").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CourseError>(), Some(CourseError::Protected(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_course_file() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        repo.create("Rust", "", &sample_kb("Rust")).await.unwrap();
        repo.delete("Rust").await.unwrap();
        assert!(repo.get("Rust").await.unwrap().is_none());

        let err = repo.delete("Rust").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CourseError>(), Some(CourseError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_hand_written_course_file_uses_subject_as_name() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        let courses_dir = dir.path().join("courses");
        tokio::fs::create_dir_all(&courses_dir).await.unwrap();
        tokio::fs::write(
            courses_dir.join("course_os.json"),
            r#"{"科目": "Operating Systems", "章节": {"Processes": {"mainConcepts": ["PCB"]}}}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(courses_dir.join("notes.json"), "{}").await.unwrap();

        let course = repo.get("Operating Systems").await.unwrap().unwrap();
        assert_eq!(course.description, "Operating Systems course");
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }
}
