use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::courses::CourseService;
use crate::database::Database;
use crate::explanation_cache::ExplanationCache;
use crate::knowledge_base::{ChapterItem, SearchHit, StudyItem};
use crate::llm_service::LLMService;
use crate::models::{ConceptType, LearningProgress};
use crate::tasks::{Progress, ProgressDetails, ProgressReporter};
use crate::{log_service_start, log_service_success};

#[derive(Debug, Clone, Serialize)]
pub struct ChapterOverview {
    pub subject: String,
    pub chapters: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterContent {
    pub chapter: String,
    pub concepts: Vec<String>,
    pub contents: Vec<String>,
    pub items: Vec<ChapterItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub explanation: String,
    pub from_cache: bool,
}

/// Result of one item in a batch run
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchItemResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub chapter: String,
    pub concept: String,
    pub concept_type: ConceptType,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchOutcome {
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Keyed by `"{chapter}_{concept}"`
    pub results: BTreeMap<String, BatchItemResult>,
}

/// Explanations, search and progress over the currently selected course
#[derive(Clone)]
pub struct LearningService {
    db: Database,
    llm: LLMService,
    cache: ExplanationCache,
    courses: CourseService,
    batch_delay: Duration,
}

impl LearningService {
    pub fn new(
        db: Database,
        llm: LLMService,
        cache: ExplanationCache,
        courses: CourseService,
        batch_delay: Duration,
    ) -> Self {
        Self {
            db,
            llm,
            cache,
            courses,
            batch_delay,
        }
    }

    pub async fn chapters(&self) -> ChapterOverview {
        let kb = self.courses.current_knowledge_base().await;
        ChapterOverview {
            subject: kb.subject.clone(),
            chapters: kb.chapter_names(),
        }
    }

    pub async fn chapter_content(&self, chapter: &str) -> Option<ChapterContent> {
        let kb = self.courses.current_knowledge_base().await;
        kb.chapter(chapter)?;
        Some(ChapterContent {
            chapter: chapter.to_string(),
            concepts: kb.concepts(chapter).to_vec(),
            contents: kb.contents(chapter).to_vec(),
            items: kb.chapter_items(chapter),
        })
    }

    pub async fn search(&self, keyword: &str) -> Vec<SearchHit> {
        self.courses.current_knowledge_base().await.search(keyword)
    }

    /// Serves the cached explanation if present, otherwise asks the LLM and caches
    /// the answer. Every success is recorded against the user.
    pub async fn explain(
        &self,
        username: &str,
        chapter: &str,
        concept: &str,
        concept_type: ConceptType,
    ) -> Result<Explanation> {
        let explanation = match self.cache.load(chapter, concept).await {
            Some(text) => {
                info!(chapter = %chapter, concept = %concept, "Explanation served from cache");
                Explanation {
                    explanation: text,
                    from_cache: true,
                }
            }
            None => {
                let course = self.courses.current().await;
                let text = self.llm.explain(chapter, concept, concept_type, &course).await?;
                if let Err(e) = self.cache.save(chapter, concept, &text).await {
                    warn!(chapter = %chapter, concept = %concept, error = %e, "Failed to cache explanation");
                }
                Explanation {
                    explanation: text,
                    from_cache: false,
                }
            }
        };

        let user = self.db.get_or_create_user(username).await?;
        self.db
            .create_learning_record(user.id, chapter, concept, concept_type, Some(&explanation.explanation))
            .await?;

        Ok(explanation)
    }

    /// Drops the cached entry and generates a fresh explanation
    pub async fn regenerate(
        &self,
        username: &str,
        chapter: &str,
        concept: &str,
        concept_type: ConceptType,
    ) -> Result<Explanation> {
        self.cache.delete(chapter, concept).await?;
        self.explain(username, chapter, concept, concept_type).await
    }

    /// Explains items one after another. Cache hits skip the LLM; a failed item is
    /// recorded and the run continues. Consecutive LLM calls are spaced by the
    /// configured delay, and progress is reported after every item.
    pub async fn batch_explain(&self, items: &[StudyItem], reporter: &ProgressReporter) -> BatchOutcome {
        let total = items.len();
        let start = Instant::now();
        log_service_start!("learning_service", "batch_explain", item_count = total);

        let course = self.courses.current().await;
        let mut results = BTreeMap::new();
        let mut success_count = 0;
        let mut called_llm = false;

        for (index, item) in items.iter().enumerate() {
            let (outcome, from_cache) = match self.cache.load(&item.chapter, &item.concept).await {
                Some(text) => (Ok(text), true),
                None => {
                    if called_llm && !self.batch_delay.is_zero() {
                        tokio::time::sleep(self.batch_delay).await;
                    }
                    called_llm = true;

                    let generated = self
                        .llm
                        .explain(&item.chapter, &item.concept, item.concept_type, &course)
                        .await;
                    if let Ok(text) = &generated {
                        if let Err(e) = self.cache.save(&item.chapter, &item.concept, text).await {
                            warn!(chapter = %item.chapter, concept = %item.concept, error = %e, "Failed to cache explanation");
                        }
                    }
                    (generated.map_err(|e| e.to_string()), false)
                }
            };

            let (explanation, error) = match outcome {
                Ok(text) => {
                    success_count += 1;
                    (Some(text), None)
                }
                Err(e) => {
                    warn!(chapter = %item.chapter, concept = %item.concept, error = %e, "Batch item failed");
                    (None, Some(e))
                }
            };
            let item_error = error.clone();
            results.insert(
                format!("{}_{}", item.chapter, item.concept),
                BatchItemResult {
                    success: error.is_none(),
                    explanation,
                    error,
                    chapter: item.chapter.clone(),
                    concept: item.concept.clone(),
                    concept_type: item.concept_type,
                    from_cache,
                },
            );

            let current = index + 1;
            reporter.report(Progress::Detailed(ProgressDetails {
                current,
                total,
                chapter: item.chapter.clone(),
                concept: item.concept.clone(),
                percentage: (current as f64 / total as f64 * 1000.0).round() / 10.0,
                error: item_error,
            }));
        }

        log_service_success!(
            "learning_service",
            "batch_explain",
            item_count = total,
            duration_ms = start.elapsed().as_millis() as u64
        );

        BatchOutcome {
            total,
            success_count,
            error_count: total - success_count,
            results,
        }
    }

    /// Every concept, then every content entry, of one chapter
    pub async fn batch_explain_chapter(&self, chapter: &str, reporter: &ProgressReporter) -> Result<BatchOutcome> {
        let kb = self.courses.current_knowledge_base().await;
        let items = kb
            .study_items(chapter)
            .ok_or_else(|| anyhow!("Chapter '{}' does not exist", chapter))?;
        if items.is_empty() {
            return Err(anyhow!("Chapter '{}' has no concepts or contents", chapter));
        }

        Ok(self.batch_explain(&items, reporter).await)
    }

    pub async fn batch_explain_all(&self, reporter: &ProgressReporter) -> Result<BatchOutcome> {
        let items = self.courses.current_knowledge_base().await.all_study_items();
        if items.is_empty() {
            return Err(anyhow!("The current course has no concepts or contents"));
        }

        Ok(self.batch_explain(&items, reporter).await)
    }

    /// Unknown users have an empty history
    pub async fn progress(&self, username: &str) -> Result<LearningProgress> {
        match self.db.find_user(username).await? {
            Some(user) => self.db.learning_progress(user.id).await,
            None => Ok(LearningProgress::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LLMConfig;
    use crate::courses::FileCourseRepository;
    use crate::llm_client::LLMClient;
    use crate::settings::{SettingsDefaults, SettingsStore};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    // Nothing listens on port 1, so every LLM call fails with a connection error
    const REFUSED_URL: &str = "http://127.0.0.1:1/api/chat";

    async fn service(dir: &TempDir) -> LearningService {
        let kb_file = dir.path().join("knowledge_base.json");
        tokio::fs::write(
            &kb_file,
            r#"{"subject": "Databases", "chapters": {
                "Chapter 1": {"mainConcepts": ["DBMS", "Schema"], "mainContents": ["Data independence"]},
                "Empty": {"mainConcepts": [], "mainContents": []}
            }}"#,
        )
        .await
        .unwrap();

        let settings = Arc::new(
            SettingsStore::open(
                dir.path().join("settings.json"),
                SettingsDefaults {
                    llm_api_url: REFUSED_URL.to_string(),
                    llm_model: "test-model".to_string(),
                    current_course: "Databases".to_string(),
                },
            )
            .await,
        );
        let llm = LLMService::new(LLMClient::new(&LLMConfig {
            api_url: REFUSED_URL.to_string(),
            model: "test-model".to_string(),
            api_key: None,
            timeout_secs: 5,
            max_retries: 3,
        }));
        let repo = Arc::new(FileCourseRepository::new("Databases", kb_file, dir.path().join("courses")));
        let courses = CourseService::new(repo, settings, llm.clone());
        let db = Database::new("sqlite::memory:").await.unwrap();

        LearningService::new(
            db,
            llm,
            ExplanationCache::new(dir.path().join("cache")),
            courses,
            Duration::ZERO,
        )
    }

    fn collecting_reporter() -> (ProgressReporter, Arc<Mutex<Vec<Progress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (ProgressReporter::new(move |p| sink.lock().unwrap().push(p)), seen)
    }

    #[tokio::test]
    async fn test_batch_continues_past_failed_items() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        svc.cache.save("Chapter 1", "DBMS", "cached text").await.unwrap();

        let (reporter, seen) = collecting_reporter();
        let outcome = svc.batch_explain_chapter("Chapter 1", &reporter).await.unwrap();

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.error_count, 2);

        let cached = &outcome.results["Chapter 1_DBMS"];
        assert!(cached.success && cached.from_cache);
        assert_eq!(cached.explanation.as_deref(), Some("cached text"));

        let failed = &outcome.results["Chapter 1_Data independence"];
        assert!(!failed.success);
        assert_eq!(failed.concept_type, ConceptType::Content);
        assert!(failed.error.is_some());

        let percentages: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| match p {
                Progress::Detailed(d) => d.percentage,
                Progress::Percent(p) => *p,
            })
            .collect();
        assert_eq!(percentages, vec![33.3, 66.7, 100.0]);
    }

    #[tokio::test]
    async fn test_missing_or_empty_chapter_is_an_error() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;

        assert!(svc.batch_explain_chapter("Chapter 9", &ProgressReporter::noop()).await.is_err());
        assert!(svc.batch_explain_chapter("Empty", &ProgressReporter::noop()).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_hit_records_learning_progress() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        svc.cache.save("Chapter 1", "Schema", "A schema is...").await.unwrap();

        let explanation = svc
            .explain("alice", "Chapter 1", "Schema", ConceptType::Concept)
            .await
            .unwrap();
        assert!(explanation.from_cache);

        let progress = svc.progress("alice").await.unwrap();
        assert_eq!(progress.chapters_studied, 1);
        assert_eq!(progress.concepts_learned, 1);
        assert_eq!(progress.recent_activity[0].concept, "Schema");
    }

    #[tokio::test]
    async fn test_failed_explanation_writes_no_record() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;

        assert!(svc.explain("bob", "Chapter 1", "DBMS", ConceptType::Concept).await.is_err());
        assert_eq!(svc.progress("bob").await.unwrap().concepts_learned, 0);
    }

    #[tokio::test]
    async fn test_chapter_content_lists_items() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;

        let content = svc.chapter_content("Chapter 1").await.unwrap();
        assert_eq!(content.concepts, vec!["DBMS".to_string(), "Schema".to_string()]);
        assert_eq!(content.items.len(), 3);
        assert!(svc.chapter_content("Chapter 9").await.is_none());
        assert_eq!(svc.search("schema").await.len(), 1);
    }
}
