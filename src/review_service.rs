use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{info, warn};

use crate::courses::CourseService;
use crate::database::Database;
use crate::llm_service::LLMService;
use crate::models::{ReviewRecord, ReviewStatus};
use crate::{log_service_start, log_service_success};

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["txt", "pdf", "doc", "docx"];

const PREVIEW_QUESTIONS: usize = 10;
const CONTEXT_CHAPTERS: usize = 3;
const CONTEXT_CONCEPTS: usize = 5;
const MAX_WEAK_POINTS: usize = 5;

const WEAKNESS_KEYWORDS: [&str; 12] = [
    "错误", "不正确", "不准确", "需要改进", "薄弱", "不足",
    "incorrect", "wrong", "inaccurate", "needs improvement", "weak", "missing",
];

static SCORE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"总分[：:]\s*(\d+)",
        r"得分[：:]\s*(\d+)",
        r"分数[：:]\s*(\d+)",
        r"(?i)total(?: score)?\s*[：:]\s*(\d+)",
        r"(\d+)\s*分",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid regex"))
    .collect()
});

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("No file was selected")]
    MissingFilename,

    #[error("The uploaded file is empty")]
    EmptyFile,

    #[error("Unsupported file type '{0}', expected one of txt, pdf, doc, docx")]
    UnsupportedType(String),

    #[error("File exceeds the {limit} byte upload limit")]
    TooLarge { limit: usize },

    #[error("Review record {0} not found")]
    NotFound(i64),

    #[error("The file for review record {0} no longer exists")]
    FileMissing(i64),

    #[error("Review record {0} has already been reviewed")]
    AlreadyReviewed(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedExam {
    pub record_id: i64,
    pub filename: String,
    pub original_filename: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ParsedContent {
    pub total_questions: usize,
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedExam {
    pub content: String,
    pub parsed_content: ParsedContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub review_result: String,
    pub suggestions: String,
    pub score: Option<u32>,
    pub weak_points: Vec<String>,
}

/// Splits answer-sheet text into question blocks.
///
/// A block starts at a line beginning with a digit or the word "question", or a
/// line with `题` in its first ten characters. Text before the first block is dropped.
pub fn parse_question_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if starts_question(line) {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some(line.to_string());
        } else if let Some(block) = current.as_mut() {
            block.push('\n');
            block.push_str(line);
        }
    }
    blocks.extend(current);
    blocks
}

fn starts_question(line: &str) -> bool {
    line.starts_with(|c: char| c.is_ascii_digit())
        || line
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("question"))
        || line.chars().take(10).any(|c| c == '题')
}

/// First score found in a grading narrative
pub fn extract_score(narrative: &str) -> Option<u32> {
    SCORE_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(narrative)?.get(1)?.as_str().parse().ok())
}

fn weak_points(narrative: &str) -> Vec<String> {
    narrative
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            WEAKNESS_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
        })
        .map(|line| line.trim().to_string())
        .take(MAX_WEAK_POINTS)
        .collect()
}

/// UTF-8 first, then GBK for answer sheets saved by Chinese-locale editors
fn decode_answer_sheet(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, had_errors) = encoding_rs::GBK.decode(bytes);
            if had_errors {
                warn!(bytes = bytes.len(), "Answer sheet is neither UTF-8 nor GBK, decoding lossily");
            }
            text.into_owned()
        }
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

/// Reduces an uploaded name to ASCII letters, digits, `.`, `-` and `_`
fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();

    // Non-ASCII names reduce to only the extension
    match extension_of(filename) {
        Some(ext) if cleaned.is_empty() || cleaned == ext => format!("upload.{}", ext),
        _ => cleaned,
    }
}

pub struct ReviewService {
    db: Database,
    llm: LLMService,
    courses: CourseService,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
}

impl ReviewService {
    pub fn new(
        db: Database,
        llm: LLMService,
        courses: CourseService,
        upload_dir: PathBuf,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            db,
            llm,
            courses,
            upload_dir,
            max_upload_bytes,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub async fn upload(&self, username: &str, filename: &str, bytes: &[u8]) -> Result<UploadedExam> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(ReviewError::MissingFilename.into());
        }
        let extension = extension_of(filename).unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ReviewError::UnsupportedType(extension).into());
        }
        if bytes.is_empty() {
            return Err(ReviewError::EmptyFile.into());
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(ReviewError::TooLarge {
                limit: self.max_upload_bytes,
            }
            .into());
        }

        let user = self.db.get_or_create_user(username).await?;

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.upload_dir.display()))?;
        let stored_name = format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            sanitize_filename(filename)
        );
        let path = self.upload_dir.join(&stored_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let record = self
            .db
            .create_review_record(user.id, filename, &path.display().to_string())
            .await?;

        info!(record_id = record.id, path = %path.display(), bytes = bytes.len(), "Exam file uploaded");
        Ok(UploadedExam {
            record_id: record.id,
            filename: stored_name,
            original_filename: filename.to_string(),
        })
    }

    pub async fn parse(&self, record_id: i64) -> Result<ParsedExam> {
        let record = self.record(record_id).await?;
        let content = self.read_upload(&record).await?;

        let blocks = parse_question_blocks(&content);
        Ok(ParsedExam {
            parsed_content: ParsedContent {
                total_questions: blocks.len(),
                questions: blocks.into_iter().take(PREVIEW_QUESTIONS).collect(),
            },
            content,
        })
    }

    /// Grades an uploaded answer sheet and stores the outcome. A record is reviewed once.
    pub async fn review(&self, record_id: i64) -> Result<ReviewOutcome> {
        let record = self.record(record_id).await?;
        if record.status == ReviewStatus::Reviewed {
            return Err(ReviewError::AlreadyReviewed(record_id).into());
        }

        let start = Instant::now();
        log_service_start!("review_service", "review");

        let content = self.read_upload(&record).await?;
        let course = self.courses.current().await;
        let context = self
            .courses
            .current_knowledge_base()
            .await
            .knowledge_context(CONTEXT_CHAPTERS, CONTEXT_CONCEPTS);

        let review_result = self.llm.review_answers(&content, &context, &course).await?;
        let weak_points = weak_points(&review_result);

        // Advice is secondary; a grading result is kept even without it
        let suggestions = match self.llm.learning_advice(&weak_points.join("\n"), &context, &course).await {
            Ok(advice) => advice,
            Err(e) => {
                warn!(record_id, error = %e, "Learning advice unavailable");
                format!("Learning advice unavailable: {}", e.user_message())
            }
        };
        let score = extract_score(&review_result);

        let stored = self
            .db
            .complete_review(record_id, &review_result, &suggestions, score.map(i64::from))
            .await?;
        if !stored {
            return Err(ReviewError::AlreadyReviewed(record_id).into());
        }

        log_service_success!(
            "review_service",
            "review",
            item_count = weak_points.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(ReviewOutcome {
            review_result,
            suggestions,
            score,
            weak_points,
        })
    }

    pub async fn history(&self, username: &str) -> Result<Vec<ReviewRecord>> {
        match self.db.find_user(username).await? {
            Some(user) => self.db.review_history(user.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn record(&self, record_id: i64) -> Result<ReviewRecord> {
        Ok(self
            .db
            .get_review_record(record_id)
            .await?
            .ok_or(ReviewError::NotFound(record_id))?)
    }

    async fn read_upload(&self, record: &ReviewRecord) -> Result<String> {
        let path = record
            .file_path
            .as_deref()
            .ok_or(ReviewError::FileMissing(record.id))?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(decode_answer_sheet(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ReviewError::FileMissing(record.id).into()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path)),
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
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_extract_score() {
        assert_eq!(extract_score("总分：87分"), Some(87));
        assert_eq!(extract_score("Overall remarks\nTotal: 87"), Some(87));
        assert_eq!(extract_score("TOTAL SCORE: 92"), Some(92));
        assert_eq!(extract_score("得分: 75"), Some(75));
        assert_eq!(extract_score("本题 8 分"), Some(8));
        assert_eq!(extract_score("Good effort, keep practising."), None);
    }

    #[test]
    fn test_total_takes_precedence_over_per_question_points() {
        assert_eq!(extract_score("第一题 5分\n总分：60"), Some(60));
    }

    #[test]
    fn test_parse_question_blocks() {
        let text = "Name: Alice\n\n1. What is a key?\nA unique identifier.\nQuestion 2: Define BCNF\n第三题 简答\nAnswer here\n";
        let blocks = parse_question_blocks(text);
        assert_eq!(
            blocks,
            vec![
                "1. What is a key?\nA unique identifier.".to_string(),
                "Question 2: Define BCNF".to_string(),
                "第三题 简答\nAnswer here".to_string(),
            ]
        );
    }

    #[test]
    fn test_weak_points_are_capped() {
        let narrative = (0..8).map(|i| format!("Answer {} is incorrect", i)).collect::<Vec<_>>().join("\n");
        let points = weak_points(&format!("Fine overall\n{}", narrative));
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], "Answer 0 is incorrect");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my answers.txt"), "my_answers.txt");
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "passwd.txt");
        assert_eq!(sanitize_filename("答卷.docx"), "upload.docx");
    }

    async fn service(dir: &TempDir, max_upload_bytes: usize) -> ReviewService {
        let settings = Arc::new(
            SettingsStore::open(
                dir.path().join("settings.json"),
                SettingsDefaults {
                    llm_api_url: "http://127.0.0.1:1/api/chat".to_string(),
                    llm_model: "test-model".to_string(),
                    current_course: "Databases".to_string(),
                },
            )
            .await,
        );
        let llm = LLMService::new(LLMClient::new(&LLMConfig {
            api_url: "http://127.0.0.1:1/api/chat".to_string(),
            model: "test-model".to_string(),
            api_key: None,
            timeout_secs: 5,
            max_retries: 1,
        }));
        let repo = Arc::new(FileCourseRepository::new(
            "Databases",
            dir.path().join("knowledge_base.json"),
            dir.path().join("courses"),
        ));
        ReviewService::new(
            Database::new("sqlite::memory:").await.unwrap(),
            llm.clone(),
            CourseService::new(repo, settings, llm),
            dir.path().join("uploads"),
            max_upload_bytes,
        )
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 16).await;

        let err = svc.upload("alice", "answers.exe", b"data").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReviewError>(), Some(ReviewError::UnsupportedType(_))));

        let err = svc.upload("alice", "answers.txt", b"").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReviewError>(), Some(ReviewError::EmptyFile)));

        let err = svc.upload("alice", "answers.txt", &[b'a'; 17]).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReviewError>(), Some(ReviewError::TooLarge { limit: 16 })));

        let err = svc.upload("alice", "  ", b"data").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReviewError>(), Some(ReviewError::MissingFilename)));
    }

    #[tokio::test]
    async fn test_upload_then_parse() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1024).await;

        let uploaded = svc
            .upload("alice", "answers.txt", "1. Keys\nPrimary\n2. Joins\n".as_bytes())
            .await
            .unwrap();
        assert!(uploaded.filename.ends_with("_answers.txt"));
        assert!(svc.upload_dir().join(&uploaded.filename).exists());

        let parsed = svc.parse(uploaded.record_id).await.unwrap();
        assert_eq!(parsed.parsed_content.total_questions, 2);

        let history = svc.history("alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ReviewStatus::Uploaded);
    }

    #[test]
    fn test_decode_answer_sheet_falls_back_to_gbk() {
        let (gbk, _, _) = encoding_rs::GBK.encode("第一题 主键\n答案：唯一标识");
        assert!(std::str::from_utf8(&gbk).is_err());
        assert_eq!(decode_answer_sheet(&gbk), "第一题 主键\n答案：唯一标识");
        assert_eq!(decode_answer_sheet("1. Keys".as_bytes()), "1. Keys");
    }

    #[tokio::test]
    async fn test_gbk_upload_parses_into_questions() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1024).await;

        let (gbk, _, _) = encoding_rs::GBK.encode("姓名：张三\n第一题 什么是主键？\n唯一标识元组\n第二题 什么是外键？\n");
        let uploaded = svc.upload("alice", "答卷.txt", &gbk).await.unwrap();

        let parsed = svc.parse(uploaded.record_id).await.unwrap();
        assert!(parsed.content.starts_with("姓名：张三"));
        assert_eq!(
            parsed.parsed_content.questions,
            vec!["第一题 什么是主键？\n唯一标识元组".to_string(), "第二题 什么是外键？".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1024).await;

        let err = svc.review(42).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReviewError>(), Some(ReviewError::NotFound(42))));
    }
}
