use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Instant;

use crate::log_db_operation;
use crate::models::*;

/// Fields needed to insert an exam record
#[derive(Debug, Clone)]
pub struct NewExamRecord {
    pub user_id: i64,
    pub exam_id: String,
    pub exam_name: String,
    pub chapters_json: String,
    pub questions_json: String,
}

/// Single repository over the relational store. Every table is accessed through here.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL '{}'", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database only lives as long as its connection
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS learning_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                chapter TEXT NOT NULL,
                concept TEXT NOT NULL,
                concept_type TEXT NOT NULL,
                explanation TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exam_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                exam_id TEXT NOT NULL UNIQUE,
                exam_name TEXT NOT NULL,
                chapters TEXT NOT NULL,
                questions TEXT,
                score INTEGER,
                status TEXT NOT NULL DEFAULT 'generated',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS review_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                original_filename TEXT NOT NULL,
                file_path TEXT,
                review_result TEXT,
                suggestions TEXT,
                score INTEGER,
                status TEXT NOT NULL DEFAULT 'uploaded',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_learning_records_user ON learning_records(user_id)")
            .execute(&self.pool)
            .await?;

        log_db_operation!(info, "migrate", "schema ready");
        Ok(())
    }

    /// Cheap round trip used by the health check
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // User operations

    /// Returns the user with this name, creating it on first use.
    ///
    /// The insert is a no-op when the name already exists, so concurrent callers
    /// always converge on the same row.
    pub async fn get_or_create_user(&self, username: &str) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2) ON CONFLICT(username) DO NOTHING",
        )
        .bind(username)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.find_user(username)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User '{}' not found after insert", username))
    }

    pub async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(User {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .transpose()
    }

    // Learning record operations

    pub async fn create_learning_record(
        &self,
        user_id: i64,
        chapter: &str,
        concept: &str,
        concept_type: ConceptType,
        explanation: Option<&str>,
    ) -> Result<LearningRecord> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO learning_records (user_id, chapter, concept, concept_type, explanation, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(user_id)
        .bind(chapter)
        .bind(concept)
        .bind(concept_type.as_str())
        .bind(explanation)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(LearningRecord {
            id: result.last_insert_rowid(),
            user_id,
            chapter: chapter.to_string(),
            concept: concept.to_string(),
            concept_type,
            explanation: explanation.map(str::to_string),
            created_at: now,
        })
    }

    pub async fn learning_progress(&self, user_id: i64) -> Result<LearningProgress> {
        let start = Instant::now();

        let counts = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT chapter) AS chapters_studied,
                   COUNT(DISTINCT chapter || char(31) || concept) AS concepts_learned
            FROM learning_records WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT chapter, concept, concept_type, created_at FROM learning_records
            WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 5
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut recent_activity = Vec::with_capacity(rows.len());
        for row in rows {
            recent_activity.push(RecentActivity {
                chapter: row.try_get("chapter")?,
                concept: row.try_get("concept")?,
                concept_type: row.try_get::<String, _>("concept_type")?.parse()?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            });
        }

        log_db_operation!(
            debug,
            "learning_progress",
            count = recent_activity.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );

        Ok(LearningProgress {
            chapters_studied: counts.try_get("chapters_studied")?,
            concepts_learned: counts.try_get("concepts_learned")?,
            recent_activity,
        })
    }

    // Exam record operations

    pub async fn create_exam_record(&self, record: NewExamRecord) -> Result<ExamRecord> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO exam_records (user_id, exam_id, exam_name, chapters, questions, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.user_id)
        .bind(&record.exam_id)
        .bind(&record.exam_name)
        .bind(&record.chapters_json)
        .bind(&record.questions_json)
        .bind(ExamStatus::Generated.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ExamRecord {
            id: result.last_insert_rowid(),
            user_id: record.user_id,
            exam_id: record.exam_id,
            exam_name: record.exam_name,
            chapters: record.chapters_json,
            questions: Some(record.questions_json),
            score: None,
            status: ExamStatus::Generated,
            created_at: now,
        })
    }

    pub async fn get_exam_record(&self, exam_id: &str) -> Result<Option<ExamRecord>> {
        let row = sqlx::query("SELECT * FROM exam_records WHERE exam_id = ?1")
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_exam_record(&row)).transpose()
    }

    /// Replaces the stored paper document. Returns false when the exam does not exist.
    pub async fn update_exam_questions(&self, exam_id: &str, questions_json: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE exam_records SET questions = ?1 WHERE exam_id = ?2")
            .bind(questions_json)
            .bind(exam_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn exam_history(&self, user_id: i64) -> Result<Vec<ExamRecord>> {
        let start = Instant::now();
        let rows = sqlx::query(
            "SELECT * FROM exam_records WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let records = rows.iter().map(row_to_exam_record).collect::<Result<Vec<_>>>()?;
        log_db_operation!(
            debug,
            "exam_history",
            count = records.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(records)
    }

    // Review record operations

    pub async fn create_review_record(
        &self,
        user_id: i64,
        original_filename: &str,
        file_path: &str,
    ) -> Result<ReviewRecord> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO review_records (user_id, original_filename, file_path, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(user_id)
        .bind(original_filename)
        .bind(file_path)
        .bind(ReviewStatus::Uploaded.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ReviewRecord {
            id: result.last_insert_rowid(),
            user_id,
            original_filename: original_filename.to_string(),
            file_path: Some(file_path.to_string()),
            review_result: None,
            suggestions: None,
            score: None,
            status: ReviewStatus::Uploaded,
            created_at: now,
        })
    }

    pub async fn get_review_record(&self, id: i64) -> Result<Option<ReviewRecord>> {
        let row = sqlx::query("SELECT * FROM review_records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_review_record(&row)).transpose()
    }

    /// Stores a grading outcome and moves the record from uploaded to reviewed.
    ///
    /// Returns false if the record is missing or was already reviewed.
    pub async fn complete_review(
        &self,
        id: i64,
        review_result: &str,
        suggestions: &str,
        score: Option<i64>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE review_records
            SET review_result = ?1, suggestions = ?2, score = COALESCE(?3, score), status = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(review_result)
        .bind(suggestions)
        .bind(score)
        .bind(ReviewStatus::Reviewed.as_str())
        .bind(id)
        .bind(ReviewStatus::Uploaded.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn review_history(&self, user_id: i64) -> Result<Vec<ReviewRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM review_records WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_review_record).collect()
    }
}

fn row_to_exam_record(row: &SqliteRow) -> Result<ExamRecord> {
    Ok(ExamRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        exam_id: row.try_get("exam_id")?,
        exam_name: row.try_get("exam_name")?,
        chapters: row.try_get("chapters")?,
        questions: row.try_get("questions")?,
        score: row.try_get("score")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_review_record(row: &SqliteRow) -> Result<ReviewRecord> {
    Ok(ReviewRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        original_filename: row.try_get("original_filename")?,
        file_path: row.try_get("file_path")?,
        review_result: row.try_get("review_result")?,
        suggestions: row.try_get("suggestions")?,
        score: row.try_get("score")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_user_is_idempotent() {
        let db = test_db().await;

        let first = db.get_or_create_user("alice").await.unwrap();
        let second = db.get_or_create_user("alice").await.unwrap();
        assert_eq!(first.id, second.id);

        let other = db.get_or_create_user("bob").await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_row() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("users.db").display());
        let db = Database::new(&url).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { db.get_or_create_user("carol").await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM users WHERE username = 'carol'")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_exam_id_is_unique() {
        let db = test_db().await;
        let user = db.get_or_create_user("alice").await.unwrap();

        let record = NewExamRecord {
            user_id: user.id,
            exam_id: "exam-1".to_string(),
            exam_name: "Exam".to_string(),
            chapters_json: "[]".to_string(),
            questions_json: "{}".to_string(),
        };
        db.create_exam_record(record.clone()).await.unwrap();
        let duplicate = db.create_exam_record(record).await;
        assert!(duplicate.is_err());
        assert!(duplicate.unwrap_err().to_string().to_lowercase().contains("unique"));
    }

    #[tokio::test]
    async fn test_complete_review_transitions_once() {
        let db = test_db().await;
        let user = db.get_or_create_user("alice").await.unwrap();
        let record = db.create_review_record(user.id, "answers.txt", "/tmp/answers.txt").await.unwrap();
        assert_eq!(record.status, ReviewStatus::Uploaded);

        assert!(db.complete_review(record.id, "Good work", "Keep going", Some(87)).await.unwrap());
        assert!(!db.complete_review(record.id, "Again", "Again", Some(10)).await.unwrap());

        let stored = db.get_review_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Reviewed);
        assert_eq!(stored.score, Some(87));
        assert_eq!(stored.review_result.as_deref(), Some("Good work"));
    }

    #[tokio::test]
    async fn test_learning_progress_counts_distinct_items() {
        let db = test_db().await;
        let user = db.get_or_create_user("alice").await.unwrap();

        db.create_learning_record(user.id, "Ch1", "Index", ConceptType::Concept, Some("x")).await.unwrap();
        db.create_learning_record(user.id, "Ch1", "Index", ConceptType::Concept, Some("y")).await.unwrap();
        db.create_learning_record(user.id, "Ch2", "Join", ConceptType::Content, None).await.unwrap();

        let progress = db.learning_progress(user.id).await.unwrap();
        assert_eq!(progress.chapters_studied, 2);
        assert_eq!(progress.concepts_learned, 2);
        assert_eq!(progress.recent_activity.len(), 3);
        assert_eq!(progress.recent_activity[0].concept, "Join");
    }
}
