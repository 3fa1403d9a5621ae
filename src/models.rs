use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Whether an explained item is one of a chapter's main concepts or main contents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConceptType {
    #[default]
    Concept,
    Content,
}

impl ConceptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Concept => "concept",
            ConceptType::Content => "content",
        }
    }
}

impl fmt::Display for ConceptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConceptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concept" => Ok(ConceptType::Concept),
            "content" => Ok(ConceptType::Content),
            other => Err(anyhow::anyhow!("Unknown concept type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningRecord {
    pub id: i64,
    pub user_id: i64,
    pub chapter: String,
    pub concept: String,
    pub concept_type: ConceptType,
    pub explanation: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExamStatus {
    Generated,
    Completed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::Generated => "generated",
            ExamStatus::Completed => "completed",
        }
    }
}

impl FromStr for ExamStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(ExamStatus::Generated),
            "completed" => Ok(ExamStatus::Completed),
            other => Err(anyhow::anyhow!("Unknown exam status '{}'", other)),
        }
    }
}

/// A generated exam. `chapters` and `questions` are stored as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExamRecord {
    pub id: i64,
    pub user_id: i64,
    pub exam_id: String,
    pub exam_name: String,
    pub chapters: String,
    pub questions: Option<String>,
    pub score: Option<i64>,
    pub status: ExamStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Uploaded,
    Reviewed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Uploaded => "uploaded",
            ReviewStatus::Reviewed => "reviewed",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(ReviewStatus::Uploaded),
            "reviewed" => Ok(ReviewStatus::Reviewed),
            other => Err(anyhow::anyhow!("Unknown review status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRecord {
    pub id: i64,
    pub user_id: i64,
    pub original_filename: String,
    pub file_path: Option<String>,
    pub review_result: Option<String>,
    pub suggestions: Option<String>,
    pub score: Option<i64>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentActivity {
    pub chapter: String,
    pub concept: String,
    pub concept_type: ConceptType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningProgress {
    pub chapters_studied: i64,
    pub concepts_learned: i64,
    pub recent_activity: Vec<RecentActivity>,
}

impl LearningProgress {
    pub fn empty() -> Self {
        Self {
            chapters_studied: 0,
            concepts_learned: 0,
            recent_activity: Vec::new(),
        }
    }
}

// Request bodies

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainRequest {
    pub chapter: Option<String>,
    pub concept: Option<String>,
    #[serde(rename = "type", default)]
    pub concept_type: ConceptType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchChapterRequest {
    pub chapter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateExamRequest {
    #[serde(default)]
    pub chapters: Vec<String>,
    #[serde(default)]
    pub question_types: Vec<String>,
    #[serde(default = "default_true")]
    pub use_ai: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewExamRequest {
    pub record_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetUsernameRequest {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMEndpointRequest {
    pub api_url: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCourseRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Supplying a knowledge base skips LLM generation
    pub knowledge_base: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCurrentCourseRequest {
    pub course_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_type_serde_and_parse() {
        assert_eq!(serde_json::to_string(&ConceptType::Content).unwrap(), "\"content\"");
        assert_eq!("concept".parse::<ConceptType>().unwrap(), ConceptType::Concept);
        assert!("topic".parse::<ConceptType>().is_err());
    }

    #[test]
    fn test_explain_request_defaults_to_concept() {
        let request: ExplainRequest =
            serde_json::from_str(r#"{"chapter": "Ch1", "concept": "Index"}"#).unwrap();
        assert_eq!(request.concept_type, ConceptType::Concept);

        let request: ExplainRequest =
            serde_json::from_str(r#"{"chapter": "Ch1", "concept": "Index", "type": "content"}"#).unwrap();
        assert_eq!(request.concept_type, ConceptType::Content);
    }

    #[test]
    fn test_generate_exam_request_defaults() {
        let request: GenerateExamRequest = serde_json::from_str(r#"{"chapters": ["Ch1"]}"#).unwrap();
        assert!(request.use_ai);
        assert!(request.question_types.is_empty());
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [ExamStatus::Generated, ExamStatus::Completed] {
            assert_eq!(status.as_str().parse::<ExamStatus>().unwrap(), status);
        }
        for status in [ReviewStatus::Uploaded, ReviewStatus::Reviewed] {
            assert_eq!(status.as_str().parse::<ReviewStatus>().unwrap(), status);
        }
    }
}
