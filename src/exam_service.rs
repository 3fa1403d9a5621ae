use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::{Database, NewExamRecord};
use crate::llm_client::extract_json_from_response;
use crate::llm_service::LLMService;
use crate::models::ExamRecord;
use crate::settings::SettingsStore;
use crate::{log_service_start, log_service_success, log_service_warn};

#[derive(Debug, thiserror::Error)]
pub enum ExamError {
    #[error("Exam '{0}' not found")]
    NotFound(String),

    #[error("None of the selected question types exist in the exam template")]
    NoQuestionTypes,

    #[error("Stored exam '{0}' is unreadable")]
    CorruptRecord(String),
}

/// A question type configured in the exam template.
///
/// Keys of the Chinese template format are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionType {
    #[serde(alias = "题型名称")]
    pub name: String,
    #[serde(alias = "题量", default = "default_count")]
    pub count: u32,
    #[serde(alias = "总分", default = "default_score")]
    pub total_score: u32,
    #[serde(alias = "考查重点", default)]
    pub focus: String,
    #[serde(alias = "内容范围", default)]
    pub scope: String,
    #[serde(alias = "答题要求", default)]
    pub requirements: String,
}

fn default_count() -> u32 {
    1
}

fn default_score() -> u32 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExamTemplate {
    #[serde(alias = "考试信息", default)]
    pub exam_info: ExamInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExamInfo {
    #[serde(alias = "题型列表", default)]
    pub question_types: Vec<QuestionType>,
}

impl ExamTemplate {
    /// Missing or malformed template files yield an empty template
    pub async fn load(path: &Path) -> Self {
        let loaded: Result<Self> = async {
            let raw = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&raw)?)
        }
        .await;

        match loaded {
            Ok(template) => template,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load exam template, using empty template");
                Self::default()
            }
        }
    }

    pub fn question_types(&self) -> &[QuestionType] {
        &self.exam_info.question_types
    }

    pub fn question_type(&self, name: &str) -> Option<&QuestionType> {
        self.exam_info.question_types.iter().find(|qt| qt.name == name)
    }

    /// Builds a paper in the requested type order. Unknown names are skipped and an
    /// empty selection means every configured type.
    pub fn create_paper(&self, chapters: &[String], type_names: &[String]) -> PaperSpec {
        let selected: Vec<String> = if type_names.is_empty() {
            self.exam_info.question_types.iter().map(|qt| qt.name.clone()).collect()
        } else {
            type_names.to_vec()
        };

        let sections = selected
            .iter()
            .filter_map(|name| match self.question_type(name) {
                Some(qt) => Some(PaperSection {
                    type_name: qt.name.clone(),
                    count: qt.count,
                    total_score: qt.total_score,
                    focus: qt.focus.clone(),
                    scope: qt.scope.clone(),
                    requirements: qt.requirements.clone(),
                }),
                None => {
                    warn!(question_type = %name, "Unknown question type skipped");
                    None
                }
            })
            .collect();

        PaperSpec {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            chapters: chapters.to_vec(),
            question_types: selected,
            sections,
            generated_questions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperSection {
    pub type_name: String,
    pub count: u32,
    pub total_score: u32,
    pub focus: String,
    pub scope: String,
    pub requirements: String,
}

/// Structured description of an exam paper, stored as the record's `questions` document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperSpec {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub chapters: Vec<String>,
    pub question_types: Vec<String>,
    pub sections: Vec<PaperSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_questions: Option<Vec<Vec<GeneratedQuestion>>>,
}

impl PaperSpec {
    pub fn total_score(&self) -> u32 {
        self.sections.iter().map(|s| s.total_score).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GeneratedQuestion {
    Structured {
        content: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        analysis: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RenderedPaper {
    pub paper_text: String,
    pub answer_key: String,
}

impl RenderedPaper {
    pub fn full_text(&self) -> String {
        format!("{}\n\n{}", self.paper_text, self.answer_key)
    }
}

/// Plain-text layout of a paper and its answer key.
///
/// Sections without generated questions get `count` placeholder lines.
pub fn render(paper: &PaperSpec, generated: Option<&[Vec<GeneratedQuestion>]>) -> RenderedPaper {
    let rule = "=".repeat(50);
    let mut lines = vec![
        "Learning Assistant Exam Paper".to_string(),
        rule.clone(),
        format!("Date: {}", paper.created_at.format("%Y-%m-%d")),
        format!("Chapters: {}", paper.chapters.join(", ")),
        String::new(),
    ];

    let mut answer_lines = vec!["Answer Key".to_string(), "-".repeat(30)];
    let mut number = 1;

    for (index, section) in paper.sections.iter().enumerate() {
        lines.push(format!(
            "{} ({} questions, {} points)",
            section.type_name, section.count, section.total_score
        ));
        if !section.focus.is_empty() {
            lines.push(format!("Focus: {}", section.focus));
        }
        if !section.requirements.is_empty() {
            lines.push(format!("Requirements: {}", section.requirements));
        }
        lines.push(String::new());

        let questions = generated
            .and_then(|all| all.get(index))
            .filter(|questions| !questions.is_empty());

        let mut section_answers = Vec::new();
        match questions {
            Some(questions) => {
                for question in questions {
                    match question {
                        GeneratedQuestion::Structured { content, options, answer, analysis } => {
                            lines.push(format!("{}. {}", number, content));
                            for option in options {
                                lines.push(format!("    {}", option));
                            }
                            section_answers.push(format!(
                                "{}. {}\n   Analysis: {}",
                                number,
                                answer.as_deref().unwrap_or("No answer provided"),
                                analysis.as_deref().unwrap_or("")
                            ));
                        }
                        GeneratedQuestion::Text(text) => {
                            lines.push(format!("{}. {}", number, text));
                            section_answers.push(format!("{}. (see question text)", number));
                        }
                    }
                    lines.push(String::new());
                    number += 1;
                }
            }
            None => {
                for _ in 0..section.count {
                    lines.push(format!("{}. [Question pending]", number));
                    lines.push(String::new());
                    number += 1;
                }
            }
        }

        if !section_answers.is_empty() {
            answer_lines.push(format!("[{}]", section.type_name));
            answer_lines.extend(section_answers);
            answer_lines.push(String::new());
        }
    }

    lines.push(format!("Total: {} points", paper.total_score()));
    lines.push(rule);

    RenderedPaper {
        paper_text: lines.join("\n"),
        answer_key: answer_lines.join("\n").trim_end().to_string(),
    }
}

/// Splits a question-generation reply into questions.
///
/// A JSON array (optionally fenced) is preferred; otherwise blank lines and
/// numbered lines delimit questions.
pub fn parse_generated_questions(text: &str) -> Vec<GeneratedQuestion> {
    let trimmed = text.trim();
    let extracted = extract_json_from_response(trimmed);
    let items = serde_json::from_str::<Vec<Value>>(trimmed)
        .or_else(|_| serde_json::from_str::<Vec<Value>>(&extracted));
    if let Ok(items) = items {
        let questions: Vec<GeneratedQuestion> = items.into_iter().filter_map(question_from_value).collect();
        if !questions.is_empty() {
            return questions;
        }
    }

    let mut questions = Vec::new();
    let mut current = String::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                questions.push(GeneratedQuestion::Text(std::mem::take(&mut current)));
            }
            continue;
        }

        let starts_question = line.starts_with(|c: char| c.is_ascii_digit()) || line.starts_with('第');
        if starts_question && !current.is_empty() {
            questions.push(GeneratedQuestion::Text(std::mem::take(&mut current)));
        }

        if current.is_empty() {
            current = line.to_string();
        } else {
            current.push('\n');
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        questions.push(GeneratedQuestion::Text(current));
    }

    questions
}

fn question_from_value(value: Value) -> Option<GeneratedQuestion> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(GeneratedQuestion::Text(text)),
        Value::Object(map) => {
            let text_of = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
            let content = text_of("content").or_else(|| text_of("question"))?;
            let options = map
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| opts.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            Some(GeneratedQuestion::Structured {
                content,
                options,
                answer: text_of("answer"),
                analysis: text_of("analysis"),
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedExam {
    pub exam_id: String,
    pub record_id: i64,
    pub exam_paper: PaperSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedExam {
    pub exam_id: String,
    pub exam_paper: PaperSpec,
    pub formatted_paper: String,
    pub answer_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedExamFile {
    pub filename: String,
    pub file_path: PathBuf,
}

pub struct ExamService {
    db: Database,
    llm: LLMService,
    settings: Arc<SettingsStore>,
    template_path: PathBuf,
    upload_dir: PathBuf,
}

impl ExamService {
    pub fn new(
        db: Database,
        llm: LLMService,
        settings: Arc<SettingsStore>,
        template_path: PathBuf,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            llm,
            settings,
            template_path,
            upload_dir,
        }
    }

    pub async fn template(&self) -> ExamTemplate {
        ExamTemplate::load(&self.template_path).await
    }

    pub async fn question_types(&self) -> Vec<QuestionType> {
        self.template().await.exam_info.question_types
    }

    pub async fn create_exam(
        &self,
        username: &str,
        chapters: &[String],
        type_names: &[String],
    ) -> Result<CreatedExam> {
        let user = self.db.get_or_create_user(username).await?;
        let paper = self.template().await.create_paper(chapters, type_names);
        if paper.sections.is_empty() {
            return Err(ExamError::NoQuestionTypes.into());
        }

        let course = self.settings.current_course().await;
        let exam_name = format!("{} exam {}", course, Utc::now().format("%Y%m%d_%H%M%S"));

        let record = self
            .db
            .create_exam_record(NewExamRecord {
                user_id: user.id,
                exam_id: paper.id.clone(),
                exam_name,
                chapters_json: serde_json::to_string(chapters)?,
                questions_json: serde_json::to_string(&paper)?,
            })
            .await?;

        info!(exam_id = %record.exam_id, sections = paper.sections.len(), "Exam created");
        Ok(CreatedExam {
            exam_id: record.exam_id,
            record_id: record.id,
            exam_paper: paper,
        })
    }

    /// Fills every section with questions from the LLM, falling back to numbered
    /// placeholders for sections whose call fails. Without AI the paper is only rendered.
    pub async fn generate_questions(&self, exam_id: &str, use_ai: bool) -> Result<GeneratedExam> {
        let mut paper = self.load_paper(exam_id).await?;

        if !use_ai {
            let rendered = render(&paper, None);
            return Ok(GeneratedExam {
                exam_id: exam_id.to_string(),
                exam_paper: paper,
                formatted_paper: rendered.full_text(),
                answer_key: rendered.answer_key,
            });
        }

        let start = Instant::now();
        log_service_start!("exam_service", "generate_questions", item_count = paper.sections.len());
        let course = self.settings.current_course().await;

        let mut generated = Vec::with_capacity(paper.sections.len());
        for section in &paper.sections {
            let questions = match self.llm.generate_questions(section, &paper.chapters, &course).await {
                Ok(text) => {
                    let parsed = parse_generated_questions(&text);
                    if parsed.is_empty() { placeholders(section) } else { parsed }
                }
                Err(e) => {
                    log_service_warn!(
                        "exam_service",
                        "generate_questions",
                        format!("{} generation failed: {}", section.type_name, e)
                    );
                    placeholders(section)
                }
            };
            generated.push(questions);
        }

        paper.generated_questions = Some(generated);
        let updated = self
            .db
            .update_exam_questions(exam_id, &serde_json::to_string(&paper)?)
            .await?;
        if !updated {
            return Err(ExamError::NotFound(exam_id.to_string()).into());
        }

        let rendered = render(&paper, paper.generated_questions.as_deref());
        log_service_success!(
            "exam_service",
            "generate_questions",
            item_count = paper.sections.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );

        Ok(GeneratedExam {
            exam_id: exam_id.to_string(),
            exam_paper: paper,
            formatted_paper: rendered.full_text(),
            answer_key: rendered.answer_key,
        })
    }

    /// Renders the stored paper, including any generated questions
    pub async fn render_stored(&self, exam_id: &str) -> Result<RenderedPaper> {
        let paper = self.load_paper(exam_id).await?;
        Ok(render(&paper, paper.generated_questions.as_deref()))
    }

    /// Writes `exam_{exam_id}_{timestamp}.txt` under the upload directory
    pub async fn save_exam_file(&self, exam_id: &str, text: &str) -> Result<SavedExamFile> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.upload_dir.display()))?;

        let filename = format!("exam_{}_{}.txt", exam_id, Utc::now().format("%Y%m%d_%H%M%S"));
        let file_path = self.upload_dir.join(&filename);
        tokio::fs::write(&file_path, text)
            .await
            .with_context(|| format!("Failed to write {}", file_path.display()))?;

        info!(exam_id = %exam_id, path = %file_path.display(), "Exam paper saved");
        Ok(SavedExamFile { filename, file_path })
    }

    pub async fn get(&self, exam_id: &str) -> Result<Option<ExamRecord>> {
        self.db.get_exam_record(exam_id).await
    }

    pub async fn history(&self, username: &str) -> Result<Vec<ExamRecord>> {
        match self.db.find_user(username).await? {
            Some(user) => self.db.exam_history(user.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn load_paper(&self, exam_id: &str) -> Result<PaperSpec> {
        let record = self
            .db
            .get_exam_record(exam_id)
            .await?
            .ok_or_else(|| ExamError::NotFound(exam_id.to_string()))?;

        let raw = record
            .questions
            .ok_or_else(|| ExamError::CorruptRecord(exam_id.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| {
            error!(exam_id = %exam_id, error = %e, "Stored exam paper failed to parse");
            anyhow::Error::from(ExamError::CorruptRecord(exam_id.to_string()))
        })
    }
}

fn placeholders(section: &PaperSection) -> Vec<GeneratedQuestion> {
    (1..=section.count)
        .map(|i| GeneratedQuestion::Text(format!("[{} question {}]", section.type_name, i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ExamTemplate {
        serde_json::from_str(
            r#"{
                "考试信息": {
                    "题型列表": [
                        {"题型名称": "Multiple choice", "题量": 3, "总分": 30, "考查重点": "Basics"},
                        {"题型名称": "Short answer", "题量": 2, "总分": 20, "答题要求": "Be brief"},
                        {"name": "Design", "count": 1, "total_score": 50}
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    fn chapters() -> Vec<String> {
        vec!["Chapter 1".to_string(), "Chapter 2".to_string()]
    }

    #[test]
    fn test_create_paper_keeps_requested_order_and_skips_unknown() {
        let paper = template().create_paper(
            &chapters(),
            &["Design".to_string(), "Essay".to_string(), "Multiple choice".to_string()],
        );
        let names: Vec<&str> = paper.sections.iter().map(|s| s.type_name.as_str()).collect();
        assert_eq!(names, vec!["Design", "Multiple choice"]);
        assert_eq!(paper.total_score(), 80);
    }

    #[test]
    fn test_empty_selection_uses_every_type() {
        let paper = template().create_paper(&chapters(), &[]);
        assert_eq!(paper.sections.len(), 3);
        assert_eq!(paper.sections[1].requirements, "Be brief");
    }

    #[test]
    fn test_render_without_questions_emits_placeholders() {
        let paper = template().create_paper(&chapters(), &[]);
        let rendered = render(&paper, None);

        let placeholder_lines = rendered
            .paper_text
            .lines()
            .filter(|line| line.ends_with("[Question pending]"))
            .count();
        assert_eq!(placeholder_lines, 6);
        assert!(rendered.paper_text.contains("6. [Question pending]"));
        assert!(rendered.paper_text.contains("Total: 100 points"));
        assert!(rendered.paper_text.contains(&format!("Date: {}", paper.created_at.format("%Y-%m-%d"))));
    }

    #[test]
    fn test_render_is_deterministic() {
        let paper = template().create_paper(&chapters(), &[]);
        assert_eq!(render(&paper, None), render(&paper, None));
    }

    #[test]
    fn test_render_generated_questions_and_answer_key() {
        let paper = template().create_paper(&chapters(), &["Multiple choice".to_string(), "Design".to_string()]);
        let generated = vec![
            vec![GeneratedQuestion::Structured {
                content: "Which key identifies a row?".to_string(),
                options: vec!["A. Primary".to_string(), "B. Foreign".to_string()],
                answer: Some("A".to_string()),
                analysis: Some("Primary keys are unique".to_string()),
            }],
            vec![],
        ];

        let rendered = render(&paper, Some(&generated));
        assert!(rendered.paper_text.contains("1. Which key identifies a row?"));
        assert!(rendered.paper_text.contains("    B. Foreign"));
        // The empty Design section falls back to a placeholder
        assert!(rendered.paper_text.contains("2. [Question pending]"));
        assert!(rendered.answer_key.contains("[Multiple choice]"));
        assert!(rendered.answer_key.contains("1. A\n   Analysis: Primary keys are unique"));
    }

    #[test]
    fn test_parse_generated_questions_prefers_json() {
        let text = "```json\n[{\"content\": \"Q1\", \"options\": [\"A. x\"], \"answer\": \"A\"}, \"Q2\"]\n```";
        let questions = parse_generated_questions(text);
        assert_eq!(questions.len(), 2);
        assert!(matches!(&questions[0], GeneratedQuestion::Structured { content, .. } if content == "Q1"));
        assert_eq!(questions[1], GeneratedQuestion::Text("Q2".to_string()));
    }

    #[test]
    fn test_parse_generated_questions_reads_unfenced_array() {
        let text = r#"[{"content":"Q1","answer":"A1"},{"content":"Q2","answer":"A2"}]"#;
        let questions = parse_generated_questions(text);
        assert_eq!(questions.len(), 2);
        assert!(matches!(
            &questions[0],
            GeneratedQuestion::Structured { content, answer: Some(answer), .. } if content == "Q1" && answer == "A1"
        ));
        assert!(matches!(
            &questions[1],
            GeneratedQuestion::Structured { content, answer: Some(answer), .. } if content == "Q2" && answer == "A2"
        ));

        let with_prose = format!("Here are the questions:\n{}", text);
        assert_eq!(parse_generated_questions(&with_prose), questions);
    }

    #[test]
    fn test_parse_generated_questions_falls_back_to_numbered_text() {
        let text = "Here are your questions:\n1. What is a relation?\nExplain briefly.\n2. Define a key.\n\nA trailing note";
        let questions = parse_generated_questions(text);
        assert_eq!(
            questions,
            vec![
                GeneratedQuestion::Text("Here are your questions:".to_string()),
                GeneratedQuestion::Text("1. What is a relation?\nExplain briefly.".to_string()),
                GeneratedQuestion::Text("2. Define a key.".to_string()),
                GeneratedQuestion::Text("A trailing note".to_string()),
            ]
        );
    }

    #[test]
    fn test_placeholders_are_numbered_per_section() {
        let section = &template().create_paper(&chapters(), &["Short answer".to_string()]).sections[0];
        assert_eq!(
            placeholders(section),
            vec![
                GeneratedQuestion::Text("[Short answer question 1]".to_string()),
                GeneratedQuestion::Text("[Short answer question 2]".to_string()),
            ]
        );
    }

    #[test]
    fn test_paper_round_trips_through_record_json() {
        let mut paper = template().create_paper(&chapters(), &[]);
        paper.generated_questions = Some(vec![vec![GeneratedQuestion::Text("Q".to_string())]]);
        let stored = serde_json::to_string(&paper).unwrap();
        assert_eq!(serde_json::from_str::<PaperSpec>(&stored).unwrap(), paper);
    }
}
