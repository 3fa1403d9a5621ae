use tracing::{debug, info};

use crate::exam_service::PaperSection;
use crate::llm_client::{LLMClient, LLMError};
use crate::models::ConceptType;

const EXPLANATION_MAX_TOKENS: u32 = 4000;
const QUESTION_MAX_TOKENS: u32 = 3000;
const REVIEW_MAX_TOKENS: u32 = 3000;
const ADVICE_MAX_TOKENS: u32 = 2000;
const COURSE_MAX_TOKENS: u32 = 4000;

const TABLE_KEYWORDS: [&str; 18] = [
    "对比", "比较", "特点", "类型", "分类", "范式", "约束", "权限", "级别", "区别",
    "compar", "versus", "type", "classif", "normal form", "constraint", "level", "difference",
];
const FLOWCHART_KEYWORDS: [&str; 18] = [
    "流程", "步骤", "算法", "处理", "转换", "操作", "检验", "设计", "原理",
    "process", "step", "algorithm", "transform", "operation", "check", "design", "principle", "procedure",
];
const SIMPLE_KEYWORDS: [&str; 8] = ["定义", "概念", "基本", "简介", "definition", "concept", "basic", "introduction"];
const SYSTEM_KEYWORDS: [&str; 8] = ["系统", "模型", "架构", "DBMS", "system", "model", "architecture", "engine"];
const BASIC_TERMS: [&str; 10] = ["数据库", "数据", "信息", "字段", "记录", "database", "data", "information", "field", "record"];

/// Which optional sections an explanation should include
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentNeeds {
    pub table: bool,
    pub flowchart: bool,
}

/// Prompt construction for every LLM-backed feature
#[derive(Clone)]
pub struct LLMService {
    client: LLMClient,
}

impl LLMService {
    pub fn new(client: LLMClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &LLMClient {
        &self.client
    }

    pub fn model_name(&self) -> String {
        self.client.model_name()
    }

    pub async fn explain(
        &self,
        chapter: &str,
        concept: &str,
        concept_type: ConceptType,
        course: &str,
    ) -> Result<String, LLMError> {
        let needs = analyze_content_needs(concept, concept_type);
        info!(
            chapter = %chapter,
            concept = %concept,
            concept_type = %concept_type,
            table = needs.table,
            flowchart = needs.flowchart,
            "Generating explanation"
        );

        let prompt = explanation_prompt(chapter, concept, concept_type, needs, course);
        self.client.complete(&prompt, EXPLANATION_MAX_TOKENS).await
    }

    pub async fn generate_questions(
        &self,
        section: &PaperSection,
        chapters: &[String],
        course: &str,
    ) -> Result<String, LLMError> {
        info!(
            question_type = %section.type_name,
            count = section.count,
            chapter_count = chapters.len(),
            "Generating exam questions"
        );

        let prompt = format!(
            r#"You are a teacher of the course "{course}". Write {count} {type_name} questions for an exam.

Chapters covered: {chapters}
Focus: {focus}
Scope: {scope}
Answer requirements: {requirements}

{style}

Rules:
1. Every question must come from the listed chapters
2. Difficulty suits undergraduate students
3. Wording is clear and unambiguous
4. Multiple-choice questions have four options labelled A-D
5. Every question has a reference answer and a short analysis

Respond with a JSON array only, one object per question:
[
  {{"content": "question text", "options": ["A. ...", "B. ...", "C. ...", "D. ..."], "answer": "reference answer", "analysis": "why"}}
]
Use an empty options list for questions without options."#,
            course = course,
            count = section.count,
            type_name = section.type_name,
            chapters = chapters.join(", "),
            focus = or_none(&section.focus),
            scope = or_none(&section.scope),
            requirements = or_none(&section.requirements),
            style = course_style(course),
        );

        self.client.complete(&prompt, QUESTION_MAX_TOKENS).await
    }

    /// Grading narrative for an answered paper
    pub async fn review_answers(
        &self,
        answers: &str,
        knowledge_context: &str,
        course: &str,
    ) -> Result<String, LLMError> {
        info!(answer_length = answers.len(), "Reviewing submitted answers");

        let prompt = format!(
            r#"You are a teacher of the course "{course}". Grade the following exam paper.

{answers}

Course background:
{knowledge_context}

{style}

Structure the review as:
1. Per-question grading with a score and comment for each question
2. Overall evaluation of strengths and weaknesses
3. Weak points: the knowledge points that need more work
4. Study advice with concrete steps

End with a line of the form "Total: <score>"."#,
            course = course,
            answers = answers,
            knowledge_context = knowledge_context,
            style = course_style(course),
        );

        self.client.complete(&prompt, REVIEW_MAX_TOKENS).await
    }

    pub async fn learning_advice(
        &self,
        weak_points: &str,
        chapter_context: &str,
        course: &str,
    ) -> Result<String, LLMError> {
        let prompt = format!(
            r#"You are a teacher of the course "{course}". Give a student study advice.

Weak points: {weak_points}
Related chapters: {chapter_context}

{style}

Cover:
1. What to review first
2. Study methods
3. Recommended exercises
4. A suggested study order

Keep every suggestion concrete and actionable."#,
            course = course,
            weak_points = weak_points,
            chapter_context = chapter_context,
            style = course_style(course),
        );

        self.client.complete(&prompt, ADVICE_MAX_TOKENS).await
    }

    /// Asks for a complete knowledge base document for a new course
    pub async fn generate_course(&self, name: &str, description: &str) -> Result<String, LLMError> {
        info!(course = %name, "Generating course knowledge base");

        let prompt = format!(
            r#"You are an experienced curriculum designer. Create the knowledge base for the course "{name}".

Course description: {description}

Return JSON with exactly this structure:
{{
  "subject": "{name}",
  "chapters": {{
    "Chapter 1 <title>": {{
      "mainConcepts": ["concept", "concept", "concept"],
      "mainContents": ["knowledge point", "knowledge point", "knowledge point"]
    }}
  }}
}}

Requirements:
1. 8 to 12 chapters named after the course's usual teaching sequence
2. 3 to 5 main concepts per chapter (core theory)
3. 3 to 6 main contents per chapter (concrete skills or applications)
4. Names must be specific enough to explain individually with tables, diagrams and examples
5. Return only the JSON document"#,
            name = name,
            description = if description.trim().is_empty() { "none" } else { description },
        );

        let reply = self.client.complete(&prompt, COURSE_MAX_TOKENS).await?;
        debug!(course = %name, response_length = reply.len(), "Course generation reply received");
        Ok(reply)
    }
}

/// Decides whether an explanation gets a comparison table and a flowchart
pub fn analyze_content_needs(concept: &str, concept_type: ConceptType) -> ContentNeeds {
    let lowered = concept.to_lowercase();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(&k.to_lowercase()));

    let mut needs = ContentNeeds {
        table: has_any(&TABLE_KEYWORDS),
        flowchart: has_any(&FLOWCHART_KEYWORDS),
    };

    match concept_type {
        ConceptType::Concept => {
            if !has_any(&SIMPLE_KEYWORDS) {
                needs.table = true;
            }
            if has_any(&SYSTEM_KEYWORDS) {
                needs.flowchart = true;
            } else if BASIC_TERMS.iter().any(|term| lowered == term.to_lowercase()) {
                needs.flowchart = false;
            }
        }
        ConceptType::Content => {}
    }

    needs
}

fn explanation_prompt(
    chapter: &str,
    concept: &str,
    concept_type: ConceptType,
    needs: ContentNeeds,
    course: &str,
) -> String {
    let mut sections = match concept_type {
        ConceptType::Concept => vec![
            "## 1. Definition\nGive a precise, concise definition.".to_string(),
            "## 2. Plain-language explanation\nExplain the idea so a beginner understands why it matters.".to_string(),
            "## 3. In depth\nExplain the meaning and significance in detail.".to_string(),
        ],
        ConceptType::Content => vec![
            "## 1. Overview\nWhy this knowledge point matters and where it sits in the course.".to_string(),
            "## 2. Key ideas\nExplain the underlying concepts in plain language.".to_string(),
            "## 3. Principles\nExplain the relevant principles and methods in depth.".to_string(),
        ],
    };

    if needs.table {
        sections.push(
            "## 4. Comparison\nA markdown table of the main characteristics:\n| Aspect | Description | Importance |\n|---|---|---|"
                .to_string(),
        );
    }

    if needs.flowchart {
        sections.push(
            "## 5. Process\nA Mermaid flowchart of the process:\n```mermaid\ngraph TD\n    A[\"Start\"] --> B[\"Step\"]\n    B --> C{\"Check\"}\n    C -->|yes| D[\"Act\"]\n    C -->|no| E[\"Handle\"]\n```\nWrap node labels in double quotes."
                .to_string(),
        );
    }

    match concept_type {
        ConceptType::Concept => {
            sections.push("## 6. Applications\n- Scenario 1\n- Scenario 2".to_string());
            sections.push("## 7. Key takeaways\n- Point 1\n- Point 2".to_string());
        }
        ConceptType::Content => {
            sections.push("## 6. Worked example\nBackground, implementation and analysis of the result.".to_string());
            sections.push("## 7. Study advice\n- What to master\n- Practice suggestions\n- Further reading".to_string());
        }
    }

    let subject_label = match concept_type {
        ConceptType::Concept => "Concept",
        ConceptType::Content => "Knowledge point",
    };

    format!(
        "You are a teacher of the course \"{course}\". Explain the following in detail.\n\nChapter: {chapter}\n{subject_label}: {concept}\n\n{style}\n\nUse this structure:\n\n{sections}\n\nKeep the content accurate, detailed and easy to follow.",
        course = course,
        chapter = chapter,
        subject_label = subject_label,
        concept = concept,
        style = course_style(course),
        sections = sections.join("\n\n"),
    )
}

/// Tone instruction matched loosely against the course name
pub fn course_style(course: &str) -> &'static str {
    const STYLES: [(&[&str], &str); 8] = [
        (&["数据库", "database"], "Use a rigorous, logical academic tone that ties theory to practice."),
        (&["编程", "programming"], "Teach step by step with plenty of code examples and practical guidance."),
        (&["算法", "algorithm"], "Explain with clear, explicit steps and show the reasoning process."),
        (&["数据结构", "data structure"], "Use rich diagrams and clear concepts with visual explanations."),
        (&["网络", "network"], "Explain layer by layer with a protocol focus and real network scenarios."),
        (&["操作系统", "operating system"], "Take a systematic, mechanism-oriented approach linking principle and implementation."),
        (&["软件工程", "software engineering"], "Take a practice-oriented engineering approach focused on methods."),
        (&["机器学习", "machine learning", "人工智能", "artificial intelligence"], "Be mathematically careful and experiment-driven, with current examples."),
    ];

    let lowered = course.to_lowercase();
    STYLES
        .iter()
        .find(|(keys, _)| keys.iter().any(|key| lowered.contains(key)))
        .map(|(_, style)| *style)
        .unwrap_or("Teach in an accessible, step-by-step style that stays accurate.")
}

fn or_none(value: &str) -> &str {
    if value.trim().is_empty() { "none" } else { value }
}
