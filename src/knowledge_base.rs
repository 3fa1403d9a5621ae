use anyhow::{anyhow, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use tracing::{error, info};

use crate::models::ConceptType;

/// A course's subject, its chapters and the concept/content lists per chapter.
///
/// Chapter order follows the source document. The Chinese keys `科目` and `章节`
/// are accepted alongside `subject` and `chapters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBase {
    #[serde(alias = "科目", default)]
    pub subject: String,
    #[serde(alias = "章节", default)]
    pub chapters: ChapterList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterList(pub Vec<Chapter>);

#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub name: String,
    pub main_concepts: Vec<String>,
    pub main_contents: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ChapterBody<C> {
    #[serde(rename = "mainConcepts", default)]
    main_concepts: C,
    #[serde(rename = "mainContents", default)]
    main_contents: C,
}

impl Serialize for ChapterList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for chapter in &self.0 {
            map.serialize_entry(
                &chapter.name,
                &ChapterBody {
                    main_concepts: &chapter.main_concepts,
                    main_contents: &chapter.main_contents,
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ChapterList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChapterListVisitor;

        impl<'de> Visitor<'de> for ChapterListVisitor {
            type Value = ChapterList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of chapter name to chapter contents")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut chapters = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, body)) = access.next_entry::<String, ChapterBody<Vec<String>>>()? {
                    chapters.push(Chapter {
                        name,
                        main_concepts: body.main_concepts,
                        main_contents: body.main_contents,
                    });
                }
                Ok(ChapterList(chapters))
            }
        }

        deserializer.deserialize_map(ChapterListVisitor)
    }
}

/// One explainable item: a concept or content entry of a chapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyItem {
    pub chapter: String,
    pub concept: String,
    pub concept_type: ConceptType,
}

/// Entry of a chapter's combined item list
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChapterItem {
    #[serde(rename = "type")]
    pub concept_type: ConceptType,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    #[serde(rename = "type")]
    pub concept_type: ConceptType,
    pub chapter: String,
    pub content: String,
}

impl KnowledgeBase {
    /// Reads a knowledge base document. Missing or malformed files yield an empty base.
    pub async fn load(path: &Path) -> Self {
        match Self::try_load(path).await {
            Ok(kb) => {
                info!(path = %path.display(), chapters = kb.chapters.0.len(), "Knowledge base loaded");
                kb
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load knowledge base, using empty document");
                Self::default()
            }
        }
    }

    pub async fn try_load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn chapter_names(&self) -> Vec<String> {
        self.chapters.0.iter().map(|c| c.name.clone()).collect()
    }

    pub fn chapter(&self, name: &str) -> Option<&Chapter> {
        self.chapters.0.iter().find(|c| c.name == name)
    }

    pub fn concepts(&self, chapter: &str) -> &[String] {
        self.chapter(chapter).map(|c| c.main_concepts.as_slice()).unwrap_or(&[])
    }

    pub fn contents(&self, chapter: &str) -> &[String] {
        self.chapter(chapter).map(|c| c.main_contents.as_slice()).unwrap_or(&[])
    }

    /// Concepts first, then contents
    pub fn chapter_items(&self, chapter: &str) -> Vec<ChapterItem> {
        let concepts = self.concepts(chapter).iter().map(|text| ChapterItem {
            concept_type: ConceptType::Concept,
            text: text.clone(),
        });
        let contents = self.contents(chapter).iter().map(|text| ChapterItem {
            concept_type: ConceptType::Content,
            text: text.clone(),
        });
        concepts.chain(contents).collect()
    }

    /// Explainable items of one chapter, or `None` if the chapter does not exist
    pub fn study_items(&self, chapter: &str) -> Option<Vec<StudyItem>> {
        let found = self.chapter(chapter)?;
        Some(Self::items_of(found).collect())
    }

    /// Explainable items of every chapter, in document order
    pub fn all_study_items(&self) -> Vec<StudyItem> {
        self.chapters.0.iter().flat_map(Self::items_of).collect()
    }

    fn items_of(chapter: &Chapter) -> impl Iterator<Item = StudyItem> + '_ {
        let concepts = chapter.main_concepts.iter().map(move |concept| StudyItem {
            chapter: chapter.name.clone(),
            concept: concept.clone(),
            concept_type: ConceptType::Concept,
        });
        let contents = chapter.main_contents.iter().map(move |content| StudyItem {
            chapter: chapter.name.clone(),
            concept: content.clone(),
            concept_type: ConceptType::Content,
        });
        concepts.chain(contents)
    }

    /// Case-insensitive substring search over every concept and content
    pub fn search(&self, keyword: &str) -> Vec<SearchHit> {
        let needle = keyword.to_lowercase();
        let mut hits = Vec::new();

        for chapter in &self.chapters.0 {
            let tagged = chapter
                .main_concepts
                .iter()
                .map(|text| (ConceptType::Concept, text))
                .chain(chapter.main_contents.iter().map(|text| (ConceptType::Content, text)));

            for (concept_type, text) in tagged {
                if text.to_lowercase().contains(&needle) {
                    hits.push(SearchHit {
                        concept_type,
                        chapter: chapter.name.clone(),
                        content: text.clone(),
                    });
                }
            }
        }

        hits
    }

    /// Condensed excerpt used as grading context
    pub fn knowledge_context(&self, max_chapters: usize, max_concepts: usize) -> String {
        let mut lines = vec![format!("Subject: {}", self.subject)];
        for chapter in self.chapters.0.iter().take(max_chapters) {
            let concepts: Vec<&str> = chapter
                .main_concepts
                .iter()
                .take(max_concepts)
                .map(String::as_str)
                .collect();
            lines.push(format!("{}: {}", chapter.name, concepts.join(", ")));
        }
        lines.join("\n")
    }

    /// Structural check applied to generated or uploaded course documents
    pub fn validate(&self) -> Result<()> {
        if self.subject.trim().is_empty() {
            return Err(anyhow!("knowledge base has no subject"));
        }
        if self.chapters.0.is_empty() {
            return Err(anyhow!("knowledge base has no chapters"));
        }
        for chapter in &self.chapters.0 {
            if chapter.name.trim().is_empty() {
                return Err(anyhow!("knowledge base contains a chapter without a name"));
            }
            if chapter.main_concepts.is_empty() && chapter.main_contents.is_empty() {
                return Err(anyhow!("chapter '{}' has no concepts or contents", chapter.name));
            }
        }
        Ok(())
    }
}
