use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Flat-file cache holding the last generated explanation per (chapter, concept)
#[derive(Debug, Clone)]
pub struct ExplanationCache {
    dir: PathBuf,
}

impl ExplanationCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, chapter: &str, concept: &str) -> PathBuf {
        self.dir.join(cache_file_name(chapter, concept))
    }

    /// Returns the cached text, or `None` on a miss. Unreadable entries count as misses.
    pub async fn load(&self, chapter: &str, concept: &str) -> Option<String> {
        let path = self.path_for(chapter, concept);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => {
                debug!(path = %path.display(), "Explanation cache hit");
                Some(text)
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cached explanation");
                None
            }
        }
    }

    pub async fn save(&self, chapter: &str, concept: &str, explanation: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;

        let path = self.path_for(chapter, concept);
        tokio::fs::write(&path, explanation)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!(path = %path.display(), "Explanation cached");
        Ok(())
    }

    /// Removes the entry if present. Deleting a missing entry is not an error.
    pub async fn delete(&self, chapter: &str, concept: &str) -> Result<()> {
        let path = self.path_for(chapter, concept);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Explanation cache entry removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

fn cache_file_name(chapter: &str, concept: &str) -> String {
    format!("{}_{}.txt", chapter, concept)
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_replaces_path_characters() {
        assert_eq!(cache_file_name("Ch 1: Intro", "A/B?"), "Ch 1_ Intro_A_B_.txt");
        assert_eq!(cache_file_name("..", "..\\x"), ".._.._x.txt");
    }

    #[tokio::test]
    async fn test_save_then_load_returns_identical_text() {
        let dir = TempDir::new().unwrap();
        let cache = ExplanationCache::new(dir.path().join("explanations"));

        let text = "## Definition\nA relation is a set of tuples.\n\n| a | b |";
        cache.save("Chapter 2", "Relation", text).await.unwrap();
        assert_eq!(cache.load("Chapter 2", "Relation").await.as_deref(), Some(text));
    }

    #[tokio::test]
    async fn test_delete_then_load_misses() {
        let dir = TempDir::new().unwrap();
        let cache = ExplanationCache::new(dir.path());

        cache.save("Chapter 2", "Relation", "text").await.unwrap();
        cache.delete("Chapter 2", "Relation").await.unwrap();
        assert!(cache.load("Chapter 2", "Relation").await.is_none());

        // Second delete is a no-op
        cache.delete("Chapter 2", "Relation").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ExplanationCache::new(dir.path().join("never-created"));
        assert!(cache.load("Chapter 1", "DBMS").await.is_none());
    }
}
