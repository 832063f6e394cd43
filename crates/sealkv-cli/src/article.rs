//! Articles kept in an encrypted store, one JSON record per article.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sealkv_core::{StoreManager, StoreOptions, VaultError};

pub const ARTICLE_BUCKET: &str = "al-article";
const KEY_PREFIX: &str = "a-";
const ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_to_mark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn new(title: &str, content: &str, content_to_mark: &str, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: title.to_string(),
            tags,
            content: content.to_string(),
            content_to_mark: content_to_mark.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct ArticleManager {
    store: StoreManager,
}

fn key_for(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

impl ArticleManager {
    /// Opens the store described by `options`, adding the article bucket.
    pub fn open(mut options: StoreOptions, secret: &[u8]) -> Result<Self> {
        if !options.buckets.iter().any(|b| b == ARTICLE_BUCKET) {
            options.buckets.push(ARTICLE_BUCKET.to_string());
        }
        let store = StoreManager::create(options, secret)?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &StoreManager {
        &self.store
    }

    pub fn create(
        &self,
        title: &str,
        content: &str,
        content_to_mark: &str,
        tags: Vec<String>,
    ) -> Result<Article> {
        let mut article = Article::new(title, content, content_to_mark, tags);
        self.save(&mut article)?;
        Ok(article)
    }

    /// All articles, most recently updated first. Records that no longer
    /// decode as articles are skipped.
    pub fn list(&self) -> Result<Vec<Article>> {
        let records = self.store.get_by_prefix(ARTICLE_BUCKET, KEY_PREFIX)?;
        let mut articles: Vec<Article> = records
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(article) => Some(article),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable article");
                    None
                }
            })
            .collect();
        articles.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(articles)
    }

    pub fn get(&self, id: &str) -> Result<Option<Article>> {
        if id.is_empty() {
            return Err(anyhow!("article id is empty"));
        }
        let key = key_for(id);
        debug!(%key, "loading article");
        Ok(self.store.get_one_as(ARTICLE_BUCKET, &key)?)
    }

    /// Assigns an id when missing and stamps `updated_at`.
    pub fn save(&self, article: &mut Article) -> Result<()> {
        if article.id.is_empty() || article.id == "0" {
            article.id = random_id();
        }
        article.updated_at = Utc::now();
        self.store
            .save(ARTICLE_BUCKET, &key_for(&article.id), &*article)?;
        Ok(())
    }

    /// Rewrites an existing article, keeping its stored creation time.
    pub fn update(&self, article: &mut Article) -> Result<()> {
        if article.id.is_empty() || article.id == "0" {
            return Err(anyhow!("article has no id"));
        }
        let stored = self
            .get(&article.id)?
            .ok_or_else(|| anyhow!("article {} not found", article.id))?;
        article.created_at = stored.created_at;
        self.save(article)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(VaultError::KeyInvalid {
                op: sealkv_core::Operation::Delete,
            }
            .into());
        }
        self.store.delete(ARTICLE_BUCKET, &key_for(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn manager() -> (TempDir, ArticleManager) {
        let dir = tempdir().unwrap();
        let options = StoreOptions::new("articles.redb", dir.path());
        let manager = ArticleManager::open(options, b"article secret").unwrap();
        (dir, manager)
    }

    #[test]
    fn create_assigns_id_and_reads_back() {
        let (_dir, articles) = manager();
        let created = articles
            .create("First", "body", "**body**", vec!["rust".into()])
            .unwrap();
        assert_eq!(created.id.len(), ID_LEN);
        assert!(created.id.chars().all(|c| c.is_ascii_alphanumeric()));

        let loaded = articles.get(&created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(articles.get("missing-id").unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first_and_skips_bad_records() {
        let (_dir, articles) = manager();
        let older = articles.create("older", "", "", vec![]).unwrap();
        let newer = articles.create("newer", "", "", vec![]).unwrap();
        articles
            .store()
            .save_raw(ARTICLE_BUCKET, "a-broken", b"{\"id\": 7}")
            .unwrap();

        let listed = articles.list().unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| a.id.as_str()).collect();
        if newer.updated_at == older.updated_at {
            assert_eq!(ids.len(), 2);
        } else {
            assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
        }
    }

    #[test]
    fn update_keeps_creation_time() {
        let (_dir, articles) = manager();
        let created = articles.create("draft", "v1", "", vec![]).unwrap();

        let mut edited = created.clone();
        edited.title = "final".into();
        edited.created_at = Utc::now() + chrono::Duration::days(1);
        articles.update(&mut edited).unwrap();

        let loaded = articles.get(&created.id).unwrap().unwrap();
        assert_eq!(loaded.title, "final");
        assert_eq!(loaded.created_at, created.created_at);
        assert!(loaded.updated_at >= created.updated_at);
    }

    #[test]
    fn update_of_unknown_article_fails() {
        let (_dir, articles) = manager();
        let mut ghost = Article::new("ghost", "", "", vec![]);
        assert!(articles.update(&mut ghost).is_err());
        ghost.id = "nothere12345".into();
        assert!(articles.update(&mut ghost).is_err());
    }

    #[test]
    fn delete_removes_article() {
        let (_dir, articles) = manager();
        let created = articles.create("short lived", "", "", vec![]).unwrap();
        articles.delete(&created.id).unwrap();
        assert!(articles.get(&created.id).unwrap().is_none());
        articles.delete(&created.id).unwrap();
        assert!(articles.delete("").is_err());
    }

    #[test]
    fn record_uses_camel_case_fields() {
        let article = Article::new("t", "c", "m", vec![]);
        let json = serde_json::to_value(&article).unwrap();
        assert!(json.get("contentToMark").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
    }
}
