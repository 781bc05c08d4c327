//! Seam to the content-storage system.
//!
//! The listener asks storage for the denormalized bits of a snapshot
//! (permalink, featured image, author) while the row still exists.

use crate::model::{AuthorSnapshot, Content};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait ContentDirectory: Send + Sync {
    async fn content(&self, content_id: i64) -> Result<Option<Content>>;

    async fn permalink(&self, content_id: i64) -> Result<Option<String>>;

    async fn featured_image(&self, content_id: i64) -> Result<Option<String>>;

    async fn author(&self, author_id: i64) -> Result<Option<AuthorSnapshot>>;
}

/// One content item with everything a snapshot needs, as carried by an
/// ingested event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentEntry {
    pub content: Content,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub featured_image: Option<String>,
    #[serde(default)]
    pub author: Option<AuthorSnapshot>,
}

#[derive(Debug, Default)]
struct Entries {
    content: HashMap<i64, ContentEntry>,
    authors: HashMap<i64, AuthorSnapshot>,
}

/// In-process directory. Backs the event ingester and tests.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    inner: RwLock<Entries>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entry: ContentEntry) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(author) = entry.author.clone() {
            inner.authors.insert(entry.content.author_id, author);
        }
        inner.content.insert(entry.content.id, entry);
    }

    pub fn put_author(&self, author_id: i64, author: AuthorSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.authors.insert(author_id, author);
    }

    /// Hard-delete a content row. Snapshots already taken are unaffected.
    pub fn remove(&self, content_id: i64) -> Option<ContentEntry> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.content.remove(&content_id)
    }

    fn with_entry<T>(
        &self,
        content_id: i64,
        f: impl FnOnce(&ContentEntry) -> Option<T>,
    ) -> Option<T> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.content.get(&content_id).and_then(f)
    }
}

#[async_trait]
impl ContentDirectory for MemoryDirectory {
    async fn content(&self, content_id: i64) -> Result<Option<Content>> {
        Ok(self.with_entry(content_id, |e| Some(e.content.clone())))
    }

    async fn permalink(&self, content_id: i64) -> Result<Option<String>> {
        Ok(self.with_entry(content_id, |e| e.permalink.clone()))
    }

    async fn featured_image(&self, content_id: i64) -> Result<Option<String>> {
        Ok(self.with_entry(content_id, |e| e.featured_image.clone()))
    }

    async fn author(&self, author_id: i64) -> Result<Option<AuthorSnapshot>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.authors.get(&author_id).cloned())
    }
}
