use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::db::{self, Database, NewPost, Post};
use crate::thread::ReplyTree;

use super::{new_doc_id, FollowService, PostStore, ThreadStore};

/// SQLite-backed implementation of all repository traits.
///
/// Posts are rows, reply trees are one JSON document each; the store is
/// treated as a plain load-store-query backend throughout.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a follow relation. Outside the core's contract, but needed by
    /// seeding and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn follow(&self, user_id: &str, author_id: &str) -> Result<()> {
        db::add_follow(self.db.pool(), user_id, author_id).await
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Post>> {
        db::get_post(self.db.pool(), id).await
    }

    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Post>> {
        db::get_posts_by_ids(self.db.pool(), ids).await
    }

    async fn create(&self, post: NewPost) -> Result<Post> {
        let id = new_doc_id("posts");
        let created = db::insert_post(self.db.pool(), &id, &post).await?;
        debug!(post_id = %created.id, author = %created.author_id, reply = created.is_reply(), "Post created");
        Ok(created)
    }

    async fn set_thread_id(&self, post_id: &str, thread_id: &str) -> Result<()> {
        db::set_post_thread_id(self.db.pool(), post_id, thread_id).await
    }

    async fn by_author(&self, author_id: &str, limit: usize) -> Result<Vec<Post>> {
        db::posts_by_author(self.db.pool(), author_id, limit).await
    }

    async fn by_authors(&self, author_ids: &[String], limit: usize) -> Result<Vec<Post>> {
        db::posts_by_authors(self.db.pool(), author_ids, limit).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Post>> {
        db::recent_posts(self.db.pool(), limit).await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<Post>> {
        db::search_posts(self.db.pool(), term, limit).await
    }
}

#[async_trait]
impl ThreadStore for SqliteStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ReplyTree>> {
        let doc = db::get_thread_doc(self.db.pool(), thread_id).await?;
        doc.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Failed to decode thread document '{thread_id}'"))
        })
        .transpose()
    }

    async fn put(&self, tree: &ReplyTree) -> Result<()> {
        let json = serde_json::to_string(tree).context("Failed to encode thread document")?;
        db::put_thread_doc(self.db.pool(), tree.id(), &json).await
    }
}

#[async_trait]
impl FollowService for SqliteStore {
    async fn followed_author_ids(&self, user_id: &str) -> Result<Vec<String>> {
        db::followed_author_ids(self.db.pool(), user_id).await
    }
}
