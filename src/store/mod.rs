//! Repository abstractions over the document store.
//!
//! The thread and feed services are written against these traits; the
//! SQLite implementation in [`sqlite`] is the thin production wrapper, and
//! tests use it against throwaway databases.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::db::{NewPost, Post};
use crate::thread::ReplyTree;

/// Load/store/query access to posts.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Get a post by id.
    async fn get(&self, id: &str) -> Result<Option<Post>>;

    /// Batch-load posts by id. The returned map is unordered and omits
    /// missing ids.
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Post>>;

    /// Persist a new post. The store assigns the id.
    async fn create(&self, post: NewPost) -> Result<Post>;

    /// Write a post's thread id (write-once).
    async fn set_thread_id(&self, post_id: &str, thread_id: &str) -> Result<()>;

    /// A user's own posts, most recent first.
    async fn by_author(&self, author_id: &str, limit: usize) -> Result<Vec<Post>>;

    /// Posts by any of the given authors, most recent first.
    async fn by_authors(&self, author_ids: &[String], limit: usize) -> Result<Vec<Post>>;

    /// Most recent posts by any author.
    async fn recent(&self, limit: usize) -> Result<Vec<Post>>;

    /// Substring search over post bodies.
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<Post>>;
}

/// Load/store access to reply-tree documents.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Get a reply tree by id.
    async fn get(&self, thread_id: &str) -> Result<Option<ReplyTree>>;

    /// Create or replace a reply-tree document.
    async fn put(&self, tree: &ReplyTree) -> Result<()>;
}

/// Read-only access to the follow graph.
#[async_trait]
pub trait FollowService: Send + Sync {
    /// The author ids a user follows, in follow order.
    async fn followed_author_ids(&self, user_id: &str) -> Result<Vec<String>>;
}

/// Generate a store-assigned document id with the given collection prefix.
#[must_use]
pub fn new_doc_id(prefix: &str) -> String {
    let bytes: [u8; 16] = rand::random();
    format!("{prefix}/{}", hex::encode(bytes))
}
