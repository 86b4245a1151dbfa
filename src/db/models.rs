use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single user-authored post, optionally a reply to another post.
///
/// The id is opaque, assigned by the store on first persist and immutable
/// afterwards. `thread_id` is the only field mutated later, written exactly
/// once when the post is attached to its reply tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub parent_post_id: Option<String>,
    pub thread_id: Option<String>,
}

impl Post {
    /// Whether this post is a reply to another post.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.parent_post_id.is_some()
    }
}

/// Data for persisting a new post. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub parent_post_id: Option<String>,
}

/// One entry of the ordered stream of newly created posts.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StreamItem {
    pub seq: i64,
    pub post_id: String,
}

/// A durable subscription cursor row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub name: String,
    pub cursor_seq: i64,
    pub closed: bool,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}
