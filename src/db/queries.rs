use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{NewPost, Post, StreamItem, SubscriptionRow};

const POST_COLUMNS: &str = "id, author_id, body, created_at, parent_post_id, thread_id";

// ========== Posts ==========

/// Insert a new post under the given store-assigned id, returning the
/// persisted post.
pub async fn insert_post(pool: &SqlitePool, id: &str, post: &NewPost) -> Result<Post> {
    sqlx::query(
        r"
        INSERT INTO posts (id, author_id, body, created_at, parent_post_id)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(id)
    .bind(&post.author_id)
    .bind(&post.body)
    .bind(post.created_at)
    .bind(&post.parent_post_id)
    .execute(pool)
    .await
    .context("Failed to insert post")?;

    Ok(Post {
        id: id.to_string(),
        author_id: post.author_id.clone(),
        body: post.body.clone(),
        created_at: post.created_at,
        parent_post_id: post.parent_post_id.clone(),
        thread_id: None,
    })
}

/// Get a post by id.
pub async fn get_post(pool: &SqlitePool, id: &str) -> Result<Option<Post>> {
    sqlx::query_as(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post by id")
}

/// Batch-load posts by id. The returned map is unordered and omits ids that
/// do not exist; callers that need an order must impose it themselves.
pub async fn get_posts_by_ids(pool: &SqlitePool, ids: &[String]) -> Result<HashMap<String, Post>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id IN ({placeholders})");

    let mut query = sqlx::query_as::<_, Post>(&sql);
    for id in ids {
        query = query.bind(id);
    }

    let posts = query
        .fetch_all(pool)
        .await
        .context("Failed to batch-load posts")?;

    Ok(posts.into_iter().map(|p| (p.id.clone(), p)).collect())
}

/// Write a post's thread id. The field is write-once: re-running with the
/// same thread id is a no-op, a differing thread id is rejected.
pub async fn set_post_thread_id(pool: &SqlitePool, post_id: &str, thread_id: &str) -> Result<()> {
    let result = sqlx::query(
        r"
        UPDATE posts SET thread_id = ?2
        WHERE id = ?1 AND (thread_id IS NULL OR thread_id = ?2)
        ",
    )
    .bind(post_id)
    .bind(thread_id)
    .execute(pool)
    .await
    .context("Failed to set post thread id")?;

    if result.rows_affected() == 0 {
        match get_post(pool, post_id).await? {
            Some(post) => bail!(
                "post '{post_id}' already belongs to thread {:?}, refusing to move it to '{thread_id}'",
                post.thread_id
            ),
            None => bail!("post '{post_id}' does not exist"),
        }
    }

    Ok(())
}

/// Get a user's own posts, most recent first.
pub async fn posts_by_author(pool: &SqlitePool, author_id: &str, limit: usize) -> Result<Vec<Post>> {
    sqlx::query_as(&format!(
        "SELECT {POST_COLUMNS} FROM posts WHERE author_id = ? ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(author_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("Failed to fetch posts by author")
}

/// Get posts authored by any of the given authors, most recent first.
pub async fn posts_by_authors(
    pool: &SqlitePool,
    author_ids: &[String],
    limit: usize,
) -> Result<Vec<Post>> {
    if author_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; author_ids.len()].join(", ");
    let sql = format!(
        "SELECT {POST_COLUMNS} FROM posts WHERE author_id IN ({placeholders}) ORDER BY created_at DESC LIMIT ?"
    );

    let mut query = sqlx::query_as::<_, Post>(&sql);
    for author_id in author_ids {
        query = query.bind(author_id);
    }

    query
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .context("Failed to fetch posts by authors")
}

/// Get the most recent posts by any author.
pub async fn recent_posts(pool: &SqlitePool, limit: usize) -> Result<Vec<Post>> {
    sqlx::query_as(&format!(
        "SELECT {POST_COLUMNS} FROM posts ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("Failed to fetch recent posts")
}

/// Substring search over post bodies, most recent first.
pub async fn search_posts(pool: &SqlitePool, term: &str, limit: usize) -> Result<Vec<Post>> {
    let pattern = format!("%{}%", escape_like(term));

    sqlx::query_as(&format!(
        r"SELECT {POST_COLUMNS} FROM posts WHERE body LIKE ? ESCAPE '\' ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(pattern)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("Failed to search posts")
}

fn escape_like(term: &str) -> String {
    term.replace('\\', r"\\")
        .replace('%', r"\%")
        .replace('_', r"\_")
}

// ========== Reply-tree documents ==========

/// Get the JSON document of a reply tree.
pub async fn get_thread_doc(pool: &SqlitePool, thread_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT doc FROM threads WHERE id = ?")
        .bind(thread_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch thread document")?;

    Ok(row.map(|(doc,)| doc))
}

/// Create or replace the JSON document of a reply tree.
pub async fn put_thread_doc(pool: &SqlitePool, thread_id: &str, doc: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO threads (id, doc, updated_at) VALUES (?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at
        ",
    )
    .bind(thread_id)
    .bind(doc)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("Failed to store thread document")?;

    Ok(())
}

// ========== Follows ==========

/// Record that `user_id` follows `author_id`.
pub async fn add_follow(pool: &SqlitePool, user_id: &str, author_id: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO follows (user_id, author_id, created_at) VALUES (?, ?, ?)
        ON CONFLICT (user_id, author_id) DO NOTHING
        ",
    )
    .bind(user_id)
    .bind(author_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("Failed to add follow")?;

    Ok(())
}

/// Get the author ids a user follows, in follow order.
pub async fn followed_author_ids(pool: &SqlitePool, user_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT author_id FROM follows WHERE user_id = ? ORDER BY created_at, author_id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch followed authors")?;

    Ok(rows.into_iter().map(|(author_id,)| author_id).collect())
}

// ========== Durable subscriptions ==========
//
// These return `sqlx::Result` rather than `anyhow::Result` so the
// subscription layer can map driver errors into its own taxonomy.

/// Create the subscription row if it does not exist.
pub async fn ensure_subscription(pool: &SqlitePool, name: &str) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO subscriptions (name, created_at) VALUES (?, ?)
        ON CONFLICT (name) DO NOTHING
        ",
    )
    .bind(name)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a subscription row by name.
pub async fn get_subscription(pool: &SqlitePool, name: &str) -> sqlx::Result<Option<SubscriptionRow>> {
    sqlx::query_as(
        "SELECT name, cursor_seq, closed, leased_by, lease_expires_at FROM subscriptions WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Try to take (or renew) the single-consumer lease on a subscription.
///
/// Succeeds when the subscription is open and either unleased, leased by
/// this owner already, or the previous lease has expired.
pub async fn acquire_lease(
    pool: &SqlitePool,
    name: &str,
    owner: &str,
    expires_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE subscriptions SET leased_by = ?2, lease_expires_at = ?3
        WHERE name = ?1
          AND closed = 0
          AND (leased_by IS NULL OR leased_by = ?2 OR lease_expires_at < ?4)
        ",
    )
    .bind(name)
    .bind(owner)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release the lease if this owner still holds it.
pub async fn release_lease(pool: &SqlitePool, name: &str, owner: &str) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE subscriptions SET leased_by = NULL, lease_expires_at = NULL
        WHERE name = ? AND leased_by = ?
        ",
    )
    .bind(name)
    .bind(owner)
    .execute(pool)
    .await?;

    Ok(())
}

/// Advance the committed cursor. Fails (returns `false`) when the owner no
/// longer holds the lease or the subscription was closed.
pub async fn advance_cursor(
    pool: &SqlitePool,
    name: &str,
    owner: &str,
    cursor_seq: i64,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE subscriptions SET cursor_seq = ?3
        WHERE name = ?1 AND leased_by = ?2 AND closed = 0
        ",
    )
    .bind(name)
    .bind(owner)
    .bind(cursor_seq)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Administratively close a subscription. Consumers observe this as a clean
/// shutdown.
pub async fn close_subscription(pool: &SqlitePool, name: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE subscriptions SET closed = 1 WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Read the next batch of stream items after the given cursor, in insertion
/// order.
pub async fn posts_after(pool: &SqlitePool, cursor_seq: i64, limit: usize) -> sqlx::Result<Vec<StreamItem>> {
    sqlx::query_as(
        r"
        SELECT seq, id AS post_id FROM posts
        WHERE seq > ?
        ORDER BY seq ASC
        LIMIT ?
        ",
    )
    .bind(cursor_seq)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("50%"), r"50\%");
        assert_eq!(escape_like("under_score"), r"under\_score");
        assert_eq!(escape_like(r"back\slash"), r"back\\slash");
    }
}
