use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to read schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to record schema version {version}"))?;

    Ok(())
}

/// v1: posts, reply-tree documents, and durable subscription cursors.
///
/// Posts carry a monotonically increasing `seq` (insertion order); the
/// subscription cursor is a committed watermark over that sequence, which is
/// what makes the post stream durable and replayable.
async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS posts (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            author_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            parent_post_id TEXT,
            thread_id TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create threads table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS subscriptions (
            name TEXT PRIMARY KEY,
            cursor_seq INTEGER NOT NULL DEFAULT 0,
            closed INTEGER NOT NULL DEFAULT 0,
            leased_by TEXT,
            lease_expires_at TEXT,
            created_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create subscriptions table")?;

    Ok(())
}

/// v2: follow relations and the query indexes the feed path depends on.
async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS follows (
            user_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, author_id)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create follows table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_author ON posts (author_id, created_at DESC)")
        .execute(pool)
        .await
        .context("Failed to create posts author index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_created ON posts (created_at DESC)")
        .execute(pool)
        .await
        .context("Failed to create posts recency index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_parent ON posts (parent_post_id)")
        .execute(pool)
        .await
        .context("Failed to create posts parent index")?;

    Ok(())
}
