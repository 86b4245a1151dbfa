//! Integration tests for the SQLite-backed repository.

use chrono::{Duration, TimeZone, Utc};
use microblog_core::db::{self, Database, NewPost};
use microblog_core::store::{FollowService, PostStore, SqliteStore, ThreadStore};
use microblog_core::thread::ReplyTree;
use tempfile::TempDir;

async fn setup_store() -> (SqliteStore, Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (SqliteStore::new(db.clone()), db, temp_dir)
}

fn new_post(author: &str, body: &str, parent: Option<&str>, minutes_ago: i64) -> NewPost {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    NewPost {
        author_id: author.to_string(),
        body: body.to_string(),
        created_at: base - Duration::minutes(minutes_ago),
        parent_post_id: parent.map(ToString::to_string),
    }
}

#[tokio::test]
async fn test_create_assigns_opaque_id_and_round_trips() {
    let (store, _db, _temp_dir) = setup_store().await;

    let created = store
        .create(new_post("alice", "hello world", None, 0))
        .await
        .expect("Failed to create post");
    assert!(created.id.starts_with("posts/"));
    assert!(created.thread_id.is_none());
    assert!(!created.is_reply());

    let loaded = PostStore::get(&store, &created.id)
        .await
        .expect("Failed to get post")
        .expect("Post not found");
    assert_eq!(loaded, created);
}

#[tokio::test]
async fn test_get_missing_post_is_none() {
    let (store, _db, _temp_dir) = setup_store().await;
    assert!(PostStore::get(&store, "posts/nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_many_omits_missing_ids() {
    let (store, _db, _temp_dir) = setup_store().await;

    let a = store.create(new_post("alice", "a", None, 2)).await.unwrap();
    let b = store.create(new_post("bob", "b", None, 1)).await.unwrap();

    let ids = vec![b.id.clone(), "posts/missing".to_string(), a.id.clone()];
    let loaded = store.get_many(&ids).await.unwrap();

    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[&a.id], a);
    assert_eq!(loaded[&b.id], b);
}

#[tokio::test]
async fn test_by_author_is_recency_ordered_and_limited() {
    let (store, _db, _temp_dir) = setup_store().await;

    for i in 0..5 {
        store
            .create(new_post("alice", &format!("post {i}"), None, i))
            .await
            .unwrap();
    }
    store.create(new_post("bob", "noise", None, 0)).await.unwrap();

    let posts = store.by_author("alice", 3).await.unwrap();
    assert_eq!(posts.len(), 3);
    assert_eq!(posts[0].body, "post 0");
    assert_eq!(posts[1].body, "post 1");
    assert_eq!(posts[2].body, "post 2");
    assert!(posts.iter().all(|p| p.author_id == "alice"));
}

#[tokio::test]
async fn test_by_authors_spans_the_given_set() {
    let (store, _db, _temp_dir) = setup_store().await;

    store.create(new_post("alice", "a", None, 3)).await.unwrap();
    store.create(new_post("bob", "b", None, 2)).await.unwrap();
    store.create(new_post("carol", "c", None, 1)).await.unwrap();

    let authors = vec!["alice".to_string(), "carol".to_string()];
    let posts = store.by_authors(&authors, 10).await.unwrap();

    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].author_id, "carol");
    assert_eq!(posts[1].author_id, "alice");
}

#[tokio::test]
async fn test_recent_spans_all_authors() {
    let (store, _db, _temp_dir) = setup_store().await;

    store.create(new_post("alice", "old", None, 10)).await.unwrap();
    store.create(new_post("bob", "new", None, 1)).await.unwrap();

    let posts = store.recent(10).await.unwrap();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].body, "new");
}

#[tokio::test]
async fn test_search_matches_bodies_and_escapes_wildcards() {
    let (store, _db, _temp_dir) = setup_store().await;

    store
        .create(new_post("alice", "the quick brown fox", None, 2))
        .await
        .unwrap();
    store
        .create(new_post("bob", "100% done", None, 1))
        .await
        .unwrap();

    let hits = store.search("quick", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].author_id, "alice");

    // A literal % must not act as a wildcard.
    let hits = store.search("100%", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].author_id, "bob");

    let hits = store.search("0%", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_thread_id_is_write_once() {
    let (store, _db, _temp_dir) = setup_store().await;

    let post = store.create(new_post("alice", "root", None, 0)).await.unwrap();

    store.set_thread_id(&post.id, "threads/one").await.unwrap();
    // Re-running with the same value is a no-op.
    store.set_thread_id(&post.id, "threads/one").await.unwrap();
    // A differing value is rejected.
    assert!(store.set_thread_id(&post.id, "threads/two").await.is_err());

    let loaded = PostStore::get(&store, &post.id).await.unwrap().unwrap();
    assert_eq!(loaded.thread_id.as_deref(), Some("threads/one"));
}

#[tokio::test]
async fn test_set_thread_id_on_missing_post_fails() {
    let (store, _db, _temp_dir) = setup_store().await;
    assert!(store.set_thread_id("posts/nope", "threads/one").await.is_err());
}

#[tokio::test]
async fn test_thread_documents_round_trip() {
    let (store, _db, _temp_dir) = setup_store().await;

    let mut tree = ReplyTree::new("threads/t1", "posts/root");
    tree.attach("posts/a", "posts/root").unwrap();

    ThreadStore::put(&store, &tree).await.unwrap();
    let loaded = ThreadStore::get(&store, "threads/t1").await.unwrap().unwrap();
    assert_eq!(loaded, tree);

    // Put replaces the document.
    tree.attach("posts/b", "posts/a").unwrap();
    ThreadStore::put(&store, &tree).await.unwrap();
    let loaded = ThreadStore::get(&store, "threads/t1").await.unwrap().unwrap();
    assert_eq!(loaded.len(), 3);

    assert!(ThreadStore::get(&store, "threads/nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_follows_are_returned_in_follow_order() {
    let (store, db, _temp_dir) = setup_store().await;

    store.follow("user", "alice").await.unwrap();
    store.follow("user", "bob").await.unwrap();
    // Duplicate follow is a no-op.
    store.follow("user", "alice").await.unwrap();

    let followed = store.followed_author_ids("user").await.unwrap();
    assert_eq!(followed, vec!["alice".to_string(), "bob".to_string()]);

    assert!(db::followed_author_ids(db.pool(), "stranger")
        .await
        .unwrap()
        .is_empty());
}
