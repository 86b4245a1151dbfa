//! Feed composition: the deduplicated, paginated, recency-ordered union of
//! a user's own posts, their followed authors' posts, and recent filler.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::db::Post;
use crate::store::{FollowService, PostStore};

/// Composes a user's feed out of three independently fetched post sets.
pub struct FeedService {
    posts: Arc<dyn PostStore>,
    follows: Arc<dyn FollowService>,
    /// Upper bound on the total number of posts considered for one feed.
    ceiling: usize,
}

impl FeedService {
    #[must_use]
    pub fn new(posts: Arc<dyn PostStore>, follows: Arc<dyn FollowService>, ceiling: usize) -> Self {
        Self {
            posts,
            follows,
            ceiling,
        }
    }

    /// One page of the user's feed.
    ///
    /// Fetches up to the ceiling of own posts and followed-author posts
    /// (recency descending each), tops the pool up with recent filler for
    /// whatever headroom remains (clamped to zero when own + followed
    /// already meet the ceiling), deduplicates by post id with the earlier
    /// fetch winning, orders by creation time descending, and pages.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the underlying fetches fail.
    pub async fn get_feed(&self, user_id: &str, page: usize, page_size: usize) -> Result<Vec<Post>> {
        let own = self.posts.by_author(user_id, self.ceiling).await?;

        let followed = self.follows.followed_author_ids(user_id).await?;
        let followed_posts = if followed.is_empty() {
            Vec::new()
        } else {
            self.posts.by_authors(&followed, self.ceiling).await?
        };

        let remaining = self.ceiling.saturating_sub(own.len() + followed_posts.len());
        let filler = if remaining == 0 {
            Vec::new()
        } else {
            self.posts.recent(remaining).await?
        };

        debug!(
            user = %user_id,
            own = own.len(),
            followed = followed_posts.len(),
            filler = filler.len(),
            page,
            "Composing feed"
        );

        Ok(compose(own, followed_posts, filler, page, page_size))
    }
}

/// Merge the three result sets into one page.
///
/// Concatenation order matters: dedup is first-occurrence-wins, so own posts
/// shadow followed posts, which shadow filler.
fn compose(
    own: Vec<Post>,
    followed: Vec<Post>,
    filler: Vec<Post>,
    page: usize,
    page_size: usize,
) -> Vec<Post> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Post> = own
        .into_iter()
        .chain(followed)
        .chain(filler)
        .filter(|post| seen.insert(post.id.clone()))
        .collect();

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    merged
        .into_iter()
        .skip(page.saturating_mul(page_size))
        .take(page_size)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn post(id: &str, author: &str, minutes_ago: i64) -> Post {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        Post {
            id: id.to_string(),
            author_id: author.to_string(),
            body: format!("body of {id}"),
            created_at: base - Duration::minutes(minutes_ago),
            parent_post_id: None,
            thread_id: None,
        }
    }

    #[test]
    fn test_compose_orders_by_recency_descending() {
        let own = vec![post("p1", "me", 30)];
        let followed = vec![post("p2", "them", 10)];
        let filler = vec![post("p3", "other", 20)];

        let feed = compose(own, followed, filler, 0, 10);
        let ids: Vec<&str> = feed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p2", "p3", "p1"]);
    }

    #[test]
    fn test_compose_deduplicates_first_occurrence_wins() {
        let own = vec![post("p1", "me", 5)];
        let followed = vec![post("p1", "me", 5), post("p2", "them", 10)];
        let filler = vec![post("p2", "them", 10), post("p3", "other", 15)];

        let feed = compose(own, followed, filler, 0, 10);
        let ids: Vec<&str> = feed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2", "p3"]);
    }

    #[test]
    fn test_compose_never_repeats_an_id_within_a_page() {
        let own: Vec<Post> = (0..5).map(|i| post(&format!("p{i}"), "me", i)).collect();
        let followed = own.clone();
        let filler = own.clone();

        let feed = compose(own, followed, filler, 0, 100);
        let mut ids: Vec<&str> = feed.iter().map(|p| p.id.as_str()).collect();
        let total = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 5);
    }

    #[test]
    fn test_compose_pages_are_disjoint() {
        let filler: Vec<Post> = (0..25).map(|i| post(&format!("p{i}"), "other", i)).collect();

        let first = compose(Vec::new(), Vec::new(), filler.clone(), 0, 10);
        let second = compose(Vec::new(), Vec::new(), filler, 1, 10);

        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_ne!(first[0].id, second[0].id);
        for p in &second {
            assert!(!first.iter().any(|q| q.id == p.id));
        }
    }

    #[test]
    fn test_compose_page_beyond_data_is_empty() {
        let filler: Vec<Post> = (0..8).map(|i| post(&format!("p{i}"), "other", i)).collect();
        assert!(compose(Vec::new(), Vec::new(), filler, 3, 10).is_empty());
    }
}
