use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::db::Post;
use crate::store::{new_doc_id, PostStore, ThreadStore};

use super::tree::{Attach, ReplyTree, TreeError};

/// Failures of thread assembly operations.
///
/// Not-found and structural conditions are expected business failures and
/// come back as typed variants; only store/infrastructure trouble travels
/// through the `Store` variant.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("post '{0}' does not exist")]
    PostNotFound(String),
    #[error("post '{0}' is a reply and cannot root a thread")]
    NotARoot(String),
    #[error("thread '{0}' does not exist")]
    ThreadNotFound(String),
    #[error("thread '{thread_id}' has no reference to post '{post_id}'")]
    ReferenceNotFound { thread_id: String, post_id: String },
    #[error("thread '{thread_id}' is structurally inconsistent: {source}")]
    Structural {
        thread_id: String,
        #[source]
        source: TreeError,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Attaches newly created posts to the correct reply-tree node and
/// reconstructs ancestor paths.
///
/// Every operation loads, mutates, and persists its own tree instance; the
/// store's conflict semantics are the only serialization for a given thread
/// id. All operations are safe to re-run, which the at-least-once worker
/// relies on.
pub struct ThreadAssembler {
    posts: Arc<dyn PostStore>,
    threads: Arc<dyn ThreadStore>,
}

impl ThreadAssembler {
    #[must_use]
    pub fn new(posts: Arc<dyn PostStore>, threads: Arc<dyn ThreadStore>) -> Self {
        Self { posts, threads }
    }

    /// Create a new reply tree rooted at the given post, persist it, and
    /// write the thread id back onto the post.
    ///
    /// Re-running for a post that already has a thread returns the existing
    /// tree.
    ///
    /// # Errors
    ///
    /// [`ThreadError::PostNotFound`] if the post does not exist;
    /// [`ThreadError::NotARoot`] if the post is a reply;
    /// [`ThreadError::ThreadNotFound`] if the post names a thread whose
    /// document is missing.
    pub async fn create_root_thread(&self, post_id: &str) -> Result<ReplyTree, ThreadError> {
        let post = self.require_post(post_id).await?;

        if post.is_reply() {
            return Err(ThreadError::NotARoot(post.id));
        }

        if let Some(thread_id) = &post.thread_id {
            return self
                .threads
                .get(thread_id)
                .await?
                .ok_or_else(|| ThreadError::ThreadNotFound(thread_id.clone()));
        }

        self.create_tree_for(&post).await
    }

    /// Attach a post to its conversation's reply tree.
    ///
    /// Root posts without a thread get one created lazily (covers deferred
    /// thread creation); replies are attached under their parent's node in
    /// the parent's thread, and the thread id is written onto the post
    /// exactly once. Re-running on an already-attached post is a no-op.
    ///
    /// # Errors
    ///
    /// [`ThreadError::PostNotFound`] if the post or its parent does not
    /// exist; [`ThreadError::ThreadNotFound`] if the thread document is
    /// missing; [`ThreadError::ReferenceNotFound`] if the tree has no node
    /// for the parent yet (retryable under redelivery).
    pub async fn attach_post_to_thread(&self, post_id: &str) -> Result<(), ThreadError> {
        let post = self.require_post(post_id).await?;

        let Some(parent_id) = post.parent_post_id.clone() else {
            // Root post: lazily create its thread when it has none.
            if post.thread_id.is_none() {
                self.create_tree_for(&post).await?;
            }
            return Ok(());
        };

        let parent = self.require_post(&parent_id).await?;
        let thread_id = match &parent.thread_id {
            Some(thread_id) => thread_id.clone(),
            // The parent is itself a still-unattached root; give it its
            // thread first so the reply has somewhere to land.
            None => self.create_tree_for(&parent).await?.id().to_string(),
        };

        let mut tree = self
            .threads
            .get(&thread_id)
            .await?
            .ok_or_else(|| ThreadError::ThreadNotFound(thread_id.clone()))?;

        match tree.attach(&post.id, &parent_id) {
            Ok(Attach::Attached) => {
                self.threads.put(&tree).await?;
                debug!(post_id = %post.id, parent = %parent_id, thread_id = %thread_id, "Attached post to thread");
            }
            Ok(Attach::AlreadyAttached) => {
                debug!(post_id = %post.id, thread_id = %thread_id, "Post already attached, skipping");
            }
            Err(TreeError::ParentNotFound(parent)) => {
                return Err(ThreadError::ReferenceNotFound {
                    thread_id,
                    post_id: parent,
                });
            }
            Err(source) => {
                return Err(ThreadError::Structural { thread_id, source });
            }
        }

        if post.thread_id.as_deref() != Some(thread_id.as_str()) {
            self.posts.set_thread_id(&post.id, &thread_id).await?;
        }

        Ok(())
    }

    /// The posts on the root-to-target ancestor chain, in root-first order.
    ///
    /// A post without a thread id is a standalone root with nothing posted
    /// yet; that returns an empty list rather than an error. The batch load
    /// returns an unordered map, so the path order is imposed afterwards.
    ///
    /// # Errors
    ///
    /// [`ThreadError::PostNotFound`] if the post (or any post on the path)
    /// does not exist; [`ThreadError::ThreadNotFound`] if the thread
    /// document is missing; [`ThreadError::ReferenceNotFound`] if the post
    /// is not referenced by its own thread's tree.
    pub async fn get_ancestor_posts(&self, post_id: &str) -> Result<Vec<Post>, ThreadError> {
        let post = self.require_post(post_id).await?;

        let Some(thread_id) = post.thread_id else {
            return Ok(Vec::new());
        };

        let tree = self
            .threads
            .get(&thread_id)
            .await?
            .ok_or_else(|| ThreadError::ThreadNotFound(thread_id.clone()))?;

        let path = tree
            .find_path(&post.id)
            .map_err(|_| ThreadError::ReferenceNotFound {
                thread_id,
                post_id: post.id.clone(),
            })?;

        let mut loaded = self.posts.get_many(&path).await?;
        path.into_iter()
            .map(|id| {
                loaded
                    .remove(&id)
                    .ok_or_else(|| ThreadError::PostNotFound(id))
            })
            .collect()
    }

    async fn require_post(&self, post_id: &str) -> Result<Post, ThreadError> {
        self.posts
            .get(post_id)
            .await?
            .ok_or_else(|| ThreadError::PostNotFound(post_id.to_string()))
    }

    async fn create_tree_for(&self, post: &Post) -> Result<ReplyTree, ThreadError> {
        let tree = ReplyTree::new(new_doc_id("threads"), post.id.as_str());
        self.threads.put(&tree).await?;
        self.posts.set_thread_id(&post.id, tree.id()).await?;
        info!(thread_id = %tree.id(), root = %post.id, "Created reply tree");
        Ok(tree)
    }
}
