use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural failures of reply-tree operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("post '{0}' is not referenced in this tree")]
    NodeNotFound(String),
    #[error("parent post '{0}' is not referenced in this tree")]
    ParentNotFound(String),
    #[error("post '{0}' already appears elsewhere in this tree")]
    DuplicatePost(String),
}

/// Outcome of a successful [`ReplyTree::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// A new reference node was appended.
    Attached,
    /// The post was already a child of that parent; the tree is unchanged.
    /// Makes attach safe under at-least-once redelivery.
    AlreadyAttached,
}

/// One reference node: a post id's place in the conversation shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RefNode {
    parent: Option<String>,
    children: Vec<String>,
}

/// The tree of post references for one conversation.
///
/// Stored as an arena: a flat map keyed by post id, each node holding a
/// parent back-reference and an ordered children list (insertion order =
/// attach order). The root is the single node without a parent. Each post id
/// appears in at most one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTree {
    id: String,
    root: String,
    nodes: HashMap<String, RefNode>,
}

impl ReplyTree {
    /// Create a tree containing only the given root post.
    #[must_use]
    pub fn new(id: impl Into<String>, root_post_id: impl Into<String>) -> Self {
        let root = root_post_id.into();
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            RefNode {
                parent: None,
                children: Vec::new(),
            },
        );
        Self {
            id: id.into(),
            root,
            nodes,
        }
    }

    /// The tree's own id, independent of any post id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The root post's id.
    #[must_use]
    pub fn root_id(&self) -> &str {
        &self.root
    }

    /// Whether the tree references the given post.
    #[must_use]
    pub fn contains(&self, post_id: &str) -> bool {
        self.nodes.contains_key(post_id)
    }

    /// Number of reference nodes (always at least 1).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct reply ids of a post, in attach order.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NodeNotFound`] if the post is not in the tree.
    pub fn children_of(&self, post_id: &str) -> Result<&[String], TreeError> {
        self.nodes
            .get(post_id)
            .map(|node| node.children.as_slice())
            .ok_or_else(|| TreeError::NodeNotFound(post_id.to_string()))
    }

    /// Append a reference node for `new_post_id` as the last child of the
    /// node referencing `parent_post_id`.
    ///
    /// Re-attaching an existing child is a no-op, so redelivered stream
    /// items converge instead of duplicating nodes. A failed attach leaves
    /// the tree structurally unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::ParentNotFound`] if the parent is not in the
    /// tree, or [`TreeError::DuplicatePost`] if `new_post_id` is already
    /// referenced under a different parent (or is the root).
    pub fn attach(&mut self, new_post_id: &str, parent_post_id: &str) -> Result<Attach, TreeError> {
        if let Some(existing) = self.nodes.get(new_post_id) {
            return if existing.parent.as_deref() == Some(parent_post_id) {
                Ok(Attach::AlreadyAttached)
            } else {
                Err(TreeError::DuplicatePost(new_post_id.to_string()))
            };
        }

        let Some(parent) = self.nodes.get_mut(parent_post_id) else {
            return Err(TreeError::ParentNotFound(parent_post_id.to_string()));
        };
        parent.children.push(new_post_id.to_string());

        self.nodes.insert(
            new_post_id.to_string(),
            RefNode {
                parent: Some(parent_post_id.to_string()),
                children: Vec::new(),
            },
        );

        Ok(Attach::Attached)
    }

    /// The ancestor chain from the root to `target_post_id`, inclusive,
    /// root first. A parent-pointer walk; exactly one path exists by the
    /// uniqueness invariant.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NodeNotFound`] if the target is not referenced
    /// in the tree.
    pub fn find_path(&self, target_post_id: &str) -> Result<Vec<String>, TreeError> {
        let mut node = self
            .nodes
            .get(target_post_id)
            .ok_or_else(|| TreeError::NodeNotFound(target_post_id.to_string()))?;

        let mut path = vec![target_post_id.to_string()];
        while let Some(parent_id) = &node.parent {
            path.push(parent_id.clone());
            node = self
                .nodes
                .get(parent_id)
                .ok_or_else(|| TreeError::NodeNotFound(parent_id.clone()))?;
        }

        path.reverse();
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_only_path_is_single_element() {
        let tree = ReplyTree::new("threads/t1", "posts/root");
        assert_eq!(
            tree.find_path("posts/root").unwrap(),
            vec!["posts/root".to_string()]
        );
    }

    #[test]
    fn test_attach_then_path_ends_with_parent_and_child() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/a", "posts/root").unwrap();
        tree.attach("posts/b", "posts/a").unwrap();

        let path = tree.find_path("posts/b").unwrap();
        assert_eq!(path, vec!["posts/root", "posts/a", "posts/b"]);
        assert_eq!(path[path.len() - 2], "posts/a");
    }

    #[test]
    fn test_attach_preserves_sibling_order() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/first", "posts/root").unwrap();
        tree.attach("posts/second", "posts/root").unwrap();
        tree.attach("posts/third", "posts/root").unwrap();

        assert_eq!(
            tree.children_of("posts/root").unwrap(),
            ["posts/first", "posts/second", "posts/third"]
        );
    }

    #[test]
    fn test_attach_missing_parent_leaves_tree_unchanged() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/a", "posts/root").unwrap();
        let before = tree.clone();

        let err = tree.attach("posts/b", "posts/missing").unwrap_err();
        assert_eq!(err, TreeError::ParentNotFound("posts/missing".to_string()));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_attach_is_idempotent_for_same_parent() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        assert_eq!(tree.attach("posts/a", "posts/root").unwrap(), Attach::Attached);
        let before = tree.clone();

        assert_eq!(
            tree.attach("posts/a", "posts/root").unwrap(),
            Attach::AlreadyAttached
        );
        assert_eq!(tree, before);
        assert_eq!(tree.children_of("posts/root").unwrap().len(), 1);
    }

    #[test]
    fn test_attach_under_different_parent_is_duplicate() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/a", "posts/root").unwrap();
        tree.attach("posts/b", "posts/root").unwrap();

        let err = tree.attach("posts/a", "posts/b").unwrap_err();
        assert_eq!(err, TreeError::DuplicatePost("posts/a".to_string()));
    }

    #[test]
    fn test_reattaching_root_is_duplicate() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/a", "posts/root").unwrap();

        let err = tree.attach("posts/root", "posts/a").unwrap_err();
        assert_eq!(err, TreeError::DuplicatePost("posts/root".to_string()));
    }

    #[test]
    fn test_find_path_missing_target_is_typed_error() {
        let tree = ReplyTree::new("threads/t1", "posts/root");
        let err = tree.find_path("posts/elsewhere").unwrap_err();
        assert_eq!(err, TreeError::NodeNotFound("posts/elsewhere".to_string()));
    }

    #[test]
    fn test_document_round_trip() {
        let mut tree = ReplyTree::new("threads/t1", "posts/root");
        tree.attach("posts/a", "posts/root").unwrap();
        tree.attach("posts/b", "posts/a").unwrap();

        let json = serde_json::to_string(&tree).unwrap();
        let decoded: ReplyTree = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.find_path("posts/b").unwrap().len(), 3);
    }
}
