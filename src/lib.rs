//! Micro-blog thread and feed core.
//!
//! Maintains a reply tree per conversation, keeps the trees eventually
//! consistent through a durable background consumer of newly created posts,
//! and composes deduplicated, paginated, recency-ordered feeds. The web
//! layer consumes this crate as a library; storage is reached through the
//! repository traits in [`store`].

pub mod config;
pub mod db;
pub mod feed;
pub mod store;
pub mod thread;
pub mod worker;
