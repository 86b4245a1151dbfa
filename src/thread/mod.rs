//! Reply-thread subsystem: the per-conversation tree entity and the
//! assembly service that keeps it in sync with newly created posts.

mod assembly;
mod tree;

pub use assembly::{ThreadAssembler, ThreadError};
pub use tree::{Attach, ReplyTree, TreeError};
