use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::db::{self, Database, StreamItem};
use crate::store::new_doc_id;

/// Callback for transient connection-level trouble. Reported without
/// tearing down the streaming loop.
pub type ConnectionErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything that can go wrong while consuming the post stream.
///
/// The worker's classifier decides per variant whether to terminate,
/// reconnect, or shut down cleanly.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("subscription '{0}' does not exist")]
    SubscriptionNotFound(String),
    #[error("backing database is missing or unreachable: {0}")]
    DatabaseMissing(String),
    #[error("subscription '{name}' is in an invalid state: {reason}")]
    InvalidState { name: String, reason: String },
    #[error("not authorized to consume subscription '{0}'")]
    Unauthorized(String),
    #[error("subscription '{0}' was closed by an administrator")]
    ClosedByAdmin(String),
    #[error("subscription '{0}' is in use by another consumer")]
    InUse(String),
    #[error("subscriber failure: {reason}")]
    Subscriber {
        reason: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable-subscription management: create-if-absent and consumer opening.
#[async_trait]
pub trait PostSubscriptions: Send + Sync {
    /// Create the named subscription if it does not exist yet.
    async fn ensure_subscription(&self, name: &str) -> Result<(), SubscriberError>;

    /// Open a single-consumer handle on the subscription.
    async fn open_consumer(
        &self,
        name: &str,
        batch_size: usize,
        on_connection_error: ConnectionErrorHook,
    ) -> Result<Box<dyn PostConsumer>, SubscriberError>;
}

/// An open consumer handle over the ordered stream of newly created posts.
///
/// Delivery is at-least-once: items re-appear until a `commit` covering
/// their sequence number succeeds.
#[async_trait]
pub trait PostConsumer: Send + Sync {
    /// Receive the next bounded batch, in stream order. May be empty when
    /// the stream is caught up.
    async fn next_batch(&mut self) -> Result<Vec<StreamItem>, SubscriberError>;

    /// Commit everything up to and including the given sequence number.
    async fn commit(&mut self, up_to_seq: i64) -> Result<(), SubscriberError>;

    /// Release the consumer handle. Called on every exit from streaming.
    async fn release(&mut self) -> Result<(), SubscriberError>;
}

/// SQLite-backed subscription infrastructure.
///
/// One row per subscription holds the committed cursor and a lease column
/// enforcing single-consumer ownership; the post table's insertion sequence
/// is the stream.
#[derive(Debug, Clone)]
pub struct SqliteSubscriptions {
    db: Database,
    lease: Duration,
}

impl SqliteSubscriptions {
    #[must_use]
    pub fn new(db: Database, lease: Duration) -> Self {
        Self { db, lease }
    }
}

#[async_trait]
impl PostSubscriptions for SqliteSubscriptions {
    async fn ensure_subscription(&self, name: &str) -> Result<(), SubscriberError> {
        db::ensure_subscription(self.db.pool(), name)
            .await
            .map_err(|e| store_error("ensure subscription", e))
    }

    async fn open_consumer(
        &self,
        name: &str,
        batch_size: usize,
        on_connection_error: ConnectionErrorHook,
    ) -> Result<Box<dyn PostConsumer>, SubscriberError> {
        let row = db::get_subscription(self.db.pool(), name)
            .await
            .map_err(|e| store_error("load subscription", e))?
            .ok_or_else(|| SubscriberError::SubscriptionNotFound(name.to_string()))?;

        if row.closed {
            return Err(SubscriberError::ClosedByAdmin(name.to_string()));
        }

        let owner = new_doc_id("consumers");
        let expires_at = Utc::now() + self.lease;
        let acquired = db::acquire_lease(self.db.pool(), name, &owner, expires_at)
            .await
            .map_err(|e| store_error("acquire lease", e))?;

        if !acquired {
            return Err(SubscriberError::InUse(name.to_string()));
        }

        debug!(subscription = %name, owner = %owner, cursor = row.cursor_seq, "Consumer opened");

        Ok(Box::new(SqliteConsumer {
            db: self.db.clone(),
            name: name.to_string(),
            owner,
            batch_size,
            cursor_seq: row.cursor_seq,
            lease: self.lease,
            on_connection_error,
        }))
    }
}

struct SqliteConsumer {
    db: Database,
    name: String,
    owner: String,
    batch_size: usize,
    cursor_seq: i64,
    lease: Duration,
    on_connection_error: ConnectionErrorHook,
}

impl SqliteConsumer {
    /// Re-assert the lease; diagnoses why when it cannot.
    async fn renew_lease(&self) -> Result<(), SubscriberError> {
        let expires_at = Utc::now() + self.lease;
        let renewed = db::acquire_lease(self.db.pool(), &self.name, &self.owner, expires_at)
            .await
            .map_err(|e| store_error("renew lease", e))?;

        if renewed {
            return Ok(());
        }
        Err(self.diagnose("lease renewal failed").await)
    }

    /// Turn a failed conditional update into the precise taxonomy variant.
    async fn diagnose(&self, context: &str) -> SubscriberError {
        match db::get_subscription(self.db.pool(), &self.name).await {
            Ok(None) => SubscriberError::SubscriptionNotFound(self.name.clone()),
            Ok(Some(row)) if row.closed => SubscriberError::ClosedByAdmin(self.name.clone()),
            Ok(Some(row)) if row.leased_by.as_deref() != Some(&self.owner) => {
                SubscriberError::InvalidState {
                    name: self.name.clone(),
                    reason: format!("{context}: lease is held by another consumer"),
                }
            }
            Ok(Some(_)) => SubscriberError::InvalidState {
                name: self.name.clone(),
                reason: context.to_string(),
            },
            Err(e) => store_error(context, e),
        }
    }
}

#[async_trait]
impl PostConsumer for SqliteConsumer {
    async fn next_batch(&mut self) -> Result<Vec<StreamItem>, SubscriberError> {
        self.renew_lease().await?;

        match db::posts_after(self.db.pool(), self.cursor_seq, self.batch_size).await {
            Ok(items) => Ok(items),
            // Pool contention is connectivity trouble, not a stream fault:
            // report it through the hook and let the caller poll again.
            Err(sqlx::Error::PoolTimedOut) => {
                (self.on_connection_error)("timed out waiting for a database connection");
                Ok(Vec::new())
            }
            Err(e) => Err(store_error("receive batch", e)),
        }
    }

    async fn commit(&mut self, up_to_seq: i64) -> Result<(), SubscriberError> {
        let advanced = db::advance_cursor(self.db.pool(), &self.name, &self.owner, up_to_seq)
            .await
            .map_err(|e| store_error("commit cursor", e))?;

        if !advanced {
            return Err(self.diagnose("cursor commit failed").await);
        }

        self.cursor_seq = up_to_seq;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), SubscriberError> {
        db::release_lease(self.db.pool(), &self.name, &self.owner)
            .await
            .map_err(|e| store_error("release lease", e))?;
        debug!(subscription = %self.name, owner = %self.owner, "Consumer released");
        Ok(())
    }
}

fn store_error(context: &str, err: sqlx::Error) -> SubscriberError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            SubscriberError::DatabaseMissing(format!("{context}: {err}"))
        }
        // Pool contention is transient wherever it strikes; the classifier
        // sends cause-less subscriber failures back to Connecting.
        sqlx::Error::PoolTimedOut => SubscriberError::Subscriber {
            reason: format!("{context}: timed out waiting for a database connection"),
            cause: None,
        },
        other => SubscriberError::Subscriber {
            reason: context.to_string(),
            cause: Some(Box::new(other)),
        },
    }
}
