//! Background tree-update worker.
//!
//! A single long-lived task per process that drains the durable stream of
//! newly created posts and attaches each one to its reply tree, decoupling
//! the tree traversal from the post-creation write path. Modeled as an
//! explicit state machine driven by one dispatch loop and a typed error
//! classifier.

mod subscription;

pub use subscription::{
    ConnectionErrorHook, PostConsumer, PostSubscriptions, SqliteSubscriptions, SubscriberError,
};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::thread::{ThreadAssembler, ThreadError};

/// What the worker does about a streaming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Propagate and terminate; external supervision must restart the
    /// worker.
    Fatal,
    /// Clean shutdown requested by an administrator.
    Shutdown,
    /// Transient; reconnect and keep consuming.
    Reconnect,
    /// Stop the loop without propagating (conservative default).
    Stop,
}

/// Classify a subscriber error into the worker's retry policy.
#[must_use]
pub fn classify(err: &SubscriberError) -> ErrorAction {
    match err {
        SubscriberError::SubscriptionNotFound(_)
        | SubscriberError::DatabaseMissing(_)
        | SubscriberError::InvalidState { .. }
        | SubscriberError::Unauthorized(_)
        | SubscriberError::Subscriber { cause: Some(_), .. } => ErrorAction::Fatal,
        SubscriberError::ClosedByAdmin(_) => ErrorAction::Shutdown,
        SubscriberError::Subscriber { cause: None, .. } | SubscriberError::InUse(_) => {
            ErrorAction::Reconnect
        }
        SubscriberError::Other(_) => ErrorAction::Stop,
    }
}

enum WorkerState {
    Starting,
    Connecting,
    Streaming(Box<dyn PostConsumer>),
    /// Releasing the consumer handle and deciding what to do next.
    Draining(Box<dyn PostConsumer>, Option<SubscriberError>),
    Stopped,
}

/// The durable, restart-safe consumer that keeps reply trees up to date.
pub struct TreeUpdateWorker {
    subscriptions: Arc<dyn PostSubscriptions>,
    assembler: Arc<ThreadAssembler>,
    subscription_name: String,
    batch_size: usize,
    poll_interval: Duration,
    retry_backoff: Duration,
}

impl TreeUpdateWorker {
    #[must_use]
    pub fn new(
        subscriptions: Arc<dyn PostSubscriptions>,
        assembler: Arc<ThreadAssembler>,
        config: &Config,
    ) -> Self {
        Self {
            subscriptions,
            assembler,
            subscription_name: config.subscription_name.clone(),
            batch_size: config.worker_batch_size,
            poll_interval: config.worker_poll_interval,
            retry_backoff: config.worker_retry_backoff,
        }
    }

    /// Run the worker until cancellation, clean shutdown, or a fatal error.
    ///
    /// Cancellation is observed at batch boundaries and on the batch
    /// receive; a batch being processed is finished (or redelivered) rather
    /// than cut short mid-item.
    ///
    /// # Errors
    ///
    /// Propagates errors the classifier deems fatal; the hosting process is
    /// expected to restart the worker externally.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SubscriberError> {
        info!(subscription = %self.subscription_name, "Tree update worker starting");

        let mut state = WorkerState::Starting;
        loop {
            state = match state {
                WorkerState::Starting => {
                    match self
                        .subscriptions
                        .ensure_subscription(&self.subscription_name)
                        .await
                    {
                        Ok(()) => WorkerState::Connecting,
                        Err(e) => match classify(&e) {
                            ErrorAction::Fatal => return Err(e),
                            ErrorAction::Shutdown | ErrorAction::Stop => WorkerState::Stopped,
                            ErrorAction::Reconnect => {
                                warn!("Failed to ensure subscription, retrying: {e}");
                                if self.backoff(&cancel).await {
                                    WorkerState::Stopped
                                } else {
                                    WorkerState::Starting
                                }
                            }
                        },
                    }
                }

                WorkerState::Connecting => {
                    let hook: ConnectionErrorHook = Arc::new(|report: &str| {
                        warn!("Transient subscription connection error: {report}");
                    });
                    match self
                        .subscriptions
                        .open_consumer(&self.subscription_name, self.batch_size, hook)
                        .await
                    {
                        Ok(consumer) => WorkerState::Streaming(consumer),
                        Err(e) => match classify(&e) {
                            ErrorAction::Fatal => return Err(e),
                            ErrorAction::Shutdown => {
                                info!("Subscription closed by administrator, shutting down");
                                WorkerState::Stopped
                            }
                            ErrorAction::Stop => {
                                error!("Stopping tree update worker: {e}");
                                WorkerState::Stopped
                            }
                            ErrorAction::Reconnect => {
                                warn!("Could not open consumer, retrying: {e}");
                                if self.backoff(&cancel).await {
                                    WorkerState::Stopped
                                } else {
                                    WorkerState::Connecting
                                }
                            }
                        },
                    }
                }

                WorkerState::Streaming(mut consumer) => {
                    let outcome = self.stream(consumer.as_mut(), &cancel).await;
                    WorkerState::Draining(consumer, outcome.err())
                }

                WorkerState::Draining(mut consumer, outcome) => {
                    // The handle is released on every exit from streaming,
                    // regardless of how it ended.
                    if let Err(e) = consumer.release().await {
                        warn!("Failed to release consumer handle: {e}");
                    }
                    match outcome {
                        None => WorkerState::Stopped,
                        Some(e) => match classify(&e) {
                            ErrorAction::Fatal => {
                                error!("Fatal tree update worker error: {e}");
                                return Err(e);
                            }
                            ErrorAction::Shutdown => {
                                info!("Subscription closed by administrator, shutting down");
                                WorkerState::Stopped
                            }
                            ErrorAction::Stop => {
                                error!("Stopping tree update worker: {e}");
                                WorkerState::Stopped
                            }
                            ErrorAction::Reconnect => {
                                warn!("Transient subscriber error, reconnecting: {e}");
                                if self.backoff(&cancel).await {
                                    WorkerState::Stopped
                                } else {
                                    WorkerState::Connecting
                                }
                            }
                        },
                    }
                }

                WorkerState::Stopped => {
                    info!(subscription = %self.subscription_name, "Tree update worker stopped");
                    return Ok(());
                }
            };
        }
    }

    /// The streaming phase: receive bounded batches and attach every item,
    /// committing the cursor only once the whole batch has been processed.
    /// A crash mid-batch therefore redelivers the whole batch; attach being
    /// idempotent makes the replay converge.
    async fn stream(
        &self,
        consumer: &mut dyn PostConsumer,
        cancel: &CancellationToken,
    ) -> Result<(), SubscriberError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let batch = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                batch = consumer.next_batch() => batch?,
            };

            if batch.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            let up_to_seq = batch.last().map_or(0, |item| item.seq);
            for item in &batch {
                self.assembler
                    .attach_post_to_thread(&item.post_id)
                    .await
                    .map_err(|e| item_error(&item.post_id, e))?;
            }

            consumer.commit(up_to_seq).await?;
            info!(
                subscription = %self.subscription_name,
                batch = batch.len(),
                up_to_seq,
                "Committed tree update batch"
            );
        }
    }

    /// Sleep the retry backoff; returns true when cancelled while waiting.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(self.retry_backoff) => false,
        }
    }
}

/// Map an item-level assembly failure into the subscriber taxonomy.
///
/// A missing parent reference means the tree simply has not caught up yet:
/// redelivering the batch will succeed once the parent lands, so that is
/// transient. Not-found and structural failures are data integrity errors
/// and terminate the worker.
fn item_error(post_id: &str, err: ThreadError) -> SubscriberError {
    match err {
        ThreadError::ReferenceNotFound { .. } => SubscriberError::Subscriber {
            reason: format!("post '{post_id}' cannot be attached yet: {err}"),
            cause: None,
        },
        other => SubscriberError::Subscriber {
            reason: format!("failed to attach post '{post_id}'"),
            cause: Some(Box::new(other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_fatal_infrastructure() {
        assert_eq!(
            classify(&SubscriberError::SubscriptionNotFound("s".into())),
            ErrorAction::Fatal
        );
        assert_eq!(
            classify(&SubscriberError::DatabaseMissing("gone".into())),
            ErrorAction::Fatal
        );
        assert_eq!(
            classify(&SubscriberError::InvalidState {
                name: "s".into(),
                reason: "lease lost".into()
            }),
            ErrorAction::Fatal
        );
        assert_eq!(
            classify(&SubscriberError::Unauthorized("s".into())),
            ErrorAction::Fatal
        );
    }

    #[test]
    fn test_classify_subscriber_failure_depends_on_cause() {
        let with_cause = SubscriberError::Subscriber {
            reason: "boom".into(),
            cause: Some("inner".into()),
        };
        assert_eq!(classify(&with_cause), ErrorAction::Fatal);

        let without_cause = SubscriberError::Subscriber {
            reason: "boom".into(),
            cause: None,
        };
        assert_eq!(classify(&without_cause), ErrorAction::Reconnect);
    }

    #[test]
    fn test_classify_admin_close_is_clean_shutdown() {
        assert_eq!(
            classify(&SubscriberError::ClosedByAdmin("s".into())),
            ErrorAction::Shutdown
        );
    }

    #[test]
    fn test_classify_in_use_reconnects() {
        assert_eq!(
            classify(&SubscriberError::InUse("s".into())),
            ErrorAction::Reconnect
        );
    }

    #[test]
    fn test_classify_anything_else_stops() {
        assert_eq!(
            classify(&SubscriberError::Other(anyhow::anyhow!("surprise"))),
            ErrorAction::Stop
        );
    }

    #[test]
    fn test_reference_not_found_items_are_transient() {
        let err = item_error(
            "posts/x",
            ThreadError::ReferenceNotFound {
                thread_id: "threads/t".into(),
                post_id: "posts/parent".into(),
            },
        );
        assert_eq!(classify(&err), ErrorAction::Reconnect);
    }

    #[test]
    fn test_not_found_items_are_fatal() {
        let err = item_error("posts/x", ThreadError::PostNotFound("posts/x".into()));
        assert_eq!(classify(&err), ErrorAction::Fatal);
    }
}
