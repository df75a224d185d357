// client.rs - Retrying metadata client.
//
// Wraps any MetadataStore with a per-call deadline and bounded exponential
// backoff. Transient errors are retried here, close to the source; the
// dispatcher only sees success or a permanent failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::RetryPolicy;

use crate::error::MetadataError;
use crate::mutation::{Ack, MetadataMutation};
use crate::store::MetadataStore;

/// Outcome of a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub ack: Ack,
    pub attempts: u32,
    pub applied_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MetadataClient {
    store: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl MetadataClient {
    pub fn new(store: Arc<dyn MetadataStore>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            call_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Apply a mutation, retrying transient failures.
    ///
    /// On success the returned mutation has `applied_at` set. Running out of
    /// attempts yields [`MetadataError::RetriesExhausted`], which is permanent.
    pub async fn apply(
        &self,
        mutation: &MetadataMutation,
    ) -> Result<(MetadataMutation, Receipt), MetadataError> {
        let store = &self.store;
        let deadline = self.call_timeout;

        let outcome = self
            .retry
            .run(
                move |attempt| async move {
                    tracing::trace!(attempt, subject = %mutation.subject, "metadata upsert");
                    match tokio::time::timeout(deadline, store.upsert(mutation)).await {
                        Ok(result) => result,
                        Err(_) => Err(MetadataError::Timeout(deadline)),
                    }
                },
                MetadataError::is_transient,
            )
            .await;

        match outcome {
            Ok(done) => {
                let applied_at = Utc::now();
                let mut committed = mutation.clone();
                committed.applied_at = Some(applied_at);
                Ok((
                    committed,
                    Receipt {
                        ack: done.value,
                        attempts: done.attempts,
                        applied_at,
                    },
                ))
            }
            Err(exhausted) if exhausted.transient => Err(MetadataError::RetriesExhausted {
                attempts: exhausted.attempts,
                last: Box::new(exhausted.error),
            }),
            Err(exhausted) => Err(exhausted.error),
        }
    }

    /// Read the current object for a triple, bounded by the call deadline.
    pub async fn current(&self, subject: &str, predicate: &str) -> Result<Option<String>, MetadataError> {
        tokio::time::timeout(self.call_timeout, self.store.get(subject, predicate))
            .await
            .map_err(|_| MetadataError::Timeout(self.call_timeout))?
    }
}
