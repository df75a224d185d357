// memory.rs - In-process triplestore.
//
// Used by tests and by `relay serve` when no SPARQL endpoint is configured.
// Failures can be scripted so retry paths are testable without a network.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::mutation::{Ack, MetadataMutation, Triple};
use crate::store::MetadataStore;

#[derive(Default)]
pub struct MemoryTripleStore {
    triples: Mutex<BTreeMap<(String, String), String>>,
    scripted_failures: Mutex<VecDeque<MetadataError>>,
    upsert_calls: AtomicU64,
    writes: AtomicU64,
}

impl MemoryTripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upsert calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = MetadataError>) {
        let mut queue = self.scripted_failures.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(errors);
    }

    /// Number of upsert calls received, including failed ones.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Number of upserts that changed the store.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every triple, ordered.
    pub fn snapshot(&self) -> Vec<Triple> {
        let triples = self.triples.lock().unwrap_or_else(|e| e.into_inner());
        triples
            .iter()
            .map(|((subject, predicate), object)| Triple {
                subject: subject.clone(),
                predicate: predicate.clone(),
                object: object.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryTripleStore {
    async fn upsert(&self, mutation: &MetadataMutation) -> Result<Ack, MetadataError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .scripted_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        if mutation.subject.is_empty() || mutation.predicate.is_empty() {
            return Err(MetadataError::InvalidMutation(
                "subject and predicate must be non-empty".into(),
            ));
        }

        let mut triples = self.triples.lock().unwrap_or_else(|e| e.into_inner());
        let key = (mutation.subject.clone(), mutation.predicate.clone());
        if triples.get(&key) == Some(&mutation.object) {
            return Ok(Ack::Unchanged);
        }
        triples.insert(key, mutation.object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Ack::Applied)
    }

    async fn get(&self, subject: &str, predicate: &str) -> Result<Option<String>, MetadataError> {
        let triples = self.triples.lock().unwrap_or_else(|e| e.into_inner());
        Ok(triples
            .get(&(subject.to_string(), predicate.to_string()))
            .cloned())
    }

    async fn triples_for(&self, subject: &str) -> Result<Vec<Triple>, MetadataError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|t| t.subject == subject)
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applying_twice_equals_applying_once() {
        let store = MemoryTripleStore::new();
        let m = MetadataMutation::new("01234", "MajorRadius", "8.5");

        assert_eq!(store.upsert(&m).await.unwrap(), Ack::Applied);
        let once = store.snapshot();
        assert_eq!(store.upsert(&m).await.unwrap(), Ack::Unchanged);
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.writes(), 1);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_object() {
        let store = MemoryTripleStore::new();
        store
            .upsert(&MetadataMutation::new("01234", "MajorRadius", "8.5"))
            .await
            .unwrap();
        store
            .upsert(&MetadataMutation::new("01234", "MajorRadius", "9.0"))
            .await
            .unwrap();
        assert_eq!(
            store.get("01234", "MajorRadius").await.unwrap().as_deref(),
            Some("9.0")
        );
        assert_eq!(store.triples_for("01234").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let store = MemoryTripleStore::new();
        store.fail_next([MetadataError::Unavailable("blip".into())]);
        let m = MetadataMutation::new("s", "p", "o");
        assert!(store.upsert(&m).await.unwrap_err().is_transient());
        assert_eq!(store.upsert(&m).await.unwrap(), Ack::Applied);
    }

    #[tokio::test]
    async fn empty_subject_is_invalid() {
        let store = MemoryTripleStore::new();
        let err = store
            .upsert(&MetadataMutation::new("", "p", "o"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidMutation(_)));
    }
}
