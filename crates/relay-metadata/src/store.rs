// store.rs - The MetadataStore seam.

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::mutation::{Ack, MetadataMutation, Triple};

/// A triplestore the relay writes parameter metadata into.
///
/// The relay is not the system of record for metadata; it only upserts.
/// The read methods exist for the reconciliation pass.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Upsert `(subject, predicate) -> object`. Must be idempotent.
    async fn upsert(&self, mutation: &MetadataMutation) -> Result<Ack, MetadataError>;

    /// Current object for `(subject, predicate)`, if any.
    async fn get(&self, subject: &str, predicate: &str) -> Result<Option<String>, MetadataError>;

    /// All triples with the given subject, ordered by predicate.
    async fn triples_for(&self, subject: &str) -> Result<Vec<Triple>, MetadataError>;

    /// Store display name (for logs and `relay serve` output).
    fn name(&self) -> &str;
}
