//! # relay-metadata
//!
//! Applies parameter updates to a triplestore.
//!
//! Every write is an upsert on `(subject, predicate)`: applying the same
//! [`MetadataMutation`] twice leaves the store exactly as applying it once,
//! which is what makes at-least-once broker delivery safe.
//!
//! - [`MetadataStore`]: the store seam (write + read API)
//! - [`MemoryTripleStore`]: in-process store with scripted failures
//! - [`SparqlStore`]: SPARQL 1.1 Update/Query over HTTP
//! - [`MetadataClient`]: retry, backoff and per-call deadline around a store

pub mod client;
pub mod error;
pub mod memory;
pub mod mutation;
pub mod sparql;
pub mod store;

pub use client::{MetadataClient, Receipt};
pub use error::MetadataError;
pub use memory::MemoryTripleStore;
pub use mutation::{Ack, MetadataMutation, Triple};
pub use sparql::{SparqlConfig, SparqlStore};
pub use store::MetadataStore;
