// sparql.rs - SPARQL 1.1 triplestore over HTTP.
//
// Subjects and predicates are turned into IRIs under a configured base:
//   subject "01234"        → <{base}resource/01234>
//   predicate "MajorRadius" → <{base}parameter/MajorRadius>
// Objects are plain string literals.
//
// An upsert first ASKs whether the exact triple exists (→ Ack::Unchanged),
// then runs a DELETE/INSERT that replaces any previous object.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MetadataError;
use crate::mutation::{Ack, MetadataMutation, Triple};
use crate::store::MetadataStore;

/// Settings for the `[metadata.sparql]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparqlConfig {
    /// SPARQL Update endpoint (e.g. `http://localhost:3030/relay/update`).
    pub update_url: String,

    /// SPARQL Query endpoint (e.g. `http://localhost:3030/relay/query`).
    pub query_url: String,

    /// Base IRI that resource and parameter IRIs hang off.
    #[serde(default = "default_base_iri")]
    pub base_iri: String,

    /// Optional named graph; the default graph is used when absent.
    #[serde(default)]
    pub graph: Option<String>,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_base_iri() -> String {
    "urn:relay:".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

pub struct SparqlStore {
    config: SparqlConfig,
    http: reqwest::Client,
}

impl SparqlStore {
    pub fn new(config: SparqlConfig) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|e| MetadataError::ClientSetup(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn subject_iri(&self, subject: &str) -> String {
        format!("<{}resource/{}>", self.config.base_iri, encode_segment(subject))
    }

    fn predicate_iri(&self, predicate: &str) -> String {
        format!("<{}parameter/{}>", self.config.base_iri, encode_segment(predicate))
    }

    /// Wrap a pattern in `GRAPH <g> { ... }` when a named graph is configured.
    fn in_graph(&self, pattern: &str) -> String {
        match &self.config.graph {
            Some(g) => format!("GRAPH <{g}> {{ {pattern} }}"),
            None => pattern.to_string(),
        }
    }

    fn upsert_statement(&self, m: &MetadataMutation) -> String {
        let s = self.subject_iri(&m.subject);
        let p = self.predicate_iri(&m.predicate);
        let o = literal(&m.object);
        format!(
            "DELETE {{ {del} }} INSERT {{ {ins} }} WHERE {{ OPTIONAL {{ {opt} }} }}",
            del = self.in_graph(&format!("{s} {p} ?old")),
            ins = self.in_graph(&format!("{s} {p} {o}")),
            opt = self.in_graph(&format!("{s} {p} ?old")),
        )
    }

    async fn query(&self, query: &str) -> Result<Value, MetadataError> {
        let response = self
            .http
            .post(&self.config.query_url)
            .header("Accept", "application/sparql-results+json")
            .form(&[("query", query)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }

    async fn update(&self, statement: &str) -> Result<(), MetadataError> {
        self.http
            .post(&self.config.update_url)
            .form(&[("update", statement)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SparqlStore {
    async fn upsert(&self, mutation: &MetadataMutation) -> Result<Ack, MetadataError> {
        if mutation.subject.is_empty() || mutation.predicate.is_empty() {
            return Err(MetadataError::InvalidMutation(
                "subject and predicate must be non-empty".into(),
            ));
        }

        let ask = format!(
            "ASK {{ {} }}",
            self.in_graph(&format!(
                "{} {} {}",
                self.subject_iri(&mutation.subject),
                self.predicate_iri(&mutation.predicate),
                literal(&mutation.object)
            ))
        );
        let answer = self.query(&ask).await?;
        let present = answer
            .get("boolean")
            .and_then(Value::as_bool)
            .ok_or_else(|| MetadataError::BadResponse("ASK result has no boolean".into()))?;
        if present {
            return Ok(Ack::Unchanged);
        }

        self.update(&self.upsert_statement(mutation)).await?;
        tracing::debug!(
            subject = %mutation.subject,
            predicate = %mutation.predicate,
            "sparql upsert committed"
        );
        Ok(Ack::Applied)
    }

    async fn get(&self, subject: &str, predicate: &str) -> Result<Option<String>, MetadataError> {
        let select = format!(
            "SELECT ?o WHERE {{ {} }} LIMIT 1",
            self.in_graph(&format!(
                "{} {} ?o",
                self.subject_iri(subject),
                self.predicate_iri(predicate)
            ))
        );
        let result = self.query(&select).await?;
        Ok(bindings(&result)
            .first()
            .and_then(|b| binding_value(b, "o")))
    }

    async fn triples_for(&self, subject: &str) -> Result<Vec<Triple>, MetadataError> {
        let select = format!(
            "SELECT ?p ?o WHERE {{ {} }} ORDER BY ?p",
            self.in_graph(&format!("{} ?p ?o", self.subject_iri(subject)))
        );
        let result = self.query(&select).await?;
        let prefix = format!("{}parameter/", self.config.base_iri);

        let mut triples = Vec::new();
        for binding in bindings(&result) {
            let (Some(p), Some(o)) = (binding_value(binding, "p"), binding_value(binding, "o"))
            else {
                continue;
            };
            // Only predicates the relay itself writes.
            if let Some(name) = p.strip_prefix(&prefix) {
                triples.push(Triple {
                    subject: subject.to_string(),
                    predicate: decode_segment(name),
                    object: o,
                });
            }
        }
        Ok(triples)
    }

    fn name(&self) -> &str {
        "sparql"
    }
}

fn bindings(result: &Value) -> &[Value] {
    result
        .pointer("/results/bindings")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn binding_value(binding: &Value, var: &str) -> Option<String> {
    binding
        .get(var)
        .and_then(|v| v.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Quote a string as a SPARQL literal.
fn literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Percent-encode everything outside the IRI unreserved set.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_segment(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SparqlStore {
        SparqlStore::new(SparqlConfig {
            update_url: "http://localhost:3030/relay/update".into(),
            query_url: "http://localhost:3030/relay/query".into(),
            base_iri: "http://example.org/fusion/".into(),
            graph: None,
            http_timeout_ms: 1_000,
        })
        .unwrap()
    }

    #[test]
    fn iris_are_built_under_the_base() {
        let s = store();
        assert_eq!(s.subject_iri("01234"), "<http://example.org/fusion/resource/01234>");
        assert_eq!(
            s.predicate_iri("Major Radius"),
            "<http://example.org/fusion/parameter/Major%20Radius>"
        );
    }

    #[test]
    fn segment_encoding_round_trips() {
        for raw in ["MajorRadius", "a b/c", "li6_en", "x%y"] {
            assert_eq!(decode_segment(&encode_segment(raw)), raw);
        }
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(literal("8.5"), "\"8.5\"");
        assert_eq!(literal("say \"hi\"\n"), "\"say \\\"hi\\\"\\n\"");
    }

    #[test]
    fn upsert_replaces_previous_object() {
        let stmt = store().upsert_statement(&MetadataMutation::new("01234", "MajorRadius", "8.5"));
        assert!(stmt.starts_with("DELETE {"));
        assert!(stmt.contains("?old"));
        assert!(stmt.contains("INSERT {"));
        assert!(stmt.contains("\"8.5\""));
        assert!(stmt.contains("OPTIONAL"));
    }

    #[test]
    fn named_graph_wraps_patterns() {
        let mut config = store().config.clone();
        config.graph = Some("urn:relay:graph".into());
        let s = SparqlStore::new(config).unwrap();
        let stmt = s.upsert_statement(&MetadataMutation::new("a", "b", "c"));
        assert_eq!(stmt.matches("GRAPH <urn:relay:graph>").count(), 3);
    }

    #[test]
    fn bindings_are_read_from_results_json() {
        let result: Value = serde_json::json!({
            "head": {"vars": ["o"]},
            "results": {"bindings": [{"o": {"type": "literal", "value": "8.5"}}]}
        });
        let rows = bindings(&result);
        assert_eq!(rows.len(), 1);
        assert_eq!(binding_value(&rows[0], "o").as_deref(), Some("8.5"));
        assert!(bindings(&serde_json::json!({"boolean": true})).is_empty());
    }
}
