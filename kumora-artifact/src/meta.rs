//! Artifact metadata: parsing, defaults and serialization.
//!
//! Incoming metadata is JSON-shaped text; known fields are extracted by
//! name and unknown keys are ignored. `artifact_type`, `owner` and
//! `schema_version` are required.

use serde_json::{json, Value};

use kumora_core::error::{Error, Result};

/// Structured metadata attached to every artifact key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactMeta {
    pub artifact_type: String,
    pub owner: String,
    pub schema_version: String,
    pub model_id: String,
    pub tokenizer_id: String,
    pub dataset_id: String,
    pub source_id: String,
    pub chunk_id: String,
    pub source_rev: String,
    pub snapshot_epoch: String,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    pub size_bytes: usize,
    pub content_hash: String,
    pub miss_cost: f64,
}

impl ArtifactMeta {
    /// Parse metadata text, requiring `artifact_type`, `owner` and
    /// `schema_version`.
    pub fn parse(json_text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json_text).map_err(|_| Error::Artifact {
            message: "meta_json is not valid json".to_string(),
        })?;
        let required = |field: &str| -> Result<String> {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Artifact {
                    message: "meta_json missing required fields".to_string(),
                })
        };
        let optional = |field: &str| -> String {
            value
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            artifact_type: required("artifact_type")?,
            owner: required("owner")?,
            schema_version: required("schema_version")?,
            model_id: optional("model_id"),
            tokenizer_id: optional("tokenizer_id"),
            dataset_id: optional("dataset_id"),
            source_id: optional("source_id"),
            chunk_id: optional("chunk_id"),
            source_rev: optional("source_rev"),
            snapshot_epoch: optional("snapshot_epoch"),
            created_at_ms: value.get("created_at").and_then(Value::as_u64).unwrap_or(0),
            ttl_ms: value.get("ttl_deadline").and_then(Value::as_u64).unwrap_or(0),
            size_bytes: value
                .get("size_bytes")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            content_hash: optional("content_hash"),
            miss_cost: value.get("miss_cost").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }

    /// Serialize for wire replies.
    pub fn to_json(&self) -> String {
        json!({
            "artifact_type": self.artifact_type,
            "owner": self.owner,
            "schema_version": self.schema_version,
            "model_id": self.model_id,
            "created_at": self.created_at_ms,
            "ttl_deadline": self.ttl_ms,
            "size_bytes": self.size_bytes,
            "content_hash": self.content_hash,
            "tenant": "local",
            "snapshot_epoch": self.snapshot_epoch,
            "source_rev": self.source_rev,
        })
        .to_string()
    }
}

/// Default miss cost by artifact type, feeding the cost-aware policy.
pub fn default_miss_cost(artifact_type: &str) -> f64 {
    match artifact_type {
        "embedding" => 8.0,
        "rerank_buffer" => 3.0,
        "response" => 4.0,
        "prompt" => 2.0,
        "rag_chunk" => 2.5,
        _ => 1.0,
    }
}

/// Default TTL by owner, in milliseconds.
pub fn owner_ttl_default_ms(owner: &str) -> u64 {
    match owner {
        "rerank" => 5 * 60 * 1000,
        "response" => 60 * 60 * 1000,
        "prompt" => 24 * 60 * 60 * 1000,
        "vector" => 7 * 24 * 60 * 60 * 1000,
        "rag" => 6 * 60 * 60 * 1000,
        _ => 60 * 60 * 1000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_mandatory_fields() {
        let err = ArtifactMeta::parse(r#"{"artifact_type": "embedding"}"#);
        assert!(err.is_err());
        let ok = ArtifactMeta::parse(
            r#"{"artifact_type": "embedding", "owner": "vector", "schema_version": "v1"}"#,
        )
        .unwrap();
        assert_eq!(ok.artifact_type, "embedding");
        assert_eq!(ok.owner, "vector");
        assert_eq!(ok.created_at_ms, 0);
    }

    #[test]
    fn parse_reads_optional_fields_and_ignores_unknown() {
        let m = ArtifactMeta::parse(
            r#"{"artifact_type": "response", "owner": "response", "schema_version": "v2",
                "model_id": "m9", "snapshot_epoch": "e4", "ttl_deadline": 5000,
                "miss_cost": 6.5, "some_future_field": [1, 2, 3]}"#,
        )
        .unwrap();
        assert_eq!(m.model_id, "m9");
        assert_eq!(m.snapshot_epoch, "e4");
        assert_eq!(m.ttl_ms, 5000);
        assert_eq!(m.miss_cost, 6.5);
    }

    #[test]
    fn json_round_trip_preserves_identity_fields() {
        let m = ArtifactMeta {
            artifact_type: "prompt".to_string(),
            owner: "prompt".to_string(),
            schema_version: "v1".to_string(),
            model_id: "m1".to_string(),
            snapshot_epoch: "e9".to_string(),
            created_at_ms: 123,
            ttl_ms: 456,
            size_bytes: 7,
            content_hash: "abcd".to_string(),
            ..ArtifactMeta::default()
        };
        let parsed = ArtifactMeta::parse(&m.to_json()).unwrap();
        assert_eq!(parsed.artifact_type, m.artifact_type);
        assert_eq!(parsed.owner, m.owner);
        assert_eq!(parsed.schema_version, m.schema_version);
        assert_eq!(parsed.model_id, m.model_id);
        assert_eq!(parsed.snapshot_epoch, m.snapshot_epoch);
        assert_eq!(parsed.content_hash, m.content_hash);
    }

    #[test]
    fn type_defaults() {
        assert_eq!(default_miss_cost("embedding"), 8.0);
        assert_eq!(default_miss_cost("unknown"), 1.0);
        assert_eq!(owner_ttl_default_ms("vector"), 7 * 24 * 60 * 60 * 1000);
        assert_eq!(owner_ttl_default_ms("whoever"), 60 * 60 * 1000);
    }
}
