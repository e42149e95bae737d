//! Artifact layer scenarios: dedup, bulk invalidation, reports.

use bytes::Bytes;
use tempfile::TempDir;

use kumora_artifact::{canonical_embedding_key, ArtifactCache};
use kumora_core::config::EngineConfig;
use kumora_engine::{policy_by_name, Engine};

fn engine_4mib() -> (Engine, TempDir) {
    let dir = TempDir::new().unwrap();
    let cfg = EngineConfig {
        memory_limit_bytes: 4 * 1024 * 1024,
        data_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    (Engine::new(cfg, policy_by_name("pomai_cost")).unwrap(), dir)
}

fn embedding_meta(model: &str, epoch: &str) -> String {
    format!(
        r#"{{"artifact_type": "embedding", "owner": "vector", "schema_version": "v1",
            "model_id": "{}", "snapshot_epoch": "{}"}}"#,
        model, epoch
    )
}

fn response_meta(epoch: &str) -> String {
    format!(
        r#"{{"artifact_type": "response", "owner": "response", "schema_version": "v1",
            "model_id": "m1", "snapshot_epoch": "{}"}}"#,
        epoch
    )
}

#[test]
fn put_get_round_trip() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    let key = canonical_embedding_key("m1", "h1", 768, "float16");
    assert_eq!(key, "emb:m1:h1:768:float16");

    ai.put(
        &mut engine,
        "embedding",
        &key,
        &embedding_meta("m1", "e1"),
        Bytes::from_static(&[1, 2, 3, 4]),
    )
    .unwrap();

    let got = ai.get(&mut engine, &key).unwrap();
    assert_eq!(&got.payload[..], &[1, 2, 3, 4]);
    assert_eq!(got.meta.artifact_type, "embedding");
    assert_eq!(got.meta.owner, "vector");
    assert_eq!(got.meta.model_id, "m1");
    // Defaults were filled in.
    assert!(got.meta.created_at_ms > 0);
    assert_eq!(got.meta.ttl_ms, 7 * 24 * 60 * 60 * 1000);
    assert!(!got.meta.content_hash.is_empty());
    assert_eq!(got.meta.miss_cost, 8.0);
}

#[test]
fn identical_payloads_dedup() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    let meta = embedding_meta("m1", "e1");
    let payload = Bytes::from_static(&[1, 2, 3, 4]);

    ai.put(&mut engine, "embedding", "k1", &meta, payload.clone()).unwrap();
    ai.put(&mut engine, "embedding", "k2", &meta, payload.clone()).unwrap();

    assert!(ai.stats_report().contains("dedup_hits:1"));
    assert!(ai.stats_report().contains("blob_count:1"));
    assert_eq!(&ai.get(&mut engine, "k1").unwrap().payload[..], &[1, 2, 3, 4]);

    // Deleting one reference keeps the blob alive for the other.
    assert_eq!(ai.invalidate_prefix(&mut engine, "k1"), 1);
    assert_eq!(&ai.get(&mut engine, "k2").unwrap().payload[..], &[1, 2, 3, 4]);
    // Dropping the last reference deletes the blob record.
    assert_eq!(ai.invalidate_prefix(&mut engine, "k2"), 1);
    assert!(ai.stats_report().contains("blob_count:0"));
}

#[test]
fn type_mismatch_is_rejected() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    let err = ai.put(
        &mut engine,
        "prompt",
        "k",
        &embedding_meta("m1", "e1"),
        Bytes::from_static(b"x"),
    );
    assert!(err.is_err());
    assert!(ai.get(&mut engine, "k").is_none());
}

#[test]
fn epoch_invalidation_removes_only_that_epoch() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    ai.put(&mut engine, "response", "rsp:a", &response_meta("e2"), Bytes::from_static(b"old"))
        .unwrap();
    ai.put(&mut engine, "response", "rsp:b", &response_meta("e3"), Bytes::from_static(b"new"))
        .unwrap();

    assert_eq!(ai.invalidate_epoch(&mut engine, "e2"), 1);
    assert!(ai.get(&mut engine, "rsp:a").is_none());
    assert_eq!(&ai.get(&mut engine, "rsp:b").unwrap().payload[..], b"new");
    // Unknown epochs invalidate nothing.
    assert_eq!(ai.invalidate_epoch(&mut engine, "e2"), 0);
    assert_eq!(ai.invalidate_epoch(&mut engine, "never-seen"), 0);
}

#[test]
fn model_invalidation() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    ai.put(&mut engine, "embedding", "emb:m1:x", &embedding_meta("m1", "e1"), Bytes::from_static(b"1"))
        .unwrap();
    ai.put(&mut engine, "embedding", "emb:m1:y", &embedding_meta("m1", "e1"), Bytes::from_static(b"2"))
        .unwrap();
    ai.put(&mut engine, "embedding", "emb:m2:z", &embedding_meta("m2", "e1"), Bytes::from_static(b"3"))
        .unwrap();

    assert_eq!(ai.invalidate_model(&mut engine, "m1"), 2);
    assert!(ai.get(&mut engine, "emb:m1:x").is_none());
    assert!(ai.get(&mut engine, "emb:m2:z").is_some());
}

#[test]
fn prefix_invalidation_by_family() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    ai.put(&mut engine, "prompt", "prm:tok:h1", prompt_meta().as_str(), Bytes::from_static(b"1"))
        .unwrap();
    ai.put(&mut engine, "prompt", "prm:tok:h2", prompt_meta().as_str(), Bytes::from_static(b"2"))
        .unwrap();
    ai.put(&mut engine, "response", "rsp:h3", &response_meta("e1"), Bytes::from_static(b"3"))
        .unwrap();

    assert_eq!(ai.invalidate_prefix(&mut engine, "prm:"), 2);
    assert!(ai.get(&mut engine, "prm:tok:h1").is_none());
    assert!(ai.get(&mut engine, "rsp:h3").is_some());
}

fn prompt_meta() -> String {
    r#"{"artifact_type": "prompt", "owner": "prompt", "schema_version": "v1"}"#.to_string()
}

#[test]
fn reput_replaces_and_releases_old_blob() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    let meta = embedding_meta("m1", "e1");
    ai.put(&mut engine, "embedding", "k", &meta, Bytes::from_static(b"first")).unwrap();
    ai.put(&mut engine, "embedding", "k", &meta, Bytes::from_static(b"second")).unwrap();

    assert_eq!(&ai.get(&mut engine, "k").unwrap().payload[..], b"second");
    // Old blob lost its only reference; only the new one remains.
    assert!(ai.stats_report().contains("blob_count:1"));
}

#[test]
fn reports_are_sorted_and_deterministic() {
    let (mut engine, _dir) = engine_4mib();
    let mut ai = ArtifactCache::new();
    ai.put(&mut engine, "embedding", "emb:a", &embedding_meta("m1", "e1"), Bytes::from_static(b"1"))
        .unwrap();
    ai.put(&mut engine, "response", "rsp:b", &response_meta("e1"), Bytes::from_static(b"2"))
        .unwrap();

    ai.get(&mut engine, "emb:a");
    ai.get(&mut engine, "emb:a");
    ai.get(&mut engine, "rsp:b");

    let hot = ai.top_hot(2);
    let mut lines = hot.lines();
    assert_eq!(lines.next(), Some("emb:a:2"));
    assert_eq!(lines.next(), Some("rsp:b:1"));

    let costly = ai.top_costly(1);
    // Embedding carries the highest default miss cost.
    assert!(costly.starts_with("emb:a:8"));

    let report = ai.stats_report();
    assert!(report.contains("type.embedding:1"));
    assert!(report.contains("type.response:1"));

    assert!(ai.explain("emb:a").contains("owner=vector"));
    assert_eq!(ai.explain("nope"), "MISS:no metadata");
}
