//! Dispatcher command-surface tests and an end-to-end socket round trip.

use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use kumora_artifact::ArtifactCache;
use kumora_core::config::EngineConfig;
use kumora_core::metrics::Metrics;
use kumora_engine::{policy_by_name, Engine};
use kumora_server::{serve, Dispatcher, ServerLimits};

fn dispatcher() -> (Dispatcher, TempDir) {
    let dir = TempDir::new().unwrap();
    let cfg = EngineConfig {
        memory_limit_bytes: 4 * 1024 * 1024,
        data_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(cfg, policy_by_name("lru")).unwrap();
    (
        Dispatcher::new(engine, ArtifactCache::new(), Metrics::new()),
        dir,
    )
}

fn cmd(d: &mut Dispatcher, parts: &[&[u8]]) -> Vec<u8> {
    let args: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();
    d.dispatch(&args)
}

fn cmd_str(d: &mut Dispatcher, parts: &[&str]) -> String {
    let raw = cmd(
        d,
        &parts.iter().map(|p| p.as_bytes()).collect::<Vec<_>>(),
    );
    String::from_utf8_lossy(&raw).into_owned()
}

#[test]
fn ping_pongs() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["PING"]), "+PONG\r\n");
}

#[test]
fn set_get_del_round_trip() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["SET", "k", "hello"]), "+OK\r\n");
    assert_eq!(cmd_str(&mut d, &["GET", "k"]), "$5\r\nhello\r\n");
    assert_eq!(cmd_str(&mut d, &["DEL", "k", "ghost"]), ":1\r\n");
    assert_eq!(cmd_str(&mut d, &["GET", "k"]), "$-1\r\n");
}

#[test]
fn set_validates_and_reports_engine_errors() {
    let (mut d, _dir) = dispatcher();
    assert!(cmd_str(&mut d, &["SET", "k"]).starts_with("-ERR SET key value"));
    assert_eq!(
        cmd_str(&mut d, &["SET", "k", "v", "EX", "abc"]),
        "-ERR invalid numeric argument\r\n"
    );
    let long_key = "x".repeat(300);
    assert_eq!(
        cmd_str(&mut d, &["SET", &long_key, "v"]),
        "-ERR invalid key length\r\n"
    );
}

#[test]
fn ttl_wire_semantics() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["TTL", "nope"]), ":-2\r\n");
    cmd_str(&mut d, &["SET", "eternal", "v"]);
    assert_eq!(cmd_str(&mut d, &["TTL", "eternal"]), ":-1\r\n");
    cmd_str(&mut d, &["SET", "timed", "v", "EX", "100"]);
    let reply = cmd_str(&mut d, &["TTL", "timed"]);
    let secs: i64 = reply[1..reply.len() - 2].parse().unwrap();
    assert!((98..=100).contains(&secs));
    assert_eq!(cmd_str(&mut d, &["EXPIRE", "eternal", "50"]), ":1\r\n");
    assert_eq!(cmd_str(&mut d, &["EXPIRE", "nope", "50"]), ":0\r\n");
}

#[test]
fn mget_mixes_hits_and_nulls() {
    let (mut d, _dir) = dispatcher();
    cmd_str(&mut d, &["SET", "a", "1"]);
    assert_eq!(
        cmd_str(&mut d, &["MGET", "a", "b"]),
        "*2\r\n$1\r\n1\r\n$-1\r\n"
    );
}

#[test]
fn config_policy_swap_preserves_params() {
    let (mut d, dir) = dispatcher();
    let path = dir.path().join("p.json");
    std::fs::write(&path, r#"{"version": "wire-v5"}"#).unwrap();
    assert_eq!(
        cmd_str(&mut d, &["CONFIG", "SET", "PARAMS", path.to_str().unwrap()]),
        "+OK\r\n"
    );
    assert_eq!(
        cmd_str(&mut d, &["CONFIG", "SET", "POLICY", "lfu"]),
        "+OK\r\n"
    );
    assert_eq!(
        cmd_str(&mut d, &["CONFIG", "GET", "POLICY"]),
        "*2\r\n$6\r\npolicy\r\n$3\r\nlfu\r\n"
    );
    let info = cmd_str(&mut d, &["INFO"]);
    assert!(info.contains("policy_mode:lfu"));
    assert!(info.contains("policy_params_version:wire-v5"));
}

#[test]
fn config_set_params_missing_file_errors() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(
        cmd_str(&mut d, &["CONFIG", "SET", "PARAMS", "/does/not/exist.json"]),
        "-ERR params file not found\r\n"
    );
}

#[test]
fn info_reports_server_counters() {
    let (mut d, _dir) = dispatcher();
    let info = cmd_str(&mut d, &["INFO"]);
    assert!(info.contains("keys:0"));
    assert!(info.contains("connected_clients:0"));
    assert!(info.contains("rejected_requests:"));
    assert!(info.contains("avg_request_bytes:"));
}

#[test]
fn unknown_command_is_an_error() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["FLUSHALL"]), "-ERR unknown command\r\n");
}

#[test]
fn slowlog_surface() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["SLOWLOG"]), "*0\r\n");
    assert_eq!(cmd_str(&mut d, &["SLOWLOG", "RESET"]), "+OK\r\n");
}

#[test]
fn trace_stream_toggle_and_dump() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(cmd_str(&mut d, &["TRACE", "STREAM", "1"]), "+OK\r\n");
    cmd_str(&mut d, &["SET", "k", "v"]);
    let dump = cmd_str(&mut d, &["TRACE", "STREAM", "GET"]);
    assert!(dump.starts_with('$'));
    assert_eq!(cmd_str(&mut d, &["TRACE", "STREAM", "0"]), "+OK\r\n");
}

#[test]
fn debug_dumpstats_writes_file() {
    let (mut d, dir) = dispatcher();
    let path = dir.path().join("stats.txt");
    assert_eq!(
        cmd_str(&mut d, &["DEBUG", "DUMPSTATS", path.to_str().unwrap()]),
        "+OK\r\n"
    );
    let dumped = std::fs::read_to_string(&path).unwrap();
    assert!(dumped.contains("memory_limit_bytes:"));
}

#[test]
fn ai_put_get_invalidate() {
    let (mut d, _dir) = dispatcher();
    let meta = r#"{"artifact_type":"response","owner":"response","schema_version":"v1","model_id":"m1","snapshot_epoch":"e2"}"#;
    assert_eq!(
        cmd_str(&mut d, &["AI.PUT", "response", "rsp:k1", meta, "payload"]),
        "+OK\r\n"
    );
    let reply = cmd_str(&mut d, &["AI.GET", "rsp:k1"]);
    assert!(reply.starts_with("*2\r\n"));
    assert!(reply.contains("\"artifact_type\":\"response\""));
    assert!(reply.contains("payload"));

    assert_eq!(cmd_str(&mut d, &["AI.INVALIDATE", "EPOCH", "e2"]), ":1\r\n");
    assert_eq!(cmd_str(&mut d, &["AI.GET", "rsp:k1"]), "$-1\r\n");
    assert_eq!(cmd_str(&mut d, &["AI.INVALIDATE", "EPOCH", "e9"]), ":0\r\n");
}

#[test]
fn ai_type_mismatch_rejected() {
    let (mut d, _dir) = dispatcher();
    let meta = r#"{"artifact_type":"response","owner":"response","schema_version":"v1"}"#;
    let reply = cmd_str(&mut d, &["AI.PUT", "prompt", "k", meta, "x"]);
    assert!(reply.starts_with("-ERR"));
}

#[test]
fn ai_emb_put_validates_dtype() {
    let (mut d, _dir) = dispatcher();
    assert_eq!(
        cmd_str(
            &mut d,
            &["AI.EMB.PUT", "emb:k", "m1", "768", "float64", "60", "bytes"]
        ),
        "-ERR invalid vector header\r\n"
    );
    assert_eq!(
        cmd_str(
            &mut d,
            &["AI.EMB.PUT", "emb:k", "m1", "768", "float16", "60", "bytes"]
        ),
        "+OK\r\n"
    );
    let reply = cmd_str(&mut d, &["AI.EMB.GET", "emb:k"]);
    assert!(reply.contains("\"artifact_type\":\"embedding\""));
}

#[test]
fn ai_stats_and_top() {
    let (mut d, _dir) = dispatcher();
    let meta = r#"{"artifact_type":"prompt","owner":"prompt","schema_version":"v1"}"#;
    cmd_str(&mut d, &["AI.PUT", "prompt", "prm:a", meta, "1"]);
    cmd_str(&mut d, &["AI.GET", "prm:a"]);
    let stats = cmd_str(&mut d, &["AI.STATS"]);
    assert!(stats.contains("puts:1"));
    assert!(stats.contains("type.prompt:1"));
    let hot = cmd_str(&mut d, &["AI.TOP", "HOT", "3"]);
    assert!(hot.contains("prm:a:1"));
    assert!(cmd_str(&mut d, &["AI.EXPLAIN", "prm:a"]).contains("owner=prompt"));
}

#[tokio::test]
async fn end_to_end_socket_round_trip() {
    let dir = TempDir::new().unwrap();
    let cfg = EngineConfig {
        memory_limit_bytes: 4 * 1024 * 1024,
        data_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(cfg, policy_by_name("lru")).unwrap();
    let metrics = Metrics::new();
    let dispatcher = Dispatcher::new(engine, ArtifactCache::new(), metrics.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, dispatcher, metrics, ServerLimits::default()));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"*1\r\n$4\r\nPING\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let expected = b"+PONG\r\n+OK\r\n$5\r\nhello\r\n";
    let mut buf = [0u8; 256];
    while received.len() < expected.len() {
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&received[..], expected);
}
