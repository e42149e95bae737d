//! Command dispatcher: maps framed commands onto engine and artifact-layer
//! calls, and owns the slowlog ring and the per-op trace sampler.
//!
//! Engine methods are invoked synchronously from a single task; the
//! dispatcher never suspends.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use kumora_artifact::ArtifactCache;
use kumora_core::hash::fnv1a_64;
use kumora_core::metrics::Metrics;
use kumora_core::types::now_ms;
use kumora_engine::{policy_by_name, Engine};

use crate::resp::{resp_array, resp_bulk, resp_error, resp_integer, resp_null, resp_simple};

/// Ops slower than this land in the slowlog.
const SLOWLOG_THRESHOLD_US: u64 = 5_000;
const SLOWLOG_CAPACITY: usize = 128;
const TRACE_CAPACITY: usize = 256;
const DEFAULT_TRACE_SAMPLE_RATE: f64 = 0.05;

struct SlowlogEntry {
    ts_ms: i64,
    command: String,
    duration_us: u64,
}

struct TraceSampler {
    enabled: bool,
    sample_rate: f64,
    seed: u64,
    rng: StdRng,
    ring: VecDeque<String>,
}

impl TraceSampler {
    fn new() -> Self {
        let seed: u64 = rand::random();
        Self {
            enabled: false,
            sample_rate: DEFAULT_TRACE_SAMPLE_RATE,
            seed,
            rng: StdRng::seed_from_u64(seed),
            ring: VecDeque::new(),
        }
    }
}

pub struct Dispatcher {
    engine: Engine,
    artifacts: ArtifactCache,
    metrics: Metrics,
    slowlog: VecDeque<SlowlogEntry>,
    trace: TraceSampler,
}

impl Dispatcher {
    pub fn new(engine: Engine, artifacts: ArtifactCache, metrics: Metrics) -> Self {
        Self {
            engine,
            artifacts,
            metrics,
            slowlog: VecDeque::new(),
            trace: TraceSampler::new(),
        }
    }

    /// Periodic maintenance, forwarded to the engine.
    pub fn tick(&mut self) {
        self.engine.tick();
    }

    /// Execute one framed command and encode the reply.
    pub fn dispatch(&mut self, args: &[Bytes]) -> Vec<u8> {
        let start = Instant::now();
        if args.is_empty() {
            self.metrics.record_rejected();
            return resp_error("empty command");
        }
        let cmd = String::from_utf8_lossy(&args[0]).to_uppercase();
        let reply = self.execute(&cmd, args);
        let elapsed_us = start.elapsed().as_micros() as u64;

        if elapsed_us > SLOWLOG_THRESHOLD_US {
            self.slowlog.push_back(SlowlogEntry {
                ts_ms: now_ms(),
                command: cmd.clone(),
                duration_us: elapsed_us,
            });
            if self.slowlog.len() > SLOWLOG_CAPACITY {
                self.slowlog.pop_front();
            }
            self.metrics.record_slowlog();
        }
        let ok = !reply.starts_with(b"-");
        if !ok {
            self.metrics.record_rejected();
        }
        self.maybe_trace(&cmd, args, ok, elapsed_us);
        reply
    }

    fn execute(&mut self, cmd: &str, args: &[Bytes]) -> Vec<u8> {
        match cmd {
            "PING" => resp_simple("PONG"),
            "SET" => self.cmd_set(args),
            "GET" => {
                if args.len() != 2 {
                    return resp_error("GET key");
                }
                match self.engine.get(&text(&args[1])) {
                    Some(value) => resp_bulk(&value),
                    None => resp_null(),
                }
            }
            "MGET" => {
                if args.len() < 2 {
                    return resp_error("MGET key [key...]");
                }
                let keys: Vec<String> = args[1..].iter().map(|a| text(a)).collect();
                let values = self.engine.mget(&keys);
                let items: Vec<Vec<u8>> = values
                    .into_iter()
                    .map(|v| v.map(|b| resp_bulk(&b)).unwrap_or_else(resp_null))
                    .collect();
                resp_array(&items)
            }
            "DEL" => {
                if args.len() < 2 {
                    return resp_error("DEL key [key...]");
                }
                let keys: Vec<String> = args[1..].iter().map(|a| text(a)).collect();
                resp_integer(self.engine.del(&keys) as i64)
            }
            "EXPIRE" => {
                if args.len() != 3 {
                    return resp_error("EXPIRE key seconds");
                }
                match parse_u64(&args[2]) {
                    Some(secs) => {
                        resp_integer(i64::from(self.engine.expire(&text(&args[1]), secs)))
                    }
                    None => resp_error("invalid numeric argument"),
                }
            }
            "TTL" => {
                if args.len() != 2 {
                    return resp_error("TTL key");
                }
                resp_integer(self.engine.ttl(&text(&args[1])))
            }
            "INFO" => {
                let snapshot = self.metrics.snapshot();
                let mut info = self.engine.info();
                info.push_str(&format!(
                    "connected_clients:{}\n",
                    snapshot.active_connections
                ));
                info.push_str(&format!(
                    "rejected_requests:{}\n",
                    snapshot.rejected_requests
                ));
                info.push_str(&format!(
                    "avg_request_bytes:{}\n",
                    snapshot.avg_request_bytes()
                ));
                resp_bulk(info.as_bytes())
            }
            "CONFIG" => self.cmd_config(args),
            "SLOWLOG" => self.cmd_slowlog(args),
            "TRACE" => self.cmd_trace(args),
            "DEBUG" => {
                if args.len() == 3 && text(&args[1]).to_uppercase() == "DUMPSTATS" {
                    let path = PathBuf::from(text(&args[2]));
                    match self.engine.dump_stats(&path) {
                        Ok(()) => resp_simple("OK"),
                        Err(e) => resp_error(&e.to_string()),
                    }
                } else {
                    resp_error("DEBUG DUMPSTATS <path>")
                }
            }
            "AI.PUT" => {
                if args.len() != 5 {
                    return resp_error("AI.PUT <type> <key> <meta_json> <payload_bytes>");
                }
                let result = self.artifacts.put(
                    &mut self.engine,
                    &text(&args[1]),
                    &text(&args[2]),
                    &text(&args[3]),
                    args[4].clone(),
                );
                match result {
                    Ok(()) => resp_simple("OK"),
                    Err(e) => resp_error(&e.to_string()),
                }
            }
            "AI.GET" => {
                if args.len() != 2 {
                    return resp_error("AI.GET <key>");
                }
                self.artifact_reply(&text(&args[1]))
            }
            "AI.MGET" => {
                if args.len() < 2 {
                    return resp_error("AI.MGET <key...>");
                }
                let items: Vec<Vec<u8>> = args[1..]
                    .iter()
                    .map(|k| self.artifact_reply(&text(k)))
                    .collect();
                resp_array(&items)
            }
            "AI.EMB.PUT" => self.cmd_emb_put(args),
            "AI.EMB.GET" => {
                if args.len() != 2 {
                    return resp_error("AI.EMB.GET <key>");
                }
                self.artifact_reply(&text(&args[1]))
            }
            "AI.INVALIDATE" => {
                if args.len() != 3 {
                    return resp_error("AI.INVALIDATE EPOCH|MODEL|PREFIX <value>");
                }
                let value = text(&args[2]);
                let removed = match text(&args[1]).to_uppercase().as_str() {
                    "EPOCH" => self.artifacts.invalidate_epoch(&mut self.engine, &value),
                    "MODEL" => self.artifacts.invalidate_model(&mut self.engine, &value),
                    "PREFIX" => self.artifacts.invalidate_prefix(&mut self.engine, &value),
                    _ => return resp_error("AI.INVALIDATE EPOCH|MODEL|PREFIX <value>"),
                };
                resp_integer(removed as i64)
            }
            "AI.STATS" => resp_bulk(self.artifacts.stats_report().as_bytes()),
            "AI.TOP" => {
                if args.len() < 2 {
                    return resp_error("AI.TOP HOT|COSTLY [N]");
                }
                let n = match args.get(2) {
                    Some(raw) => match parse_u64(raw) {
                        Some(n) => n as usize,
                        None => return resp_error("invalid numeric argument"),
                    },
                    None => 10,
                };
                match text(&args[1]).to_uppercase().as_str() {
                    "HOT" => resp_bulk(self.artifacts.top_hot(n).as_bytes()),
                    "COSTLY" => resp_bulk(self.artifacts.top_costly(n).as_bytes()),
                    _ => resp_error("AI.TOP HOT|COSTLY [N]"),
                }
            }
            "AI.EXPLAIN" => {
                if args.len() != 2 {
                    return resp_error("AI.EXPLAIN <key>");
                }
                resp_bulk(self.artifacts.explain(&text(&args[1])).as_bytes())
            }
            _ => resp_error("unknown command"),
        }
    }

    fn cmd_set(&mut self, args: &[Bytes]) -> Vec<u8> {
        if args.len() < 3 {
            return resp_error("SET key value [EX sec|PX ms] [OWNER name]");
        }
        let mut ttl_ms: Option<u64> = None;
        let mut owner = "default".to_string();
        let mut i = 3;
        while i + 1 < args.len() {
            let opt = text(&args[i]).to_uppercase();
            match opt.as_str() {
                "EX" => match parse_u64(&args[i + 1]) {
                    Some(secs) => ttl_ms = Some(secs * 1000),
                    None => return resp_error("invalid numeric argument"),
                },
                "PX" => match parse_u64(&args[i + 1]) {
                    Some(ms) => ttl_ms = Some(ms),
                    None => return resp_error("invalid numeric argument"),
                },
                "OWNER" => owner = text(&args[i + 1]),
                _ => return resp_error("SET key value [EX sec|PX ms] [OWNER name]"),
            }
            i += 2;
        }
        match self
            .engine
            .set(&text(&args[1]), args[2].clone(), ttl_ms, &owner)
        {
            Ok(()) => resp_simple("OK"),
            Err(e) => resp_error(&e.to_string()),
        }
    }

    fn cmd_config(&mut self, args: &[Bytes]) -> Vec<u8> {
        if args.len() >= 2 && text(&args[1]).to_uppercase() == "GET" {
            if args.len() == 3 && text(&args[2]).to_uppercase() == "POLICY" {
                return resp_array(&[
                    resp_bulk(b"policy"),
                    resp_bulk(self.engine.policy_name().as_bytes()),
                ]);
            }
            if args.len() == 3 && text(&args[2]).to_uppercase() == "CANARY" {
                return resp_array(&[
                    resp_bulk(b"canary"),
                    resp_bulk(self.engine.canary_pct().to_string().as_bytes()),
                ]);
            }
            return resp_error("unsupported CONFIG GET");
        }
        if args.len() >= 2 && text(&args[1]).to_uppercase() == "SET" {
            if args.len() == 4 && text(&args[2]).to_uppercase() == "POLICY" {
                self.engine.set_policy(policy_by_name(&text(&args[3])));
                return resp_simple("OK");
            }
            if args.len() == 4 && text(&args[2]).to_uppercase() == "PARAMS" {
                let path = PathBuf::from(text(&args[3]));
                return match self.engine.reload_params(&path) {
                    Ok(()) => resp_simple("OK"),
                    Err(e) => resp_error(&e.to_string()),
                };
            }
            if args.len() == 4 && text(&args[2]).to_uppercase() == "CANARY" {
                return match parse_u64(&args[3]) {
                    Some(pct) => {
                        self.engine.set_canary_pct(pct);
                        resp_simple("OK")
                    }
                    None => resp_error("invalid numeric argument"),
                };
            }
            return resp_error("unsupported CONFIG SET");
        }
        resp_error("CONFIG GET|SET")
    }

    fn cmd_slowlog(&mut self, args: &[Bytes]) -> Vec<u8> {
        if args.len() == 2 && text(&args[1]).to_uppercase() == "RESET" {
            self.slowlog.clear();
            return resp_simple("OK");
        }
        let items: Vec<Vec<u8>> = self
            .slowlog
            .iter()
            .map(|e| {
                resp_array(&[
                    resp_integer(e.ts_ms),
                    resp_integer(e.duration_us as i64),
                    resp_bulk(e.command.as_bytes()),
                ])
            })
            .collect();
        resp_array(&items)
    }

    fn cmd_trace(&mut self, args: &[Bytes]) -> Vec<u8> {
        if args.len() < 2 || text(&args[1]).to_uppercase() != "STREAM" {
            return resp_error("TRACE STREAM <0|1|GET>");
        }
        match args.get(2).map(|a| text(a).to_uppercase()) {
            Some(arg) if arg == "1" => {
                self.trace.enabled = true;
                resp_simple("OK")
            }
            Some(arg) if arg == "0" => {
                self.trace.enabled = false;
                resp_simple("OK")
            }
            Some(arg) if arg == "GET" => {
                let mut out = String::new();
                for line in &self.trace.ring {
                    out.push_str(line);
                    out.push('\n');
                }
                resp_bulk(out.as_bytes())
            }
            _ => resp_error("TRACE STREAM <0|1|GET>"),
        }
    }

    fn cmd_emb_put(&mut self, args: &[Bytes]) -> Vec<u8> {
        if args.len() != 7 {
            return resp_error(
                "AI.EMB.PUT <key> <model_id> <dim> <dtype> <ttl_sec> <vector_bytes>",
            );
        }
        let dim = match parse_u64(&args[3]) {
            Some(d) => d,
            None => return resp_error("invalid numeric argument"),
        };
        let ttl_s = match parse_u64(&args[5]) {
            Some(t) => t,
            None => return resp_error("invalid numeric argument"),
        };
        let dtype = text(&args[4]);
        if dtype != "float" && dtype != "float16" && dtype != "int8" {
            return resp_error("invalid vector header");
        }
        let meta = json!({
            "artifact_type": "embedding",
            "owner": "vector",
            "schema_version": "v1",
            "model_id": text(&args[2]),
            "dim": dim,
            "dtype": dtype,
            "ttl_deadline": ttl_s * 1000,
        })
        .to_string();
        match self.artifacts.put(
            &mut self.engine,
            "embedding",
            &text(&args[1]),
            &meta,
            args[6].clone(),
        ) {
            Ok(()) => resp_simple("OK"),
            Err(e) => resp_error(&e.to_string()),
        }
    }

    fn artifact_reply(&mut self, key: &str) -> Vec<u8> {
        match self.artifacts.get(&mut self.engine, key) {
            Some(value) => resp_array(&[
                resp_bulk(value.meta.to_json().as_bytes()),
                resp_bulk(&value.payload),
            ]),
            None => resp_null(),
        }
    }

    fn maybe_trace(&mut self, cmd: &str, args: &[Bytes], ok: bool, elapsed_us: u64) {
        if !self.trace.enabled {
            return;
        }
        if self.trace.rng.gen::<f64>() > self.trace.sample_rate {
            return;
        }
        let key_hash = args.get(1).map(|a| fnv1a_64(a)).unwrap_or(0);
        let value_size = match cmd {
            "SET" => args.get(2).map(|a| a.len()).unwrap_or(0),
            "AI.PUT" => args.get(4).map(|a| a.len()).unwrap_or(0),
            "AI.EMB.PUT" => args.get(6).map(|a| a.len()).unwrap_or(0),
            _ => 0,
        };
        let (ttl_class, owner) = set_options(args);
        let record = json!({
            "ts_ms": now_ms(),
            "op": cmd,
            "key_hash": format!("{:016x}", key_hash),
            "value_size": value_size,
            "ttl_class": ttl_class,
            "owner": owner,
            "result": if ok { "ok" } else { "err" },
            "lat_bucket": elapsed_us.max(1).next_power_of_two(),
            "policy_version": self.engine.params_version(),
            "rng_seed": self.trace.seed,
        })
        .to_string();
        debug!(target: "kumora::trace", %record, "op sampled");
        self.trace.ring.push_back(record);
        if self.trace.ring.len() > TRACE_CAPACITY {
            self.trace.ring.pop_front();
        }
    }

}

/// Classify a SET command's TTL and owner options for trace records.
fn set_options(args: &[Bytes]) -> (&'static str, String) {
    let mut ttl_class = "none";
    let mut owner = "default".to_string();
    let mut i = 3;
    while i + 1 < args.len() {
        let opt = text(&args[i]).to_uppercase();
        let ttl_ms = match opt.as_str() {
            "EX" => parse_u64(&args[i + 1]).map(|s| s * 1000),
            "PX" => parse_u64(&args[i + 1]),
            "OWNER" => {
                owner = text(&args[i + 1]);
                None
            }
            _ => None,
        };
        if let Some(ms) = ttl_ms {
            ttl_class = match ms {
                0..=59_999 => "short",
                60_000..=3_599_999 => "medium",
                _ => "long",
            };
        }
        i += 2;
    }
    (ttl_class, owner)
}

fn text(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

fn parse_u64(arg: &Bytes) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
