//! Policy-parameter file handling.
//!
//! The params file is JSON-shaped text: known fields are extracted by name,
//! unknown keys are ignored, and out-of-range values are clamped to their
//! documented ranges. Text without `{`...`}` delimiters is rejected as
//! `params_invalid_schema`. The most recently accepted control text is
//! mirrored verbatim to a last-known-good file under the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use kumora_core::error::{Error, Result};

use crate::policy::PolicyParams;

/// Last-known-good params file, scoped by `data_dir`.
pub const LKG_FILE_NAME: &str = ".pomai_lkg_params.json";

/// Parse params text over a base configuration, clamping every recognized
/// field to its documented range.
pub fn parse_params_text(text: &str, base: &PolicyParams) -> Result<PolicyParams> {
    if !text.contains('{') || !text.contains('}') {
        return Err(Error::ParamsInvalidSchema);
    }
    let value: Value = serde_json::from_str(text).map_err(|_| Error::ParamsInvalidSchema)?;

    let mut p = base.clone();
    if let Some(v) = value.get("w_miss").and_then(Value::as_f64) {
        p.w_miss = v.clamp(0.0, 1000.0);
    }
    if let Some(v) = value.get("w_reuse").and_then(Value::as_f64) {
        p.w_reuse = v.clamp(0.0, 1000.0);
    }
    if let Some(v) = value.get("w_mem").and_then(Value::as_f64) {
        p.w_mem = v.clamp(0.0, 1000.0);
    }
    if let Some(v) = value.get("w_risk").and_then(Value::as_f64) {
        p.w_risk = v.clamp(0.0, 1000.0);
    }
    if let Some(v) = value.get("admit_threshold").and_then(Value::as_f64) {
        p.admit_threshold = v.clamp(-1e9, 1e9);
    }
    if let Some(v) = value.get("evict_pressure").and_then(Value::as_f64) {
        p.evict_pressure = v.clamp(0.1, 1.0);
    }
    if let Some(v) = value.get("max_evictions_per_second").and_then(Value::as_u64) {
        p.max_evictions_per_second = v.clamp(1, 1_000_000);
    }
    if let Some(v) = value.get("max_admissions_per_second").and_then(Value::as_u64) {
        p.max_admissions_per_second = v.clamp(1, 1_000_000);
    }
    if let Some(v) = value.get("owner_cap_bytes").and_then(Value::as_u64) {
        p.owner_cap_bytes = v.min(1u64 << 40);
    }
    if let Some(v) = value.get("version").and_then(Value::as_str) {
        p.version = v.to_string();
    }
    Ok(p)
}

/// Read and parse a params file, returning the parsed params and the raw
/// text (kept for the last-known-good mirror).
pub fn load_params_file(path: &Path, base: &PolicyParams) -> Result<(PolicyParams, String)> {
    let text = fs::read_to_string(path).map_err(|_| Error::ParamsNotFound)?;
    let params = parse_params_text(&text, base)?;
    Ok((params, text))
}

pub fn lkg_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LKG_FILE_NAME)
}

/// Mirror accepted control-params text to the last-known-good file.
pub fn store_lkg(data_dir: &Path, text: &str) -> Result<()> {
    fs::create_dir_all(data_dir)?;
    fs::write(lkg_path(data_dir), text)?;
    info!(path = %lkg_path(data_dir).display(), "last-known-good params saved");
    Ok(())
}

/// Load the last-known-good params. The same clamps apply as on a live
/// reload, so a hand-edited file cannot smuggle out-of-range values.
pub fn load_lkg(data_dir: &Path, base: &PolicyParams) -> Result<PolicyParams> {
    let text = fs::read_to_string(lkg_path(data_dir)).map_err(|_| Error::ParamsNotFound)?;
    parse_params_text(&text, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_and_clamps_fields() {
        let base = PolicyParams::default();
        let p = parse_params_text(
            r#"{"w_miss": 2000.0, "w_reuse": 0.5, "evict_pressure": 0.01,
                "max_admissions_per_second": 0, "owner_cap_bytes": 123,
                "version": "tuned-v7", "unknown_knob": 42}"#,
            &base,
        )
        .unwrap();
        assert_eq!(p.w_miss, 1000.0);
        assert_eq!(p.w_reuse, 0.5);
        assert_eq!(p.evict_pressure, 0.1);
        assert_eq!(p.max_admissions_per_second, 1);
        assert_eq!(p.owner_cap_bytes, 123);
        assert_eq!(p.version, "tuned-v7");
        // Unmentioned fields keep the base values.
        assert_eq!(p.w_mem, base.w_mem);
    }

    #[test]
    fn rejects_text_without_braces() {
        let base = PolicyParams::default();
        assert!(matches!(
            parse_params_text("w_miss: 1", &base),
            Err(Error::ParamsInvalidSchema)
        ));
        assert!(matches!(
            parse_params_text("{not json}", &base),
            Err(Error::ParamsInvalidSchema)
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let base = PolicyParams::default();
        assert!(matches!(
            load_params_file(&dir.path().join("nope.json"), &base),
            Err(Error::ParamsNotFound)
        ));
        assert!(matches!(load_lkg(dir.path(), &base), Err(Error::ParamsNotFound)));
    }

    #[test]
    fn lkg_round_trip_applies_clamps() {
        let dir = TempDir::new().unwrap();
        let base = PolicyParams::default();
        store_lkg(dir.path(), r#"{"w_risk": -5.0, "version": "lkg-v1"}"#).unwrap();
        let p = load_lkg(dir.path(), &base).unwrap();
        assert_eq!(p.w_risk, 0.0);
        assert_eq!(p.version, "lkg-v1");
    }
}
